//! Per-tenant circuit-breaker backoff state
//!
//! The stats registry tracks an exponential backoff per `(tenant, destination
//! type)` pair. The registry only records and exposes this state; deciding to
//! actually block a tenant (and resetting the breaker after recovery) is a
//! policy decision that belongs to the dispatch loop, not to this crate.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Circuit-breaker tuning knobs, deserializable from the `tenantStats`
/// configuration section.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BackoffConfig {
    /// First backoff interval, in seconds.
    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: u64,
    /// Ceiling for the backoff interval, in seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Multiplier applied on every consecutive trip.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Spread each interval by a pseudo-random multiplier in `[1, 2)`.
    #[serde(default)]
    pub randomize: bool,
}

fn default_min_backoff_secs() -> u64 {
    10
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_backoff_factor() -> f64 {
    1.5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff_secs: default_min_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            backoff_factor: default_backoff_factor(),
            randomize: false,
        }
    }
}

impl BackoffConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_secs(self.min_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Backoff state for a single `(tenant, destination type)` pair.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    randomize: bool,
    trips: u32,
    time_to_retry: DateTime<Utc>,
}

impl Backoff {
    pub(crate) fn new(config: &BackoffConfig, min: Duration, now: DateTime<Utc>) -> Self {
        let mut backoff = Self {
            min,
            max: config.max_backoff(),
            factor: config.backoff_factor,
            randomize: config.randomize,
            trips: 0,
            time_to_retry: now,
        };
        backoff.trip(now);
        backoff
    }

    /// Records another trip, pushing `time_to_retry` out by the next interval.
    pub(crate) fn trip(&mut self, now: DateTime<Utc>) {
        let mut delay =
            (self.min.as_secs_f64() * self.factor.powi(self.trips as i32)).min(self.max.as_secs_f64());
        if self.randomize {
            // Deterministic pseudo-random multiplier in [1.0, 2.0); avoids
            // pulling in an RNG for a spread that only needs to desynchronize
            // tenants.
            let mut seed = (now.timestamp_millis() as u64) ^ ((self.trips as u64) << 32);
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let frac = ((seed >> 32) as f64) / (u32::MAX as f64);
            delay = (delay * (1.0 + frac)).min(self.max.as_secs_f64() * 2.0);
        }
        self.trips += 1;
        self.time_to_retry = now + chrono::Duration::milliseconds((delay * 1e3) as i64);
    }

    /// Number of consecutive trips recorded so far.
    pub fn trips(&self) -> u32 {
        self.trips
    }

    /// Instant after which the pair may be retried.
    pub fn time_to_retry(&self) -> DateTime<Utc> {
        self.time_to_retry
    }

    /// Whether the pair is still inside its backoff window at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.time_to_retry
    }
}
