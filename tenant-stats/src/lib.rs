//! Per-tenant queue statistics and the dispatch pickup planner
//!
//! The [`TenantStats`] registry tracks, per `(tenant, destination type)` pair:
//! in-memory pending-job counts, moving-average arrival rates, per-cycle
//! success/failure/drain tallies, last-drained timestamps, and circuit-breaker
//! backoff state. The [`planner`] module turns a snapshot of this registry
//! into a per-tenant pickup budget for one dispatch cycle.
//!
//! All registry state is in memory behind two read-write locks (one for job
//! counts and rates, one for delivery outcomes); no method blocks beyond a
//! short critical section and none performs I/O.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub mod backoff;
pub mod metric;
pub mod planner;

pub use self::{
    backoff::{Backoff, BackoffConfig},
    metric::MovingAverage,
    planner::{PickupInputs, plan_pickup},
};

/// Which queue family a counter belongs to. Router and batch-router pipelines
/// share the registry but keep fully separate counts and rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableType {
    Router,
    BatchRouter,
}

impl TableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::BatchRouter => "batch_router",
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key for counters scoped to a queue family: `(tenant, destination type)`.
type PairKey = (String, String);

#[derive(Debug, Default)]
struct JobCounts {
    /// Pending jobs per (table, tenant, dest). Adds and removes are paired
    /// with successful stores and dequeues, so a full cycle nets to zero or
    /// more; transient negatives between the two are tolerated.
    pending: HashMap<(TableType, String, String), i64>,
    /// Moving-average arrival rates (jobs/second) per (table, tenant, dest).
    in_rates: HashMap<(TableType, String, String), MovingAverage>,
}

#[derive(Debug, Default, Clone, Copy)]
struct OutcomeCounts {
    success: u64,
    failure: u64,
    drained: u64,
}

#[derive(Debug, Default)]
struct Outcomes {
    counts: HashMap<PairKey, OutcomeCounts>,
    last_drained: HashMap<PairKey, DateTime<Utc>>,
    breakers: HashMap<PairKey, Backoff>,
}

/// In-memory statistics registry shared by producers, the dispatch loop and
/// the planner.
#[derive(Debug, Default)]
pub struct TenantStats {
    backoff_config: BackoffConfig,
    job_counts: RwLock<JobCounts>,
    outcomes: RwLock<Outcomes>,
}

impl TenantStats {
    pub fn new(backoff_config: BackoffConfig) -> Self {
        Self {
            backoff_config,
            job_counts: RwLock::default(),
            outcomes: RwLock::default(),
        }
    }

    /// Credits `count` pending jobs to a tenant. Paired with a successful
    /// store.
    pub fn add_to_in_memory_count(
        &self,
        table: TableType,
        tenant: &str,
        dest_type: &str,
        count: i64,
    ) {
        let mut counts = self.job_counts.write();
        *counts
            .pending
            .entry((table, tenant.to_owned(), dest_type.to_owned()))
            .or_insert(0) += count;
    }

    /// Debits `count` pending jobs from a tenant. Paired with a successful
    /// dequeue or retirement.
    pub fn remove_from_in_memory_count(
        &self,
        table: TableType,
        tenant: &str,
        dest_type: &str,
        count: i64,
    ) {
        self.add_to_in_memory_count(table, tenant, dest_type, -count);
    }

    /// Current pending count for a pair. Missing pairs read as zero.
    pub fn pending_count(&self, table: TableType, tenant: &str, dest_type: &str) -> i64 {
        self.job_counts
            .read()
            .pending
            .get(&(table, tenant.to_owned(), dest_type.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    /// Total pending jobs across all tenants of a queue family. Feeds the
    /// pile-up gauge.
    pub fn total_pending(&self, table: TableType) -> i64 {
        self.job_counts
            .read()
            .pending
            .iter()
            .filter(|((t, _, _), _)| *t == table)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Folds one processing-loop cycle into the arrival-rate averages and the
    /// pending counts.
    ///
    /// `cycle` holds the number of jobs that arrived per tenant per
    /// destination type during `elapsed`. Every known pair of this queue
    /// family that did *not* appear in the cycle gets an explicit zero sample
    /// so idle tenants decay instead of holding a stale rate.
    pub fn report_proc_loop_add_stats(
        &self,
        table: TableType,
        cycle: &HashMap<String, HashMap<String, i64>>,
        elapsed: Duration,
    ) {
        let secs = elapsed.as_secs_f64();
        {
            let mut counts = self.job_counts.write();
            for (tenant, dests) in cycle {
                for (dest_type, &n) in dests {
                    if secs > 0.0 {
                        counts
                            .in_rates
                            .entry((table, tenant.clone(), dest_type.clone()))
                            .or_default()
                            .add(n as f64 / secs);
                    }
                    *counts
                        .pending
                        .entry((table, tenant.clone(), dest_type.clone()))
                        .or_insert(0) += n;
                }
            }
            for ((t, tenant, dest_type), rate) in counts.in_rates.iter_mut() {
                if *t != table {
                    continue;
                }
                let seen = cycle
                    .get(tenant)
                    .is_some_and(|dests| dests.contains_key(dest_type));
                if !seen {
                    rate.add(0.0);
                }
            }
        }
    }

    /// Current arrival-rate value for a pair. Missing pairs read as zero.
    pub fn in_rate(&self, table: TableType, tenant: &str, dest_type: &str) -> f64 {
        self.job_counts
            .read()
            .in_rates
            .get(&(table, tenant.to_owned(), dest_type.to_owned()))
            .map(MovingAverage::value)
            .unwrap_or(0.0)
    }

    /// Tallies one delivery outcome. A drained job also stamps the pair's
    /// last-drained timestamp, which the planner uses to deprioritize the
    /// tenant for a while.
    pub fn calculate_success_failure_counts(
        &self,
        tenant: &str,
        dest_type: &str,
        is_success: bool,
        is_drained: bool,
    ) {
        let mut guard = self.outcomes.write();
        let outcomes = &mut *guard;
        let counts = outcomes
            .counts
            .entry((tenant.to_owned(), dest_type.to_owned()))
            .or_default();
        if is_success {
            counts.success += 1;
        } else if is_drained {
            counts.drained += 1;
            outcomes
                .last_drained
                .insert((tenant.to_owned(), dest_type.to_owned()), Utc::now());
        } else {
            counts.failure += 1;
        }
    }

    /// Snapshots and resets the per-cycle outcome tallies for one destination
    /// type.
    ///
    /// Returns `(success_rate, drain_rate)` per tenant, both in `[0, 1]`. A
    /// tenant with no recorded outcomes reads as fully successful (success 1,
    /// drained 0) so a silent cycle never trips anything downstream.
    pub fn generate_success_rate_map(
        &self,
        dest_type: &str,
    ) -> (HashMap<String, f64>, HashMap<String, f64>) {
        let mut success_rates = HashMap::new();
        let mut drain_rates = HashMap::new();

        let mut outcomes = self.outcomes.write();
        outcomes.counts.retain(|(tenant, dest), counts| {
            if dest.as_str() != dest_type {
                return true;
            }
            let total = counts.success + counts.failure + counts.drained;
            if total == 0 {
                success_rates.insert(tenant.clone(), 1.0);
                drain_rates.insert(tenant.clone(), 0.0);
            } else {
                success_rates.insert(tenant.clone(), counts.success as f64 / total as f64);
                drain_rates.insert(tenant.clone(), counts.drained as f64 / total as f64);
            }
            false
        });

        (success_rates, drain_rates)
    }

    /// When the pair last had a job drained, if ever.
    pub fn last_drained(&self, tenant: &str, dest_type: &str) -> Option<DateTime<Utc>> {
        self.outcomes
            .read()
            .last_drained
            .get(&(tenant.to_owned(), dest_type.to_owned()))
            .copied()
    }

    /// Trips the circuit breaker for a pair, creating it on first trip.
    ///
    /// A pair that is draining starts at the maximum interval straight away;
    /// one that is merely failing starts at the minimum. Recording is all this
    /// registry does: consulting the breaker and deciding to block a tenant is
    /// the dispatch loop's policy.
    pub fn record_backoff(&self, tenant: &str, dest_type: &str, is_draining: bool) {
        let now = Utc::now();
        let mut outcomes = self.outcomes.write();
        match outcomes
            .breakers
            .entry((tenant.to_owned(), dest_type.to_owned()))
        {
            std::collections::hash_map::Entry::Occupied(mut entry) => entry.get_mut().trip(now),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let min = if is_draining {
                    self.backoff_config.max_backoff()
                } else {
                    self.backoff_config.min_backoff()
                };
                entry.insert(Backoff::new(&self.backoff_config, min, now));
            }
        }
    }

    /// Clears the circuit breaker for a pair after recovery.
    pub fn clear_backoff(&self, tenant: &str, dest_type: &str) {
        self.outcomes
            .write()
            .breakers
            .remove(&(tenant.to_owned(), dest_type.to_owned()));
    }

    /// Current breaker state for a pair, if one has been recorded.
    pub fn breaker(&self, tenant: &str, dest_type: &str) -> Option<Backoff> {
        self.outcomes
            .read()
            .breakers
            .get(&(tenant.to_owned(), dest_type.to_owned()))
            .cloned()
    }

    /// Builds a planner snapshot for one `(queue family, destination type)`
    /// and all the tenants in `sorted_latency_list`.
    #[allow(clippy::too_many_arguments)]
    pub fn pickup_inputs(
        &self,
        table: TableType,
        dest_type: &str,
        sorted_latency_list: Vec<String>,
        earliest_job_map: HashMap<String, DateTime<Utc>>,
        workers: usize,
        router_timeout: Duration,
        job_query_batch_size: usize,
        latency_map: &HashMap<String, MovingAverage>,
        success_rate: HashMap<String, f64>,
        drained: HashMap<String, f64>,
    ) -> PickupInputs {
        let mut inputs = PickupInputs {
            sorted_latency_list,
            earliest_job_map,
            workers,
            router_timeout,
            job_query_batch_size,
            success_rate,
            drained,
            now: Utc::now(),
            ..Default::default()
        };

        {
            let counts = self.job_counts.read();
            for tenant in &inputs.sorted_latency_list {
                let key = (table, tenant.clone(), dest_type.to_owned());
                if let Some(rate) = counts.in_rates.get(&key) {
                    inputs.in_rate.insert(tenant.clone(), rate.value());
                }
                if let Some(&pending) = counts.pending.get(&key) {
                    inputs.pending.insert(tenant.clone(), pending);
                }
            }
        }
        {
            let outcomes = self.outcomes.read();
            for tenant in &inputs.sorted_latency_list {
                if let Some(&at) = outcomes
                    .last_drained
                    .get(&(tenant.clone(), dest_type.to_owned()))
                {
                    inputs.last_drained.insert(tenant.clone(), at);
                }
            }
        }
        for (tenant, latency) in latency_map {
            inputs.latency.insert(tenant.clone(), latency.value());
        }

        inputs
    }

    /// Convenience wrapper: snapshot the registry and run the planner.
    #[allow(clippy::too_many_arguments)]
    pub fn router_pickup_jobs(
        &self,
        table: TableType,
        dest_type: &str,
        sorted_latency_list: Vec<String>,
        earliest_job_map: HashMap<String, DateTime<Utc>>,
        workers: usize,
        router_timeout: Duration,
        job_query_batch_size: usize,
        latency_map: &HashMap<String, MovingAverage>,
        success_rate: HashMap<String, f64>,
        drained: HashMap<String, f64>,
    ) -> HashMap<String, usize> {
        let inputs = self.pickup_inputs(
            table,
            dest_type,
            sorted_latency_list,
            earliest_job_map,
            workers,
            router_timeout,
            job_query_batch_size,
            latency_map,
            success_rate,
            drained,
        );
        plan_pickup(&inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paired_add_and_remove_cancel_out() {
        let stats = TenantStats::default();
        stats.add_to_in_memory_count(TableType::Router, "acme", "WEBHOOK", 25);
        stats.add_to_in_memory_count(TableType::Router, "acme", "WEBHOOK", 5);
        stats.remove_from_in_memory_count(TableType::Router, "acme", "WEBHOOK", 30);
        assert_eq!(stats.pending_count(TableType::Router, "acme", "WEBHOOK"), 0);
    }

    #[test]
    fn table_types_do_not_share_counts() {
        let stats = TenantStats::default();
        stats.add_to_in_memory_count(TableType::Router, "acme", "WEBHOOK", 3);
        stats.add_to_in_memory_count(TableType::BatchRouter, "acme", "WEBHOOK", 7);
        assert_eq!(stats.pending_count(TableType::Router, "acme", "WEBHOOK"), 3);
        assert_eq!(stats.total_pending(TableType::BatchRouter), 7);
    }

    #[test]
    fn proc_loop_report_folds_rates_and_counts() {
        let stats = TenantStats::default();
        let mut cycle = HashMap::new();
        cycle.insert(
            "acme".to_owned(),
            HashMap::from([("WEBHOOK".to_owned(), 20_i64)]),
        );

        stats.report_proc_loop_add_stats(TableType::Router, &cycle, Duration::from_secs(2));

        assert_eq!(
            stats.pending_count(TableType::Router, "acme", "WEBHOOK"),
            20
        );
        // One 10 jobs/s sample folded into a zero-seeded average.
        let rate = stats.in_rate(TableType::Router, "acme", "WEBHOOK");
        assert!(rate > 0.0 && rate < 10.0);
    }

    #[test]
    fn idle_pairs_decay_toward_zero() {
        let stats = TenantStats::default();
        let mut cycle = HashMap::new();
        cycle.insert(
            "acme".to_owned(),
            HashMap::from([("WEBHOOK".to_owned(), 10_i64)]),
        );
        for _ in 0..8 {
            stats.report_proc_loop_add_stats(TableType::Router, &cycle, Duration::from_secs(1));
        }
        let busy = stats.in_rate(TableType::Router, "acme", "WEBHOOK");

        let empty = HashMap::new();
        for _ in 0..8 {
            stats.report_proc_loop_add_stats(TableType::Router, &empty, Duration::from_secs(1));
        }
        let idle = stats.in_rate(TableType::Router, "acme", "WEBHOOK");
        assert!(idle < busy);
    }

    #[test]
    fn success_rate_map_snapshots_and_resets() {
        let stats = TenantStats::default();
        stats.calculate_success_failure_counts("acme", "WEBHOOK", true, false);
        stats.calculate_success_failure_counts("acme", "WEBHOOK", true, false);
        stats.calculate_success_failure_counts("acme", "WEBHOOK", false, false);
        stats.calculate_success_failure_counts("acme", "WEBHOOK", false, true);

        let (success, drained) = stats.generate_success_rate_map("WEBHOOK");
        assert_eq!(success.get("acme"), Some(&0.5));
        assert_eq!(drained.get("acme"), Some(&0.25));

        // The snapshot consumed the tallies.
        let (success, drained) = stats.generate_success_rate_map("WEBHOOK");
        assert!(success.is_empty());
        assert!(drained.is_empty());
    }

    #[test]
    fn success_rate_reset_is_scoped_to_the_destination_type() {
        let stats = TenantStats::default();
        stats.calculate_success_failure_counts("acme", "WEBHOOK", true, false);
        stats.calculate_success_failure_counts("acme", "GW", false, false);

        let (success, _) = stats.generate_success_rate_map("WEBHOOK");
        assert_eq!(success.get("acme"), Some(&1.0));

        // The GW tallies survived the WEBHOOK snapshot.
        let (success, _) = stats.generate_success_rate_map("GW");
        assert_eq!(success.get("acme"), Some(&0.0));
    }

    #[test]
    fn draining_stamps_the_last_drained_timestamp() {
        let stats = TenantStats::default();
        assert!(stats.last_drained("acme", "WEBHOOK").is_none());

        let before = Utc::now();
        stats.calculate_success_failure_counts("acme", "WEBHOOK", false, true);
        let stamped = stats.last_drained("acme", "WEBHOOK").unwrap();
        assert!(stamped >= before);

        // Failures do not move the stamp.
        stats.calculate_success_failure_counts("acme", "WEBHOOK", false, false);
        assert_eq!(stats.last_drained("acme", "WEBHOOK"), Some(stamped));
    }

    #[test]
    fn breaker_trips_advance_and_clear() {
        let stats = TenantStats::default();
        assert!(stats.breaker("acme", "WEBHOOK").is_none());

        stats.record_backoff("acme", "WEBHOOK", false);
        stats.record_backoff("acme", "WEBHOOK", false);
        let breaker = stats.breaker("acme", "WEBHOOK").unwrap();
        assert_eq!(breaker.trips(), 2);

        stats.clear_backoff("acme", "WEBHOOK");
        assert!(stats.breaker("acme", "WEBHOOK").is_none());
    }

    #[test]
    fn pickup_inputs_snapshot_the_registry() {
        let stats = TenantStats::default();
        let mut cycle = HashMap::new();
        cycle.insert(
            "acme".to_owned(),
            HashMap::from([("WEBHOOK".to_owned(), 50_i64)]),
        );
        for _ in 0..64 {
            stats.report_proc_loop_add_stats(TableType::Router, &cycle, Duration::from_secs(1));
        }
        // Undo the pending inflation from the repeated reports, then set a
        // realistic backlog.
        stats.remove_from_in_memory_count(TableType::Router, "acme", "WEBHOOK", 64 * 50);
        stats.add_to_in_memory_count(TableType::Router, "acme", "WEBHOOK", 200);

        let mut latency_map = HashMap::new();
        let mut latency = MovingAverage::new();
        for _ in 0..64 {
            latency.add(0.1);
        }
        latency_map.insert("acme".to_owned(), latency);

        let plan = stats.router_pickup_jobs(
            TableType::Router,
            "WEBHOOK",
            vec!["acme".to_owned()],
            HashMap::new(),
            2,
            Duration::from_secs(1),
            100,
            &latency_map,
            HashMap::new(),
            HashMap::new(),
        );

        let picked = plan.get("acme").copied().unwrap_or(0);
        assert!(picked > 0 && picked <= 100);
    }
}
