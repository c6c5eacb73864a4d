//! Connection and queue configuration.

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};

/// Default maximum number of connections in the pool.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Default acquire timeout when checking out a connection.
///
/// Requests that cannot acquire a connection within this window fail fast
/// rather than queuing indefinitely.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Jobs DB settings, deserializable from the `jobs_db` configuration section.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct JobsDbConfig {
    /// Database connection URL (required).
    pub url: String,

    /// Table name root: datasets live in `<table_prefix>_jobs_<index>` and
    /// `<table_prefix>_job_status_<index>` (required).
    pub table_prefix: String,

    /// Size of the connection pool (default: 10).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Serialize producers through a single writer task per dataset, so
    /// concurrent stores share transaction setup instead of contending
    /// (default: true).
    #[serde(default = "default_enable_queue")]
    pub enable_writer_queue: bool,

    /// Serialize consumers through a single reader task (default: true).
    #[serde(default = "default_enable_queue")]
    pub enable_reader_queue: bool,
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_enable_queue() -> bool {
    true
}

impl JobsDbConfig {
    /// Minimal configuration with everything else at its default.
    pub fn new(url: impl Into<String>, table_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table_prefix: table_prefix.into(),
            pool_size: default_pool_size(),
            enable_writer_queue: default_enable_queue(),
            enable_reader_queue: default_enable_queue(),
        }
    }

    /// Load configuration from a TOML file and `JOBS_DB_*` environment
    /// variables, the env vars taking priority.
    ///
    /// The file may not exist; in that case everything must come from the
    /// environment.
    pub fn load(config_path: &Path) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("JOBS_DB_").split("__"))
            .extract_inner("jobs_db")
    }
}
