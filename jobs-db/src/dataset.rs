//! Datasets: the physical partitions of the queue
//!
//! The queue is split into a time-ordered sequence of datasets, each a pair
//! of tables (jobs + job status) sharing one index. New jobs only ever land
//! in the newest dataset (the head); older datasets are read until drained
//! and then retired.

pub mod index;

pub use self::index::{compute_cluster_migration_idx, compute_insert_idx, DsIndex};

use sqlx::types::chrono::{DateTime, Utc};

use crate::jobs::JobId;

/// A jobs/status table pair holding one partition of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub index: DsIndex,
    /// Name of the jobs table, `<prefix>_jobs_<index>`.
    pub job_table: String,
    /// Name of the status table, `<prefix>_job_status_<index>`.
    pub job_status_table: String,
}

impl Dataset {
    pub fn new(prefix: &str, index: DsIndex) -> Self {
        Self {
            job_table: format!("{prefix}_jobs_{index}"),
            job_status_table: format!("{prefix}_job_status_{index}"),
            index,
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.job_table)
    }
}

/// Job-id and creation-time span of a sealed (non-head) dataset.
///
/// Cached by the registry so that readers can prune datasets by id range and
/// status updates can be routed to the dataset that actually holds the job.
#[derive(Debug, Clone)]
pub struct DatasetRange {
    pub min_job_id: JobId,
    pub max_job_id: JobId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub ds: Dataset,
}

impl DatasetRange {
    /// Whether this dataset holds the given job id.
    pub fn contains(&self, job_id: JobId) -> bool {
        self.min_job_id <= job_id && job_id <= self.max_job_id
    }
}

/// Where to place a new dataset in the sequence.
#[derive(Debug, Clone)]
pub enum DatasetPosition {
    /// Append a new head: the next top-level index after the current newest
    /// dataset. This is the only position that accepts new jobs.
    Head,
    /// Insert between two consecutive datasets (intra-sequence migration).
    Between { before: DsIndex, after: DsIndex },
    /// Front an imported dataset before the pre-existing sequence, ahead of
    /// the dataset carrying `after_index`.
    ImportFront { after_index: String },
}
