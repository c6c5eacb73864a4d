//! Durable, dataset-partitioned job queue backed by PostgreSQL
//!
//! The queue is physically split into a time-ordered sequence of *datasets*,
//! each a pair of tables (`<prefix>_jobs_<index>`, `<prefix>_job_status_<index>`).
//! Producers bulk-copy jobs into the newest dataset (the head), consumers
//! read jobs oldest-dataset-first and append status rows, and fully-drained
//! datasets at the tail are retired. Dataset indices are strings whose
//! level-wise numeric order matches physical age, which keeps the sequence
//! stable even when datasets are inserted mid-sequence or imported from
//! another cluster.
//!
//! [`JobsDb`] is the cloneable handle over a connection pool; per-tenant
//! dispatch planning on top of this queue lives in the `tenant-stats` crate
//! and consumes plain snapshots, not this handle.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use uuid::Uuid;

mod config;
mod copy;
pub mod dataset;
mod db;
mod error;
pub mod jobs;
mod query;
mod queue;
mod registry;
mod status;
mod store;

pub use self::{
    config::{JobsDbConfig, DEFAULT_POOL_SIZE},
    dataset::{
        compute_cluster_migration_idx, compute_insert_idx, Dataset, DatasetPosition, DatasetRange,
        DsIndex,
    },
    error::Error,
    jobs::{Job, JobId, JobState, JobStatus, JsonPayload},
    query::{GetQueryParams, ParameterFilter},
    store::INVALID_JSON,
};

use self::{db::ConnPool, queue::SerialQueue, registry::DatasetRegistry};

#[derive(Debug)]
struct Inner {
    pool: ConnPool,
    config: JobsDbConfig,
    registry: DatasetRegistry,
    /// One writer lane per dataset index, created on first use.
    writer_queues: Mutex<HashMap<String, Arc<SerialQueue>>>,
    /// Single reader lane shared by all read operations.
    reader_queue: Mutex<Option<Arc<SerialQueue>>>,
}

/// Handle to the job queue. Clones share the same pool, caches and queues.
#[derive(Debug, Clone)]
pub struct JobsDb {
    inner: Arc<Inner>,
}

impl JobsDb {
    /// Connects to the store, loads the dataset list, and creates the first
    /// dataset if the store is empty.
    #[tracing::instrument(skip_all, fields(table_prefix = %config.table_prefix), err)]
    pub async fn connect(config: JobsDbConfig) -> Result<Self, Error> {
        let pool = ConnPool::connect(&config.url, config.pool_size).await?;
        let registry = DatasetRegistry::new(&config.table_prefix);

        let datasets = registry.ds_list(&pool, true).await?;
        if datasets.is_empty() {
            registry.add_dataset(&pool, DatasetPosition::Head).await?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                config,
                registry,
                writer_queues: Mutex::default(),
                reader_queue: Mutex::default(),
            }),
        })
    }

    /// Stores a batch of jobs into the head dataset in one transaction.
    ///
    /// All-or-nothing: on any failure the transaction is rolled back and the
    /// first error is returned.
    pub async fn store(&self, jobs: Vec<Job>) -> Result<(), Error> {
        let ds = self.inner.registry.head(&self.inner.pool).await?;
        if !self.inner.config.enable_writer_queue {
            return store::store_jobs(&self.inner.pool, &ds, &jobs).await;
        }
        let lane = self.writer_queue(&ds);
        let pool = self.inner.pool.clone();
        lane.run(async move { store::store_jobs(&pool, &ds, &jobs).await })
            .await
    }

    /// Best-effort store with per-job diagnostics.
    ///
    /// Tries the bulk write first and falls back to inserting each job
    /// individually, stripping NUL escape sequences from payloads. Returns a
    /// map from job UUID to failure diagnostic; jobs absent from the map were
    /// stored. A payload rejected as malformed JSON maps to [`INVALID_JSON`].
    pub async fn store_with_retry_each(&self, jobs: Vec<Job>) -> HashMap<Uuid, String> {
        let ds = match self.inner.registry.head(&self.inner.pool).await {
            Ok(ds) => ds,
            Err(err) => {
                tracing::error!(error = %err, "cannot resolve head dataset for store");
                return jobs
                    .iter()
                    .map(|job| (job.uuid, err.to_string()))
                    .collect();
            }
        };
        if !self.inner.config.enable_writer_queue {
            return store::store_jobs_with_retry_each(&self.inner.pool, &ds, &jobs).await;
        }
        let lane = self.writer_queue(&ds);
        let pool = self.inner.pool.clone();
        lane.run(async move { store::store_jobs_with_retry_each(&pool, &ds, &jobs).await })
            .await
    }

    /// Atomically appends status rows, fanned out across the datasets that
    /// hold the affected jobs.
    ///
    /// The filters describe which queue slices the report covers; see
    /// [`GetQueryParams`] for their semantics on the read side.
    pub async fn update_job_status(
        &self,
        statuses: Vec<JobStatus>,
        custom_val_filters: Vec<String>,
        parameter_filters: Vec<ParameterFilter>,
    ) -> Result<(), Error> {
        let ranges = self.inner.registry.ds_range_list(&self.inner.pool).await?;
        let head = self.inner.registry.head(&self.inner.pool).await?;
        if !self.inner.config.enable_writer_queue {
            return status::update_job_status(
                &self.inner.pool,
                &ranges,
                &head,
                &statuses,
                &custom_val_filters,
                &parameter_filters,
            )
            .await;
        }
        // Status updates share the head's writer lane so each dataset sees at
        // most one writing transaction at a time.
        let lane = self.writer_queue(&head);
        let pool = self.inner.pool.clone();
        lane.run(async move {
            status::update_job_status(
                &pool,
                &ranges,
                &head,
                &statuses,
                &custom_val_filters,
                &parameter_filters,
            )
            .await
        })
        .await
    }

    /// Jobs with no status row yet, oldest first.
    pub async fn get_unprocessed(&self, params: GetQueryParams) -> Result<Vec<Job>, Error> {
        self.read(move |pool, datasets| async move {
            query::get_unprocessed(&pool, &datasets, &params).await
        })
        .await
    }

    /// Failed jobs whose retry time has passed, oldest first.
    pub async fn get_to_retry(&self, params: GetQueryParams) -> Result<Vec<Job>, Error> {
        self.read(move |pool, datasets| async move {
            query::get_to_retry(&pool, &datasets, &params).await
        })
        .await
    }

    /// Jobs waiting on an upstream condition or a retry slot, oldest first.
    pub async fn get_waiting(&self, params: GetQueryParams) -> Result<Vec<Job>, Error> {
        self.read(move |pool, datasets| async move {
            query::get_waiting(&pool, &datasets, &params).await
        })
        .await
    }

    /// Jobs currently leased by a consumer, oldest first.
    pub async fn get_executing(&self, params: GetQueryParams) -> Result<Vec<Job>, Error> {
        self.read(move |pool, datasets| async move {
            query::get_executing(&pool, &datasets, &params).await
        })
        .await
    }

    /// The ordered dataset list, oldest first; optionally re-enumerated from
    /// the store.
    pub async fn ds_list(&self, refresh_from_db: bool) -> Result<Vec<Dataset>, Error> {
        self.inner
            .registry
            .ds_list(&self.inner.pool, refresh_from_db)
            .await
    }

    /// Job-id and creation-time ranges of the sealed datasets.
    pub async fn ds_range_list(&self) -> Result<Vec<DatasetRange>, Error> {
        self.inner.registry.ds_range_list(&self.inner.pool).await
    }

    /// Creates a new dataset pair at the given position.
    pub async fn add_dataset(&self, position: DatasetPosition) -> Result<Dataset, Error> {
        self.inner.registry.add_dataset(&self.inner.pool, position).await
    }

    /// Drops a fully-drained dataset pair.
    pub async fn drop_dataset(&self, ds: &Dataset) -> Result<(), Error> {
        self.inner.registry.drop_dataset(&self.inner.pool, ds).await
    }

    fn writer_queue(&self, ds: &Dataset) -> Arc<SerialQueue> {
        let mut queues = self.inner.writer_queues.lock();
        queues
            .entry(ds.index.to_string())
            .or_insert_with(|| Arc::new(SerialQueue::new(format!("writer:{}", ds.index))))
            .clone()
    }

    fn reader_queue(&self) -> Arc<SerialQueue> {
        let mut queue = self.inner.reader_queue.lock();
        queue
            .get_or_insert_with(|| Arc::new(SerialQueue::new("reader")))
            .clone()
    }

    /// Runs a read over the current dataset window, through the reader lane
    /// when it is enabled.
    async fn read<F, Fut>(&self, op: F) -> Result<Vec<Job>, Error>
    where
        F: FnOnce(ConnPool, Vec<Dataset>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<Job>, Error>> + Send + 'static,
    {
        let datasets = self.inner.registry.ds_list(&self.inner.pool, false).await?;
        let pool = self.inner.pool.clone();
        if !self.inner.config.enable_reader_queue {
            return op(pool, datasets).await;
        }
        self.reader_queue().run(op(pool, datasets)).await
    }
}
