//! Dataset registry: the ordered dataset list and its job-id ranges
//!
//! The registry owns two caches guarded by one lock each: the ordered dataset
//! list (oldest first, head last) and the job-id/time ranges of the sealed
//! datasets. Discovery and range queries run against the store with no lock
//! held; the caches are swapped in afterwards.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use sqlx::{types::chrono::NaiveDateTime, Executor, Postgres};

use crate::{
    dataset::{
        compute_cluster_migration_idx, compute_insert_idx, Dataset, DatasetPosition, DatasetRange,
        DsIndex,
    },
    db::ConnPool,
    error::Error,
};

/// Lists every user table in the store; the registry pairs up the ones
/// matching its prefix.
const DISCOVERY_QUERY: &str = "SELECT tablename FROM pg_catalog.pg_tables WHERE schemaname != 'pg_catalog' AND schemaname != 'information_schema'";

/// Enumerates every user table visible to the connection.
async fn list_tables<'c, E>(exe: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(DISCOVERY_QUERY).fetch_all(exe).await
}

/// Job-id and creation-time span of one dataset; all NULL when it is empty.
type RangeRow = (
    Option<i64>,
    Option<i64>,
    Option<NaiveDateTime>,
    Option<NaiveDateTime>,
);

/// Fetches the job-id and creation-time span of one dataset's jobs table.
async fn fetch_range<'c, E>(exe: E, ds: &Dataset) -> Result<RangeRow, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"SELECT MIN(job_id), MAX(job_id), MIN(created_at), MAX(created_at) FROM "{}""#,
        ds.job_table
    );
    sqlx::query_as(&query).fetch_one(exe).await
}

#[derive(Debug, Default)]
pub(crate) struct DatasetRegistry {
    prefix: String,
    datasets: RwLock<Option<Vec<Dataset>>>,
    ranges: RwLock<Option<Vec<DatasetRange>>>,
}

impl DatasetRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            datasets: RwLock::default(),
            ranges: RwLock::default(),
        }
    }

    /// The ordered dataset list, oldest first.
    ///
    /// Serves from cache unless `refresh` is set (or nothing has been cached
    /// yet), in which case the store's tables are re-enumerated, paired by
    /// index, sorted, and swapped into the cache. A refresh also invalidates
    /// the cached ranges.
    pub async fn ds_list(&self, pool: &ConnPool, refresh: bool) -> Result<Vec<Dataset>, Error> {
        if !refresh {
            if let Some(datasets) = self.datasets.read().as_ref() {
                return Ok(datasets.clone());
            }
        }

        let tables = list_tables(&**pool).await.map_err(Error::Database)?;
        let datasets = self.pair_tables(&tables)?;

        *self.datasets.write() = Some(datasets.clone());
        *self.ranges.write() = None;
        Ok(datasets)
    }

    /// Job-id and creation-time ranges of the sealed (non-head) datasets, in
    /// dataset order. Sealed datasets that never received a job are skipped.
    pub async fn ds_range_list(&self, pool: &ConnPool) -> Result<Vec<DatasetRange>, Error> {
        if let Some(ranges) = self.ranges.read().as_ref() {
            return Ok(ranges.clone());
        }

        let datasets = self.ds_list(pool, false).await?;
        let mut ranges = Vec::new();
        let Some((_head, sealed)) = datasets.split_last() else {
            return Ok(ranges);
        };
        for ds in sealed {
            let row = fetch_range(&**pool, ds)
                .await
                .map_err(|err| Error::for_dataset_table(err, ds, &ds.job_table))?;
            if let (Some(min_id), Some(max_id), Some(start), Some(end)) = row {
                ranges.push(DatasetRange {
                    min_job_id: min_id.into(),
                    max_job_id: max_id.into(),
                    start_time: start.and_utc(),
                    end_time: end.and_utc(),
                    ds: ds.clone(),
                });
            }
        }

        *self.ranges.write() = Some(ranges.clone());
        Ok(ranges)
    }

    /// The head dataset: the only one accepting new jobs.
    pub async fn head(&self, pool: &ConnPool) -> Result<Dataset, Error> {
        let datasets = self.ds_list(pool, false).await?;
        datasets.into_iter().last().ok_or_else(|| Error::SchemaDrift {
            index: "1".to_owned(),
            table: format!("{}_jobs_1", self.prefix),
        })
    }

    /// Creates a new dataset pair at the given position, inside one DDL
    /// transaction, and updates the cache.
    #[tracing::instrument(skip(self, pool), err)]
    pub async fn add_dataset(
        &self,
        pool: &ConnPool,
        position: DatasetPosition,
    ) -> Result<Dataset, Error> {
        let datasets = self.ds_list(pool, false).await?;

        let index = match &position {
            DatasetPosition::Head => {
                let next = datasets
                    .last()
                    .map(|ds| ds.index.levels()[0] + 1)
                    .unwrap_or(1);
                next.to_string().parse()?
            }
            DatasetPosition::Between { before, after } => compute_insert_idx(before, after)?,
            DatasetPosition::ImportFront { after_index } => {
                compute_cluster_migration_idx(&datasets, after_index)?
            }
        };
        let ds = Dataset::new(&self.prefix, index);

        let create_jobs = indoc::formatdoc! {r#"
            CREATE TABLE "{jobs}" (
                job_id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL,
                user_id TEXT NOT NULL,
                custom_val TEXT NOT NULL,
                parameters JSON NOT NULL,
                event_payload JSON NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT NOW(),
                expire_at TIMESTAMP NOT NULL DEFAULT NOW()
            )
        "#, jobs = ds.job_table};
        let create_status = indoc::formatdoc! {r#"
            CREATE TABLE "{status}" (
                id BIGSERIAL PRIMARY KEY,
                job_id BIGINT NOT NULL REFERENCES "{jobs}" (job_id),
                job_state TEXT NOT NULL,
                attempt INT NOT NULL,
                exec_time TIMESTAMP,
                retry_time TIMESTAMP,
                error_code TEXT,
                error_response JSON
            )
        "#, status = ds.job_status_table, jobs = ds.job_table};
        // Covering index so that the latest-status subquery (MAX(id) GROUP BY
        // job_id) stays an index-only scan as status history accumulates.
        let create_status_index = format!(
            r#"CREATE INDEX "{0}_job_id_id_idx" ON "{0}" (job_id, id DESC)"#,
            ds.job_status_table
        );

        let mut tx = pool.begin().await.map_err(Error::Database)?;
        sqlx::query(&create_jobs)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query(&create_status)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query(&create_status_index)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        {
            let mut cache = self.datasets.write();
            let list = cache.get_or_insert_with(Vec::new);
            let at = list.partition_point(|existing| existing.index < ds.index);
            list.insert(at, ds.clone());
        }
        *self.ranges.write() = None;

        tracing::info!(dataset = %ds, "created dataset");
        Ok(ds)
    }

    /// Drops a fully-drained dataset pair and removes it from the cache.
    #[tracing::instrument(skip(self, pool), err)]
    pub async fn drop_dataset(&self, pool: &ConnPool, ds: &Dataset) -> Result<(), Error> {
        let drop_status = format!(r#"DROP TABLE "{}""#, ds.job_status_table);
        let drop_jobs = format!(r#"DROP TABLE "{}""#, ds.job_table);

        let mut tx = pool.begin().await.map_err(Error::Database)?;
        sqlx::query(&drop_status)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query(&drop_jobs)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        if let Some(list) = self.datasets.write().as_mut() {
            list.retain(|existing| existing.index != ds.index);
        }
        *self.ranges.write() = None;

        tracing::info!(dataset = %ds, "dropped dataset");
        Ok(())
    }

    /// Pairs discovered table names into datasets, sorted by index.
    fn pair_tables(&self, tables: &[String]) -> Result<Vec<Dataset>, Error> {
        let jobs_prefix = format!("{}_jobs_", self.prefix);
        let status_prefix = format!("{}_job_status_", self.prefix);

        #[derive(Default)]
        struct Pair {
            jobs: bool,
            status: bool,
        }

        let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();
        for table in tables {
            // The status prefix must be tried first: both start with
            // `<prefix>_job`.
            if let Some(index) = table.strip_prefix(&status_prefix) {
                pairs.entry(index.to_owned()).or_default().status = true;
            } else if let Some(index) = table.strip_prefix(&jobs_prefix) {
                pairs.entry(index.to_owned()).or_default().jobs = true;
            }
        }

        let mut datasets = Vec::with_capacity(pairs.len());
        for (index_text, pair) in pairs {
            let Ok(index) = index_text.parse::<DsIndex>() else {
                tracing::warn!(table_suffix = %index_text, "ignoring non-dataset table with matching prefix");
                continue;
            };
            let ds = Dataset::new(&self.prefix, index);
            match (pair.jobs, pair.status) {
                (true, true) => datasets.push(ds),
                (true, false) => {
                    return Err(Error::SchemaDrift {
                        index: index_text,
                        table: ds.job_status_table,
                    })
                }
                (false, _) => {
                    return Err(Error::SchemaDrift {
                        index: index_text,
                        table: ds.job_table,
                    })
                }
            }
        }
        datasets.sort_by(|a, b| a.index.cmp(&b.index));
        Ok(datasets)
    }
}
