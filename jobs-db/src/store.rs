//! Storage engine, write path
//!
//! Jobs are ingested into the head dataset through a single bulk-copy stream
//! per batch, inside one transaction. When the bulk write fails, the
//! best-effort variant re-tries every job individually so one poisoned
//! payload cannot sink the whole batch, and reports per-job diagnostics
//! keyed by the caller-supplied UUID.

use std::collections::HashMap;

use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::{
    copy::CopyBuffer,
    dataset::Dataset,
    db::ConnPool,
    error::Error,
    jobs::{Job, JobId},
};

/// Diagnostic recorded for a job whose payload the backend rejected as
/// malformed JSON.
pub const INVALID_JSON: &str = "Invalid JSON";

/// Bulk-copy statement for a dataset's jobs table. Job ids and timestamps are
/// assigned by the store.
fn copy_jobs_sql(ds: &Dataset) -> String {
    format!(
        r#"COPY "{}" ("uuid", "user_id", "custom_val", "parameters", "event_payload") FROM STDIN"#,
        ds.job_table
    )
}

/// Single-row insert used by the per-row fallback.
///
/// The event payload is stripped of `\u0000` escape sequences before the json
/// cast: the backend rejects them inside json values, and producers
/// occasionally emit them.
fn insert_job_sql(ds: &Dataset) -> String {
    indoc::formatdoc! {r#"
        INSERT INTO "{jobs}" (uuid, user_id, custom_val, parameters, event_payload)
        VALUES ($1, $2, $3, $4::json, (regexp_replace($5::text, '\\u0000', '', 'g'))::json)
        RETURNING job_id
    "#, jobs = ds.job_table}
}

/// Inserts a single job into `ds`, returning its store-assigned id.
async fn insert_job<'c, E>(exe: E, ds: &Dataset, job: &Job) -> Result<JobId, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = insert_job_sql(ds);
    sqlx::query_scalar(&sql)
        .bind(job.uuid)
        .bind(&job.user_id)
        .bind(&job.custom_val)
        .bind(&job.parameters)
        .bind(&job.event_payload)
        .fetch_one(exe)
        .await
}

/// Stores a batch of jobs into `ds` through one bulk-copy stream in one
/// transaction. Any failure rolls the whole batch back and surfaces the first
/// error.
#[tracing::instrument(skip_all, fields(dataset = %ds, jobs = jobs.len()), err)]
pub(crate) async fn store_jobs(pool: &ConnPool, ds: &Dataset, jobs: &[Job]) -> Result<(), Error> {
    let mut data = CopyBuffer::new();
    for job in jobs {
        data.field(&job.uuid.to_string())
            .field(&job.user_id)
            .field(&job.custom_val)
            .field(job.parameters.as_str())
            .field(job.event_payload.as_str())
            .end_row();
    }

    let map_err = |err: sqlx::Error| Error::for_dataset_table(err, ds, &ds.job_table);

    let mut tx = pool.begin().await.map_err(Error::Database)?;
    let mut copy = tx.copy_in_raw(&copy_jobs_sql(ds)).await.map_err(map_err)?;
    copy.send(data.into_bytes()).await.map_err(map_err)?;
    copy.finish().await.map_err(map_err)?;
    tx.commit().await.map_err(Error::Database)?;
    Ok(())
}

/// Best-effort store with per-job diagnostics.
///
/// Attempts the bulk write first; if that fails, each job is inserted
/// individually (exactly once) and failures are collected into the returned
/// map. A UUID absent from the map was stored. Payloads the backend rejects
/// as malformed JSON are recorded as [`INVALID_JSON`]; other failures record
/// the error text.
#[tracing::instrument(skip_all, fields(dataset = %ds, jobs = jobs.len()))]
pub(crate) async fn store_jobs_with_retry_each(
    pool: &ConnPool,
    ds: &Dataset,
    jobs: &[Job],
) -> HashMap<Uuid, String> {
    let mut failures = HashMap::new();

    match store_jobs(pool, ds, jobs).await {
        Ok(()) => return failures,
        Err(err) => {
            tracing::warn!(error = %err, "bulk store failed, retrying each job individually");
        }
    }

    for job in jobs {
        if let Err(err) = insert_job(&**pool, ds, job).await {
            let err = Error::for_dataset_table(err, ds, &ds.job_table);
            let diagnostic = if err.is_invalid_payload() {
                INVALID_JSON.to_owned()
            } else {
                err.to_string()
            };
            tracing::warn!(uuid = %job.uuid, error = %err, "job rejected by per-row store");
            failures.insert(job.uuid, diagnostic);
        }
    }
    failures
}
