//! Shared helpers for the in-tree DB integration tests

use pgtemp::PgTempDB;

use crate::{Job, JobsDb, JobsDbConfig};

/// Spins up a temporary PostgreSQL cluster and connects a [`JobsDb`] to it.
///
/// The cluster lives until the returned [`PgTempDB`] is dropped.
pub async fn temp_jobs_db(table_prefix: &str) -> (PgTempDB, JobsDb) {
    // Honors RUST_LOG; repeat initialization from parallel tests is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let temp_db = PgTempDB::new();
    let config = JobsDbConfig::new(temp_db.connection_uri(), table_prefix);
    let jobs_db = JobsDb::connect(config)
        .await
        .expect("failed to connect to jobs db");
    (temp_db, jobs_db)
}

pub fn sample_job(custom_val: &str) -> Job {
    Job::new(
        uuid::Uuid::new_v4(),
        "90ca6da0-292e-4e79-9880-f8009e0ae4a3",
        custom_val,
        r#"{"batch_id":1,"source_id":"src-1","source_job_run_id":""}"#,
        r#"{"event":"Demo Track","properties":{"value":5}}"#,
    )
}
