//! In-tree DB integration tests for the status path

use chrono::Duration;
use sqlx::types::chrono::Utc;

use crate::{
    tests::util::{sample_job, temp_jobs_db},
    DatasetPosition, GetQueryParams, JobState, JobStatus,
};

#[tokio::test]
#[ignore = "spawns a temporary PostgreSQL cluster (requires initdb on the PATH)"]
async fn status_updates_move_jobs_between_the_read_sets() {
    //* Given
    let (_temp_db, jobs_db) = temp_jobs_db("tt").await;
    jobs_db
        .store(vec![sample_job("GW"), sample_job("GW")])
        .await
        .expect("Failed to store jobs");
    let unprocessed = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs");
    let leased = unprocessed[0].job_id;

    //* When
    let mut status = JobStatus::new(leased, JobState::Executing);
    status.attempt = 1;
    status.exec_time = Some(Utc::now());
    jobs_db
        .update_job_status(vec![status], vec!["GW".to_owned()], vec![])
        .await
        .expect("Failed to update job status");

    //* Then
    let executing = jobs_db
        .get_executing(GetQueryParams::default())
        .await
        .expect("Failed to read executing jobs");
    assert_eq!(executing.len(), 1);
    assert_eq!(executing[0].job_id, leased);
    assert_eq!(executing[0].state(), JobState::Executing);

    let still_unprocessed = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs");
    assert_eq!(still_unprocessed.len(), 1);
    assert_ne!(still_unprocessed[0].job_id, leased);
}

#[tokio::test]
#[ignore = "spawns a temporary PostgreSQL cluster (requires initdb on the PATH)"]
async fn only_the_latest_status_row_counts() {
    //* Given
    let (_temp_db, jobs_db) = temp_jobs_db("tt").await;
    jobs_db
        .store(vec![sample_job("GW")])
        .await
        .expect("Failed to store job");
    let job_id = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs")[0]
        .job_id;

    //* When
    jobs_db
        .update_job_status(
            vec![JobStatus::new(job_id, JobState::Executing)],
            vec![],
            vec![],
        )
        .await
        .expect("Failed to mark executing");
    let mut succeeded = JobStatus::new(job_id, JobState::Succeeded);
    succeeded.attempt = 1;
    succeeded.error_code = "200".to_owned();
    jobs_db
        .update_job_status(vec![succeeded], vec![], vec![])
        .await
        .expect("Failed to mark succeeded");

    //* Then
    let executing = jobs_db
        .get_executing(GetQueryParams::default())
        .await
        .expect("Failed to read executing jobs");
    assert!(executing.is_empty());
}

#[tokio::test]
#[ignore = "spawns a temporary PostgreSQL cluster (requires initdb on the PATH)"]
async fn failed_jobs_surface_once_their_retry_time_passes() {
    //* Given
    let (_temp_db, jobs_db) = temp_jobs_db("tt").await;
    jobs_db
        .store(vec![sample_job("GW"), sample_job("GW")])
        .await
        .expect("Failed to store jobs");
    let jobs = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs");

    //* When
    let mut due = JobStatus::new(jobs[0].job_id, JobState::Failed);
    due.attempt = 1;
    due.retry_time = Some(Utc::now() - Duration::seconds(10));
    due.error_code = "500".to_owned();
    due.error_response = r#"{"error":"upstream timeout"}"#.into();
    let mut not_due = JobStatus::new(jobs[1].job_id, JobState::Failed);
    not_due.attempt = 1;
    not_due.retry_time = Some(Utc::now() + Duration::seconds(3600));
    jobs_db
        .update_job_status(vec![due.clone(), not_due], vec![], vec![])
        .await
        .expect("Failed to update job statuses");

    //* Then
    let to_retry = jobs_db
        .get_to_retry(GetQueryParams::default())
        .await
        .expect("Failed to read retryable jobs");
    assert_eq!(to_retry.len(), 1);
    assert_eq!(to_retry[0].job_id, due.job_id);
    let last_status = to_retry[0].last_job_status.as_ref().expect("missing status");
    assert_eq!(last_status.job_state, JobState::Failed);
    assert_eq!(last_status.error_code, "500");
    assert_eq!(last_status.error_response.as_str(), r#"{"error":"upstream timeout"}"#);
}

#[tokio::test]
#[ignore = "spawns a temporary PostgreSQL cluster (requires initdb on the PATH)"]
async fn waiting_states_read_together() {
    //* Given
    let (_temp_db, jobs_db) = temp_jobs_db("tt").await;
    jobs_db
        .store(vec![sample_job("GW"), sample_job("GW")])
        .await
        .expect("Failed to store jobs");
    let jobs = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs");

    //* When
    jobs_db
        .update_job_status(
            vec![
                JobStatus::new(jobs[0].job_id, JobState::Waiting),
                JobStatus::new(jobs[1].job_id, JobState::WaitingRetry),
            ],
            vec![],
            vec![],
        )
        .await
        .expect("Failed to update job statuses");

    //* Then
    let waiting = jobs_db
        .get_waiting(GetQueryParams::default())
        .await
        .expect("Failed to read waiting jobs");
    assert_eq!(waiting.len(), 2);
}

#[tokio::test]
#[ignore = "spawns a temporary PostgreSQL cluster (requires initdb on the PATH)"]
async fn one_report_spans_several_datasets_atomically() {
    //* Given
    let (_temp_db, jobs_db) = temp_jobs_db("tt").await;
    jobs_db
        .store(vec![sample_job("GW")])
        .await
        .expect("Failed to store into dataset 1");
    jobs_db
        .add_dataset(DatasetPosition::Head)
        .await
        .expect("Failed to add head dataset");
    jobs_db
        .store(vec![sample_job("GW")])
        .await
        .expect("Failed to store into dataset 2");
    let jobs = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs");
    assert_eq!(jobs.len(), 2);

    //* When
    let mut statuses = Vec::new();
    for job in &jobs {
        let mut status = JobStatus::new(job.job_id, JobState::Executing);
        status.attempt = 1;
        status.exec_time = Some(Utc::now());
        statuses.push(status);
    }
    jobs_db
        .update_job_status(statuses, vec!["GW".to_owned()], vec![])
        .await
        .expect("Failed to update job statuses");

    //* Then
    // Both datasets reflect the report: nothing unprocessed, both executing.
    let unprocessed = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs");
    assert!(unprocessed.is_empty());
    let executing = jobs_db
        .get_executing(GetQueryParams::default())
        .await
        .expect("Failed to read executing jobs");
    assert_eq!(executing.len(), 2);
}

#[tokio::test]
#[ignore = "spawns a temporary PostgreSQL cluster (requires initdb on the PATH)"]
async fn updates_for_retired_jobs_are_skipped_not_fatal() {
    //* Given
    let (_temp_db, jobs_db) = temp_jobs_db("tt").await;
    jobs_db
        .store(vec![sample_job("GW")])
        .await
        .expect("Failed to store job");

    //* When
    // Job id 0 predates every dataset range; the report must still land for
    // the live job.
    let live = jobs_db
        .get_unprocessed(GetQueryParams::default())
        .await
        .expect("Failed to read unprocessed jobs")[0]
        .job_id;
    jobs_db
        .add_dataset(DatasetPosition::Head)
        .await
        .expect("Failed to add head dataset");
    jobs_db
        .update_job_status(
            vec![
                JobStatus::new(0.into(), JobState::Succeeded),
                JobStatus::new(live, JobState::Executing),
            ],
            vec![],
            vec![],
        )
        .await
        .expect("Failed to update job statuses");

    //* Then
    let executing = jobs_db
        .get_executing(GetQueryParams::default())
        .await
        .expect("Failed to read executing jobs");
    assert_eq!(executing.len(), 1);
    assert_eq!(executing[0].job_id, live);
}
