//! Storage engine, status path
//!
//! Status rows are append-only: updating a job means appending a row to the
//! status table of whichever dataset holds the job. One update call may touch
//! several datasets; all of them are written inside a single transaction so
//! consumers either see the whole report or none of it.

use crate::{
    copy::CopyBuffer,
    dataset::{Dataset, DatasetRange},
    db::ConnPool,
    error::Error,
    jobs::JobStatus,
    query::ParameterFilter,
};

/// Bulk-copy statement for a dataset's status table.
fn copy_status_sql(ds: &Dataset) -> String {
    format!(
        r#"COPY "{}" ("job_id", "job_state", "attempt", "exec_time", "retry_time", "error_code", "error_response") FROM STDIN"#,
        ds.job_status_table
    )
}

/// Splits statuses by the dataset that holds their job.
///
/// Jobs above every sealed range belong to the head dataset. Jobs below or
/// between the sealed ranges belong to datasets that have since been retired;
/// their updates are idempotent re-deliveries, logged and skipped.
fn partition_by_dataset<'a>(
    statuses: &'a [JobStatus],
    ranges: &[DatasetRange],
    head: &Dataset,
) -> Vec<(Dataset, Vec<&'a JobStatus>)> {
    let mut groups: Vec<(Dataset, Vec<&JobStatus>)> = ranges
        .iter()
        .map(|range| (range.ds.clone(), Vec::new()))
        .chain(std::iter::once((head.clone(), Vec::new())))
        .collect();

    let head_floor = ranges.last().map(|range| range.max_job_id);
    for status in statuses {
        // Ranges are ordered by job id, so the first candidate whose max
        // covers the job is the only one that can hold it.
        let at = ranges.partition_point(|range| range.max_job_id < status.job_id);
        match ranges.get(at) {
            Some(range) if range.contains(status.job_id) => groups[at].1.push(status),
            Some(_) => {
                let err = Error::RangeLookup {
                    job_id: status.job_id.to_i64(),
                };
                tracing::warn!(error = %err, "skipping status update for a retired job");
            }
            None => {
                // Above every sealed range; sanity-checked against the head
                // floor, though by construction it always passes.
                if head_floor.is_none_or(|floor| status.job_id > floor) {
                    let head_group = groups.last_mut().expect("head group always present");
                    head_group.1.push(status);
                }
            }
        }
    }

    groups.retain(|(_, statuses)| !statuses.is_empty());
    groups
}

/// Appends status rows across all affected datasets in one transaction.
///
/// The filter arguments describe which `(custom_val, parameter)` slices of
/// the queue the report covers; they are recorded for observability and cache
/// invalidation by callers, not used to restrict the write.
#[tracing::instrument(
    skip_all,
    fields(
        statuses = statuses.len(),
        custom_vals = ?custom_val_filters,
        parameters = parameter_filters.len(),
    ),
    err
)]
pub(crate) async fn update_job_status(
    pool: &ConnPool,
    ranges: &[DatasetRange],
    head: &Dataset,
    statuses: &[JobStatus],
    custom_val_filters: &[String],
    parameter_filters: &[ParameterFilter],
) -> Result<(), Error> {
    let groups = partition_by_dataset(statuses, ranges, head);
    if groups.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await.map_err(Error::Database)?;
    for (ds, group) in &groups {
        let mut data = CopyBuffer::new();
        for status in group {
            data.field(&status.job_id.to_string())
                .field(status.job_state.as_str())
                .field(&status.attempt.to_string())
                .timestamp_field(status.exec_time.as_ref())
                .timestamp_field(status.retry_time.as_ref())
                .field(&status.error_code)
                .field(status.error_response.as_str())
                .end_row();
        }

        let map_err = |err: sqlx::Error| Error::for_dataset_table(err, ds, &ds.job_status_table);
        let mut copy = tx.copy_in_raw(&copy_status_sql(ds)).await.map_err(map_err)?;
        copy.send(data.into_bytes()).await.map_err(map_err)?;
        copy.finish().await.map_err(map_err)?;
    }
    tx.commit().await.map_err(Error::Database)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use sqlx::types::chrono::Utc;

    use super::*;
    use crate::jobs::{JobState, JobStatus};

    fn ds(index: &str) -> Dataset {
        Dataset::new("tt", index.parse().unwrap())
    }

    fn range(index: &str, min: i64, max: i64) -> DatasetRange {
        DatasetRange {
            min_job_id: min.into(),
            max_job_id: max.into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            ds: ds(index),
        }
    }

    fn status(job_id: i64) -> JobStatus {
        JobStatus::new(job_id.into(), JobState::Succeeded)
    }

    #[test]
    fn statuses_split_across_the_datasets_that_hold_them() {
        let ranges = [range("1", 1, 10), range("2", 11, 20)];
        let statuses = [status(1), status(15), status(10), status(40)];

        let groups = partition_by_dataset(&statuses, &ranges, &ds("3"));
        let summary: Vec<(String, Vec<i64>)> = groups
            .iter()
            .map(|(ds, group)| {
                (
                    ds.job_status_table.clone(),
                    group.iter().map(|s| s.job_id.to_i64()).collect(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            [
                ("tt_job_status_1".to_owned(), vec![1, 10]),
                ("tt_job_status_2".to_owned(), vec![15]),
                ("tt_job_status_3".to_owned(), vec![40]),
            ]
        );
    }

    #[test]
    fn retired_jobs_are_skipped() {
        // Dataset "1" (ids 1..=10) has been dropped; its range is gone and
        // the remaining ranges start at 11.
        let ranges = [range("2", 11, 20)];
        let statuses = [status(5), status(12)];

        let groups = partition_by_dataset(&statuses, &ranges, &ds("3"));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0.job_status_table, "tt_job_status_2");
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[0].1[0].job_id.to_i64(), 12);
    }

    #[test]
    fn everything_lands_in_the_head_when_no_dataset_is_sealed() {
        let statuses = [status(7), status(8)];
        let groups = partition_by_dataset(&statuses, &[], &ds("1"));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0.job_table, "tt_jobs_1");
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn copy_statement_targets_the_status_columns_in_order() {
        assert_eq!(
            copy_status_sql(&ds("1")),
            r#"COPY "tt_job_status_1" ("job_id", "job_state", "attempt", "exec_time", "retry_time", "error_code", "error_response") FROM STDIN"#
        );
    }
}
