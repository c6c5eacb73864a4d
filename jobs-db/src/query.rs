//! Query engine
//!
//! Reads walk the dataset sequence oldest-first, composing one parameterized
//! select per dataset and concatenating the results until the requested count
//! is filled. The effective state of a job is taken from its latest status
//! row (`MAX(id)` per job); jobs without any status row are "unprocessed".

use sqlx::{
    types::chrono::{DateTime, NaiveDateTime, Utc},
    Executor, Postgres,
};
use uuid::Uuid;

use crate::{
    dataset::Dataset,
    db::ConnPool,
    error::Error,
    jobs::{Job, JobState, JobStatus, JsonPayload},
};

/// A filter on a top-level key of the job's `parameters` document.
#[derive(Debug, Clone)]
pub struct ParameterFilter {
    pub name: String,
    pub value: String,
    /// Optional filters are OR-ed together into one group; required filters
    /// must all match.
    pub optional: bool,
}

/// Parameters for the job read operations.
#[derive(Debug, Clone, Default)]
pub struct GetQueryParams {
    /// Restrict to jobs carrying one of these `custom_val` tags.
    pub custom_val_filters: Vec<String>,
    /// Restrict on top-level keys of the `parameters` document.
    pub parameter_filters: Vec<ParameterFilter>,
    /// Extra restriction on the latest job state, AND-ed into the per-read
    /// state set.
    pub state_filters: Vec<JobState>,
    /// Maximum number of jobs to return across all datasets. Zero means no
    /// limit.
    pub count: usize,
    /// Per-tenant sub-limits from the dispatch planner, keyed by the tenant's
    /// user id. When set, each tenant is fetched separately under its own
    /// cap; the global `count` still bounds the total.
    pub tenant_limits: Option<Vec<(String, usize)>>,
}

impl GetQueryParams {
    pub fn with_count(count: usize) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }
}

/// Escapes a literal for direct inclusion in a single-quoted SQL string.
fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// ` AND (job_state='x' OR job_state='y')` over the status subquery rows, or
/// empty when no states are given.
fn state_query(states: &[JobState]) -> String {
    if states.is_empty() {
        return String::new();
    }
    let alternatives = states
        .iter()
        .map(|state| format!("job_state='{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(" AND ({alternatives})")
}

/// ` AND (j.custom_val='GW' OR ...)`, or empty when no filters are given.
fn custom_val_query(custom_vals: &[String]) -> String {
    if custom_vals.is_empty() {
        return String::new();
    }
    let alternatives = custom_vals
        .iter()
        .map(|custom_val| format!("j.custom_val='{}'", quote_literal(custom_val)))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(" AND ({alternatives})")
}

/// Required parameter filters AND-ed in, optional ones OR-ed into one group.
fn parameter_query(filters: &[ParameterFilter]) -> String {
    let mut sql = String::new();
    for filter in filters.iter().filter(|filter| !filter.optional) {
        sql.push_str(&format!(
            " AND j.parameters->>'{}'='{}'",
            quote_literal(&filter.name),
            quote_literal(&filter.value)
        ));
    }
    let optional: Vec<String> = filters
        .iter()
        .filter(|filter| filter.optional)
        .map(|filter| {
            format!(
                "j.parameters->>'{}'='{}'",
                quote_literal(&filter.name),
                quote_literal(&filter.value)
            )
        })
        .collect();
    if !optional.is_empty() {
        sql.push_str(&format!(" AND ({})", optional.join(" OR ")));
    }
    sql
}

fn user_query(user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) => format!(" AND j.user_id='{}'", quote_literal(user_id)),
        None => String::new(),
    }
}

fn limit_query(limit: usize) -> String {
    if limit == 0 {
        String::new()
    } else {
        format!(" LIMIT {limit}")
    }
}

/// Select over jobs with no status row at all.
fn unprocessed_sql(ds: &Dataset, params: &GetQueryParams, user_id: Option<&str>, limit: usize) -> String {
    format!(
        "SELECT j.job_id, j.uuid, j.user_id, j.parameters, j.custom_val, j.event_payload, \
         j.created_at, j.expire_at \
         FROM \"{jobs}\" j \
         WHERE j.job_id NOT IN (SELECT DISTINCT(job_id) FROM \"{status}\"){custom_val}{parameters}{user} \
         ORDER BY j.job_id{limit}",
        jobs = ds.job_table,
        status = ds.job_status_table,
        custom_val = custom_val_query(&params.custom_val_filters),
        parameters = parameter_query(&params.parameter_filters),
        user = user_query(user_id),
        limit = limit_query(limit),
    )
}

/// Select over jobs whose latest status row matches a state set, optionally
/// requiring `retry_time` to have passed ($1).
fn processed_sql(
    ds: &Dataset,
    params: &GetQueryParams,
    states: &[JobState],
    retry_due_only: bool,
    user_id: Option<&str>,
    limit: usize,
) -> String {
    let retry = if retry_due_only {
        " AND s.retry_time < $1"
    } else {
        ""
    };
    format!(
        "SELECT j.job_id, j.uuid, j.user_id, j.parameters, j.custom_val, j.event_payload, \
         j.created_at, j.expire_at, \
         s.job_state, s.attempt, s.exec_time, s.retry_time, s.error_code, s.error_response \
         FROM \"{jobs}\" j, \
         (SELECT job_id, job_state, attempt, exec_time, retry_time, error_code, error_response \
         FROM \"{status}\" WHERE id IN (SELECT MAX(id) FROM \"{status}\" GROUP BY job_id){state}) AS s \
         WHERE j.job_id = s.job_id{custom_val}{parameters}{user}{retry} \
         ORDER BY j.job_id{limit}",
        jobs = ds.job_table,
        status = ds.job_status_table,
        state = state_query(states),
        custom_val = custom_val_query(&params.custom_val_filters),
        parameters = parameter_query(&params.parameter_filters),
        user = user_query(user_id),
        retry = retry,
        limit = limit_query(limit),
    )
}

type UnprocessedRow = (
    i64,
    Uuid,
    String,
    JsonPayload,
    String,
    JsonPayload,
    NaiveDateTime,
    NaiveDateTime,
);

type ProcessedRow = (
    i64,
    Uuid,
    String,
    JsonPayload,
    String,
    JsonPayload,
    NaiveDateTime,
    NaiveDateTime,
    JobState,
    i32,
    Option<NaiveDateTime>,
    Option<NaiveDateTime>,
    Option<String>,
    Option<JsonPayload>,
);

fn job_from_parts(row: UnprocessedRow, status: Option<JobStatus>) -> Job {
    let (job_id, uuid, user_id, parameters, custom_val, event_payload, created_at, expire_at) = row;
    Job {
        job_id: job_id.into(),
        uuid,
        user_id,
        custom_val,
        parameters,
        event_payload,
        created_at: created_at.and_utc(),
        expire_at: expire_at.and_utc(),
        last_job_status: status,
    }
}

fn job_from_processed(row: ProcessedRow) -> Job {
    let (
        job_id,
        uuid,
        user_id,
        parameters,
        custom_val,
        event_payload,
        created_at,
        expire_at,
        job_state,
        attempt,
        exec_time,
        retry_time,
        error_code,
        error_response,
    ) = row;
    let status = JobStatus {
        job_id: job_id.into(),
        job_state,
        attempt,
        exec_time: exec_time.map(|ts| ts.and_utc()),
        retry_time: retry_time.map(|ts| ts.and_utc()),
        error_code: error_code.unwrap_or_default(),
        error_response: error_response.unwrap_or_else(JsonPayload::empty_object),
    };
    job_from_parts(
        (
            job_id,
            uuid,
            user_id,
            parameters,
            custom_val,
            event_payload,
            created_at,
            expire_at,
        ),
        Some(status),
    )
}

/// Runs the unprocessed select against one dataset.
async fn fetch_unprocessed_ds<'c, E>(
    exe: E,
    ds: &Dataset,
    params: &GetQueryParams,
    user_id: Option<&str>,
    limit: usize,
) -> Result<Vec<Job>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = unprocessed_sql(ds, params, user_id, limit);
    let rows: Vec<UnprocessedRow> = sqlx::query_as(&sql).fetch_all(exe).await?;
    Ok(rows
        .into_iter()
        .map(|row| job_from_parts(row, None))
        .collect())
}

/// Runs the latest-status select against one dataset.
async fn fetch_processed_ds<'c, E>(
    exe: E,
    ds: &Dataset,
    params: &GetQueryParams,
    states: &[JobState],
    retry_before: Option<DateTime<Utc>>,
    user_id: Option<&str>,
    limit: usize,
) -> Result<Vec<Job>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = processed_sql(ds, params, states, retry_before.is_some(), user_id, limit);
    let mut query = sqlx::query_as::<_, ProcessedRow>(&sql);
    if let Some(now) = retry_before {
        query = query.bind(now.naive_utc());
    }
    let rows = query.fetch_all(exe).await?;
    Ok(rows.into_iter().map(job_from_processed).collect())
}

/// A row budget that may be unlimited (zero request count).
#[derive(Debug, Clone, Copy)]
struct Budget(Option<usize>);

impl Budget {
    fn new(count: usize) -> Self {
        Self((count > 0).then_some(count))
    }

    fn exhausted(&self) -> bool {
        self.0 == Some(0)
    }

    fn consume(&mut self, rows: usize) {
        if let Some(remaining) = &mut self.0 {
            *remaining = remaining.saturating_sub(rows);
        }
    }

    /// The tighter of two budgets as a LIMIT value; zero means no limit.
    fn limit_with(&self, other: &Budget) -> usize {
        match (self.0, other.0) {
            (None, None) => 0,
            (Some(limit), None) | (None, Some(limit)) => limit,
            (Some(a), Some(b)) => a.min(b),
        }
    }
}

/// The slices a read is split into: per tenant when sub-limits are given,
/// otherwise one unrestricted slice. Empty tenant allocations are dropped.
fn read_slices(params: &GetQueryParams) -> Vec<(Option<String>, Budget)> {
    match &params.tenant_limits {
        Some(limits) => limits
            .iter()
            .filter(|(_, limit)| *limit > 0)
            .map(|(tenant, limit)| (Some(tenant.clone()), Budget::new(*limit)))
            .collect(),
        None => vec![(None, Budget(None))],
    }
}

/// Jobs with no status row, oldest dataset first.
pub(crate) async fn get_unprocessed(
    pool: &ConnPool,
    datasets: &[Dataset],
    params: &GetQueryParams,
) -> Result<Vec<Job>, Error> {
    let mut jobs = Vec::new();
    let mut global = Budget::new(params.count);
    for (user_id, mut tenant) in read_slices(params) {
        for ds in datasets {
            if global.exhausted() {
                return Ok(jobs);
            }
            if tenant.exhausted() {
                break;
            }
            let limit = global.limit_with(&tenant);
            let fetched = fetch_unprocessed_ds(&**pool, ds, params, user_id.as_deref(), limit)
                .await
                .map_err(|err| Error::for_dataset_table(err, ds, &ds.job_table))?;
            global.consume(fetched.len());
            tenant.consume(fetched.len());
            jobs.extend(fetched);
        }
    }
    Ok(jobs)
}

/// Jobs whose latest state is in `states`, oldest dataset first. With
/// `retry_before` set, only jobs whose retry time has passed are returned.
async fn get_processed(
    pool: &ConnPool,
    datasets: &[Dataset],
    params: &GetQueryParams,
    states: &[JobState],
    retry_before: Option<DateTime<Utc>>,
) -> Result<Vec<Job>, Error> {
    let states: Vec<JobState> = if params.state_filters.is_empty() {
        states.to_vec()
    } else {
        states
            .iter()
            .filter(|state| params.state_filters.contains(state))
            .copied()
            .collect()
    };

    let mut jobs = Vec::new();
    let mut global = Budget::new(params.count);
    for (user_id, mut tenant) in read_slices(params) {
        for ds in datasets {
            if global.exhausted() {
                return Ok(jobs);
            }
            if tenant.exhausted() {
                break;
            }
            let limit = global.limit_with(&tenant);
            let fetched = fetch_processed_ds(
                &**pool,
                ds,
                params,
                &states,
                retry_before,
                user_id.as_deref(),
                limit,
            )
            .await
            .map_err(|err| Error::for_dataset_table(err, ds, &ds.job_status_table))?;
            global.consume(fetched.len());
            tenant.consume(fetched.len());
            jobs.extend(fetched);
        }
    }
    Ok(jobs)
}

/// Failed jobs whose retry time has passed.
pub(crate) async fn get_to_retry(
    pool: &ConnPool,
    datasets: &[Dataset],
    params: &GetQueryParams,
) -> Result<Vec<Job>, Error> {
    get_processed(pool, datasets, params, &[JobState::Failed], Some(Utc::now())).await
}

/// Jobs waiting on an upstream condition or a retry slot.
pub(crate) async fn get_waiting(
    pool: &ConnPool,
    datasets: &[Dataset],
    params: &GetQueryParams,
) -> Result<Vec<Job>, Error> {
    get_processed(
        pool,
        datasets,
        params,
        &[JobState::Waiting, JobState::WaitingRetry],
        None,
    )
    .await
}

/// Jobs currently leased by a consumer.
pub(crate) async fn get_executing(
    pool: &ConnPool,
    datasets: &[Dataset],
    params: &GetQueryParams,
) -> Result<Vec<Job>, Error> {
    get_processed(pool, datasets, params, &[JobState::Executing], None).await
}
