//! Job and job-status records

use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

/// A unique identifier for a job.
///
/// Assigned by the store on insert, strictly increasing within a dataset and
/// across the dataset sequence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Convert the [`JobId`] to an `i64`.
    pub fn to_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque JSON text carried through the queue.
///
/// Deliberately *not* a parsed JSON value: producers may hand us broken
/// payloads, and the whole point of the per-row store fallback is to let the
/// backend reject those individually while the rest of the batch lands. The
/// text is validated by the database on insert, never by this crate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JsonPayload(String);

impl JsonPayload {
    /// An empty JSON object, the default for absent error responses.
    pub fn empty_object() -> Self {
        Self("{}".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for JsonPayload {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl From<&str> for JsonPayload {
    fn from(text: &str) -> Self {
        Self(text.to_owned())
    }
}

impl From<serde_json::Value> for JsonPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value.to_string())
    }
}

impl sqlx::Type<sqlx::Postgres> for JsonPayload {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        ["TEXT", "JSON", "JSONB"]
            .iter()
            .any(|name| *ty == sqlx::postgres::PgTypeInfo::with_name(name))
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JsonPayload {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let buf = value.as_bytes()?;
        // Binary jsonb values carry a one-byte version tag; JSON text never
        // starts with 0x01.
        let buf = if buf.first() == Some(&1) { &buf[1..] } else { buf };
        Ok(Self(std::str::from_utf8(buf)?.to_owned()))
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JsonPayload {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.0.as_str(), buf)
    }
}

/// The state recorded by one status row.
///
/// The state of a job is the state of its *latest* status row; a job with no
/// status rows at all is `NotPickedYet`. Terminal states are sticky: once a
/// job reaches one, no further status rows are appended for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// No consumer has leased the job yet. This is the implicit state of a
    /// job without status rows; it is never written to the store.
    NotPickedYet,

    /// A consumer holds a lease and is processing the job.
    Executing,

    /// Delivery is blocked on an upstream condition.
    Waiting,

    /// A failed attempt is waiting for its retry time.
    WaitingRetry,

    /// The last attempt failed; eligible for retry once `retry_time` passes.
    Failed,

    /// Delivered. Terminal.
    Succeeded,

    /// Given up on. Terminal.
    Aborted,

    /// The job is being moved to another dataset.
    Migrating,

    /// The job was moved to another dataset. Terminal.
    Migrated,

    /// The job was considered for migration and skipped. Terminal.
    WontMigrate,
}

impl JobState {
    /// Every job state, in declaration order.
    pub const ALL: [JobState; 10] = [
        Self::NotPickedYet,
        Self::Executing,
        Self::Waiting,
        Self::WaitingRetry,
        Self::Failed,
        Self::Succeeded,
        Self::Aborted,
        Self::Migrating,
        Self::Migrated,
        Self::WontMigrate,
    ];

    /// Whether the state is sticky: no further status rows follow it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Aborted | Self::Migrated | Self::WontMigrate
        )
    }

    /// Convert the [`JobState`] to its wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPickedYet => "not_picked_yet",
            Self::Executing => "executing",
            Self::Waiting => "waiting",
            Self::WaitingRetry => "waiting_retry",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::Aborted => "aborted",
            Self::Migrating => "migrating",
            Self::Migrated => "migrated",
            Self::WontMigrate => "wont_migrate",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized job state string.
#[derive(Debug, thiserror::Error)]
#[error("Invalid job state: {0}")]
pub struct InvalidJobState(String);

impl std::str::FromStr for JobState {
    type Err = InvalidJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| s.eq_ignore_ascii_case(state.as_str()))
            .copied()
            .ok_or_else(|| InvalidJobState(s.to_owned()))
    }
}

impl serde::Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for JobState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: &str = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl sqlx::Type<sqlx::Postgres> for JobState {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobState {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        Ok(value.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One appended status row.
///
/// Status rows are append-only; the effective state of a job is the row with
/// the highest status-table id for that job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: JobId,
    pub job_state: JobState,
    /// How many delivery attempts have been made, counting this one.
    pub attempt: i32,
    pub exec_time: Option<DateTime<Utc>>,
    pub retry_time: Option<DateTime<Utc>>,
    /// Backend response code, e.g. an HTTP status. Empty when not applicable.
    pub error_code: String,
    pub error_response: JsonPayload,
}

impl JobStatus {
    /// A minimal status row moving a job into `state`.
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            job_state: state,
            attempt: 0,
            exec_time: None,
            retry_time: None,
            error_code: String::new(),
            error_response: JsonPayload::empty_object(),
        }
    }
}

/// A queued unit of work. Immutable once written.
#[derive(Debug, Clone)]
pub struct Job {
    /// Store-assigned identifier; zero until the job is stored.
    pub job_id: JobId,
    /// Caller-supplied globally unique identity, used to report per-job
    /// diagnostics from best-effort stores.
    pub uuid: Uuid,
    /// Opaque originator key; readers preserve per-user ordering.
    pub user_id: String,
    /// Short routing/filtering tag, e.g. `"GW"` or `"WEBHOOK"`.
    pub custom_val: String,
    /// Opaque routing parameters.
    pub parameters: JsonPayload,
    /// The event body itself.
    pub event_payload: JsonPayload,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    /// Latest status row, when the job was read back from the store. `None`
    /// means `not_picked_yet`.
    pub last_job_status: Option<JobStatus>,
}

impl Job {
    /// A job ready for storing. Timestamps are assigned by the store.
    pub fn new(
        uuid: Uuid,
        user_id: impl Into<String>,
        custom_val: impl Into<String>,
        parameters: impl Into<JsonPayload>,
        event_payload: impl Into<JsonPayload>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId(0),
            uuid,
            user_id: user_id.into(),
            custom_val: custom_val.into(),
            parameters: parameters.into(),
            event_payload: event_payload.into(),
            created_at: now,
            expire_at: now,
            last_job_status: None,
        }
    }

    /// The effective state of the job as last read.
    pub fn state(&self) -> JobState {
        self.last_job_status
            .as_ref()
            .map(|status| status.job_state)
            .unwrap_or(JobState::NotPickedYet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_strings_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("totally_bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states_are_exactly_the_sticky_ones() {
        let terminal: Vec<_> = JobState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            [
                &JobState::Succeeded,
                &JobState::Aborted,
                &JobState::Migrated,
                &JobState::WontMigrate
            ]
        );
    }

    #[test]
    fn unstored_job_reads_as_not_picked_yet() {
        let job = Job::new(Uuid::new_v4(), "user-1", "GW", "{}", "{}");
        assert_eq!(job.state(), JobState::NotPickedYet);
        assert_eq!(job.job_id.to_i64(), 0);
    }
}
