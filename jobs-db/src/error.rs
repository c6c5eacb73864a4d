//! Error types for jobs-db operations

/// Errors that can occur when interacting with the jobs DB.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to establish a connection to the jobs DB.
    ///
    /// This error is considered retryable. See `is_connection_error()`.
    #[error("Error connecting to jobs db: {0}")]
    Connection(sqlx::Error),

    /// A database query failed.
    ///
    /// Covers everything from lost connections (retryable, see
    /// `is_retryable()`) to constraint violations and malformed payloads
    /// (see `is_invalid_payload()`).
    #[error("Error executing database query: {0}")]
    Database(#[source] sqlx::Error),

    /// A dataset table expected from the cached dataset list is missing from
    /// the store. The caller should refresh the dataset registry and retry.
    #[error("Dataset table {table} missing for index {index}")]
    SchemaDrift { index: String, table: String },

    /// A dataset index string, or a pair of them, could not be interpreted.
    ///
    /// Fatal to the admin operation that supplied the input; running workers
    /// are unaffected.
    #[error("Invalid dataset index input {input:?}: {reason}")]
    IndexArithmetic { input: String, reason: String },

    /// A status update referenced a job ID outside every known dataset range.
    /// The job has been retired; the update is logged and skipped.
    #[error("Job {job_id} is outside every known dataset range")]
    RangeLookup { job_id: i64 },
}

impl Error {
    pub(crate) fn index_arithmetic(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::IndexArithmetic {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a query error against a specific dataset table, turning
    /// "relation does not exist" into [`Error::SchemaDrift`] so the caller
    /// knows to refresh the dataset registry.
    pub(crate) fn for_dataset_table(
        err: sqlx::Error,
        ds: &crate::dataset::Dataset,
        table: &str,
    ) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err
                .code()
                .is_some_and(|code| code.as_ref() == pg_error_codes::UNDEFINED_TABLE)
            {
                return Error::SchemaDrift {
                    index: ds.index.to_string(),
                    table: table.to_owned(),
                };
            }
        }
        Error::Database(err)
    }

    /// Returns `true` if the error is likely a transient connection issue and
    /// the operation can be retried as-is.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Returns `true` for connection losses plus the transaction-level errors
    /// (serialization failure, deadlock) that are safe to retry from the top
    /// of the transaction.
    pub fn is_retryable(&self) -> bool {
        if self.is_connection_error() {
            return true;
        }
        matches!(
            self,
            Error::Database(sqlx::Error::Database(err))
                if err.code().is_some_and(|code| matches!(
                    code.as_ref(),
                    pg_error_codes::SERIALIZATION_FAILURE | pg_error_codes::DEADLOCK_DETECTED
                ))
        )
    }

    /// Returns `true` if the backend rejected a value's text representation,
    /// which for our JSON payload columns means the payload is not valid
    /// JSON.
    pub fn is_invalid_payload(&self) -> bool {
        matches!(
            self,
            Error::Database(sqlx::Error::Database(err))
                if err.code().is_some_and(
                    |code| code.as_ref() == pg_error_codes::INVALID_TEXT_REPRESENTATION
                )
        )
    }
}

impl From<crate::db::ConnError> for Error {
    fn from(err: crate::db::ConnError) -> Self {
        match err {
            crate::db::ConnError::ConnectionError(err) => Error::Connection(err),
        }
    }
}

/// PostgreSQL error codes this crate keys behavior off.
///
/// For reference: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
pub(crate) mod pg_error_codes {
    /// Invalid text representation; raised when casting a malformed literal,
    /// e.g. a broken JSON payload.
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";

    /// Serialization failure between concurrent transactions.
    pub const SERIALIZATION_FAILURE: &str = "40001";

    /// Deadlock detected; one transaction is aborted and should be retried.
    pub const DEADLOCK_DETECTED: &str = "40P01";

    /// Undefined table; a dataset table disappeared under us.
    pub const UNDEFINED_TABLE: &str = "42P01";
}
