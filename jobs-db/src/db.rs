//! Internal connection pool implementation
//!
//! Unlike a fixed-schema store there are no migrations to run here: dataset
//! tables are created and dropped at runtime by the registry, so connecting
//! is just pool construction.

use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::config::DEFAULT_ACQUIRE_TIMEOUT;

/// Errors that can occur when connecting to the jobs DB.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Error connecting to the jobs DB.
    #[error("Error connecting to jobs db: {0}")]
    ConnectionError(#[source] sqlx::Error),
}

/// A connection pool to the jobs DB. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct ConnPool(Pool<Postgres>);

impl ConnPool {
    /// Sets up a connection pool to the jobs DB.
    #[tracing::instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, ConnError> {
        PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map(Self)
            .map_err(ConnError::ConnectionError)
    }
}

impl std::ops::Deref for ConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
