pub mod device_token_repository;
pub mod event_repository;
pub mod notification_history_repository;

pub use device_token_repository::{SqliteTokenStore, TokenStore};
pub use event_repository::{EventStore, SqliteEventStore};
pub use notification_history_repository::{HistoryStore, SqliteHistoryStore};

use crate::error::AppError;

/// Error type shared by all stores. `Unavailable` marks connection-level
/// failures the registrar may degrade on; everything else is a real fault.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Split connection-level sqlx failures from query-level ones.
pub(crate) fn classify_sqlx(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Database(e),
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => AppError::ServiceUnavailable(msg),
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// In-memory database with the real migrations applied. A single
    /// connection is required: every pooled connection would otherwise get
    /// its own empty `:memory:` database.
    pub(crate) async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("failed to open in-memory database");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("failed to run migrations");
        pool
    }
}
