//! # Storage Error Types
//!
//! What can go wrong between the tasks and the SQLite queue file.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sqlx::Error / MigrateError / serde_json::Error                         │
//! │        │                                                                │
//! │        ▼  From impls below                                              │
//! │  DbError ─────► AgentError::Storage                                     │
//! │                    │                                                    │
//! │                    ├── at startup: process exits                        │
//! │                    └── in a task: logged, retried on the next tick      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Failure of a queue or pool operation.
#[derive(Debug, Error)]
pub enum DbError {
    /// The queue file could not be opened or the pool is gone.
    ///
    /// ## When This Occurs
    /// - Parent directory cannot be created
    /// - No write permission on the data directory
    /// - The pool was closed during shutdown
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An embedded migration could not be applied.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A CHECK constraint or trigger rejected the write.
    ///
    /// ## When This Occurs
    /// - Empty point name
    /// - Active priority outside 1..=16
    /// - Attempt to modify a stored reading
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// SQLite refused the statement for another reason.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Begin or commit of a multi-row write failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// No pooled connection became free in time.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Caller passed an argument the queue cannot honour.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored column could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Anything sqlx reports that fits none of the above.
    #[error("Internal database error: {0}")]
    Internal(String),
}

/// SQLite messages that mean a constraint or trigger said no.
const CONSTRAINT_MARKERS: [&str; 3] = ["constraint failed", "cannot revert", "immutable"];

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                // CHECK failures read "CHECK constraint failed: ...", RAISE(ABORT)
                // carries the trigger's own text.
                let message = db_err.message().to_string();
                if CONSTRAINT_MARKERS.iter().any(|m| message.contains(m)) {
                    DbError::ConstraintViolation(message)
                } else {
                    DbError::QueryFailed(message)
                }
            }
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool closed".into()),
            sqlx::Error::Io(io) => DbError::ConnectionFailed(io.to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::Serialization(format!("column {}: {}", index, source))
            }
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result alias used across heitz-db.
pub type DbResult<T> = Result<T, DbError>;
