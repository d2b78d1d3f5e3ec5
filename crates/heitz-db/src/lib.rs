//! # heitz-db: Local Durable Reading Queue
//!
//! Readings are written here by the poller and read back by the sync agent.
//! Nothing leaves this crate half-written: every write is one transaction.
//!
//! ## Where It Sits
//! ```text
//!   SensorPoller ──store──►  ReadingQueue  ◄──fetch_unposted / mark_posted── SyncAgent
//!                                 │                    prune ──────────────┘
//!                                 ▼
//!                      Database (SqlitePool, WAL, writer lock)
//!                                 │
//!                                 ▼
//!                      ./data/sensor_data.db  (001_sensor_readings.sql)
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - `Database` and `DbConfig`: opening the file, pragmas
//! - [`migrations`] - Schema applied at open, plus a status query
//! - [`error`] - Storage error types
//! - [`repository`] - The reading queue
//!
//! ## Usage
//!
//! ```rust,ignore
//! use heitz_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("./data/sensor_data.db")).await?;
//!
//! let ids = db.readings().store(&batch).await?;
//! let pending = db.readings().fetch_unposted(500).await?;
//! db.readings().mark_posted(&ids).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use migrations::MigrationStatus;
pub use pool::{Database, DbConfig};

pub use repository::readings::{QueueStats, ReadingQueue};
