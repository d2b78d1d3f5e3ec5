//! # Schema Migrations
//!
//! The queue schema ships inside the binary. `Database::new` applies
//! whatever the file has not seen yet, so a reader upgraded in the field
//! migrates its existing queue on the next start.
//!
//! ```text
//!   migrations/sqlite/
//!     └── 001_sensor_readings.sql   table, indexes, CHECKs, immutability triggers
//!
//!   _sqlx_migrations   bookkeeping table sqlx keeps next to ours
//! ```
//!
//! New schema goes in a new `NNN_description.sql`. Files already released
//! are never edited; sqlx checksums them and refuses to start otherwise.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// How far a queue file is behind the embedded schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub embedded: usize,
    pub applied: usize,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        self.applied >= self.embedded
    }
}

/// Applies every embedded migration the database is missing.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    debug!(embedded = MIGRATOR.migrations.len(), "Applying schema migrations");
    MIGRATOR.run(pool).await?;
    info!("Queue schema is current");
    Ok(())
}

/// Compares the embedded migrations against the bookkeeping table.
///
/// A file that was never migrated has no bookkeeping table and reports
/// zero applied.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<MigrationStatus> {
    let applied: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    Ok(MigrationStatus {
        embedded: MIGRATOR.migrations.len(),
        applied: usize::try_from(applied).unwrap_or(0),
    })
}
