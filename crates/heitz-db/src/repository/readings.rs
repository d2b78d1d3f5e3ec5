//! # Reading Queue Repository
//!
//! The local durable queue between the poller and the sync agent.
//!
//! ## Queue Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Reading Lifecycle                                    │
//! │                                                                         │
//! │  POLLER TICK (N points)                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          store(batch) ── writer lock + SINGLE TRANSACTION       │   │
//! │  │                                                                 │   │
//! │  │  INSERT reading 1 ... INSERT reading N   (posted = 0)          │   │
//! │  │  COMMIT ← all N rows or none                                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      SYNC AGENT CYCLE                           │   │
//! │  │                                                                 │   │
//! │  │  1. fetch_unposted(limit)  ORDER BY id ASC                     │   │
//! │  │  2. POST batch to backend                                      │   │
//! │  │  3. mark_posted(acked ids) ── writer lock + ONE TRANSACTION    │   │
//! │  │  4. prune(retention)       ── only posted AND old rows         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • A tick is stored whole or not at all                                │
//! │  • posted moves 0 → 1 once and never back                              │
//! │  • An unposted reading is never pruned, however old                    │
//! │  • Fetch order is insertion order                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use heitz_core::{NewReading, Reading};

/// Ids per `UPDATE ... WHERE id IN (...)` statement; keeps each statement
/// well under SQLite's bound-parameter limit.
const MARK_CHUNK_SIZE: usize = 500;

// =============================================================================
// Queue Statistics
// =============================================================================

/// Counts reported after each sync cycle and by `heitz-reader stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub total: u64,
    pub unposted: u64,
    pub posted: u64,
    /// Acquisition time of the oldest reading still waiting to be posted.
    pub oldest_unposted: Option<DateTime<Utc>>,
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ReadingRow {
    id: i64,
    point_name: String,
    value: Option<f64>,
    unit: String,
    error: Option<String>,
    priority_array: Option<String>,
    active_priority: Option<i64>,
    timestamp: i64,
    posted: bool,
    posted_at: Option<i64>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = DbError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        let priority_array = row
            .priority_array
            .as_deref()
            .map(serde_json::from_str::<Vec<Option<f64>>>)
            .transpose()?;

        let active_priority = row
            .active_priority
            .map(u8::try_from)
            .transpose()
            .map_err(|e| DbError::Serialization(format!("active_priority: {}", e)))?;

        Ok(Reading {
            id: row.id,
            point_name: row.point_name,
            value: row.value,
            unit: row.unit,
            error: row.error,
            priority_array,
            active_priority,
            timestamp: from_millis(row.timestamp)?,
            posted: row.posted,
            posted_at: row.posted_at.map(from_millis).transpose()?,
        })
    }
}

fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::Serialization(format!("timestamp out of range: {}", ms)))
}

// =============================================================================
// Reading Queue
// =============================================================================

/// Repository for the reading queue.
///
/// Every handle returned by [`Database::readings`](crate::Database::readings)
/// shares one writer lock, so `store`, `mark_posted` and `prune` never
/// interleave. `fetch_unposted` and `stats` take no lock; WAL gives them a
/// consistent snapshot.
#[derive(Debug, Clone)]
pub struct ReadingQueue {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl ReadingQueue {
    /// Creates a new ReadingQueue.
    pub fn new(pool: SqlitePool, write_lock: Arc<Mutex<()>>) -> Self {
        ReadingQueue { pool, write_lock }
    }

    /// Appends a batch of readings in one transaction.
    ///
    /// ## Arguments
    /// * `readings` - One poller tick: every configured point, failures included
    ///
    /// ## Returns
    /// The assigned ids, in batch order. An empty batch stores nothing.
    ///
    /// ## Errors
    /// Any failure rolls back the whole batch; nothing from it is visible.
    pub async fn store(&self, readings: &[NewReading]) -> DbResult<Vec<i64>> {
        if readings.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        // Dropping `tx` on an early return rolls it back.
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(readings.len());

        for reading in readings {
            let priority_array = reading
                .priority_array
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let result = sqlx::query(
                r#"
                INSERT INTO sensor_readings (
                    point_name, value, unit, error, priority_array,
                    active_priority, timestamp, posted, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
                "#,
            )
            .bind(&reading.point_name)
            .bind(reading.value)
            .bind(&reading.unit)
            .bind(&reading.error)
            .bind(priority_array)
            .bind(reading.active_priority.map(i64::from))
            .bind(reading.timestamp.timestamp_millis())
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

            ids.push(result.last_insert_rowid());
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(count = ids.len(), "Stored readings");
        Ok(ids)
    }

    /// Gets readings waiting to be posted, oldest first.
    ///
    /// ## Arguments
    /// * `limit` - Maximum readings to return (must be positive)
    ///
    /// ## Returns
    /// Up to `limit` readings with `posted = false`, ordered by ascending id.
    /// An empty queue returns an empty vector.
    pub async fn fetch_unposted(&self, limit: u32) -> DbResult<Vec<Reading>> {
        if limit == 0 {
            return Err(DbError::InvalidArgument(
                "fetch limit must be positive".to_string(),
            ));
        }

        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT
                id, point_name, value, unit, error, priority_array,
                active_priority, timestamp, posted, posted_at
            FROM sensor_readings
            WHERE posted = 0
            ORDER BY id ASC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    /// Marks readings as acknowledged by the backend.
    ///
    /// ## Arguments
    /// * `ids` - Reading ids; duplicates and already-posted ids are ignored
    ///
    /// ## Returns
    /// Number of readings that moved from unposted to posted.
    ///
    /// All ids are updated in one transaction, so a crash leaves either the
    /// whole set marked or none of it.
    pub async fn mark_posted(&self, ids: &[i64]) -> DbResult<u64> {
        let ids: Vec<i64> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for chunk in ids.chunks(MARK_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE sensor_readings SET posted = 1, posted_at = ");
            builder.push_bind(now_ms);
            builder.push(" WHERE posted = 0 AND id IN (");

            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            updated += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(requested = ids.len(), updated, "Marked readings posted");
        Ok(updated)
    }

    /// Deletes posted readings older than the retention window.
    ///
    /// ## Arguments
    /// * `retention` - Posted readings acquired before `now - retention` go
    ///
    /// ## Returns
    /// Number of deleted readings. Unposted readings are never deleted.
    pub async fn prune(&self, retention: Duration) -> DbResult<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| DbError::InvalidArgument(format!("retention window: {}", e)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.prune_before(cutoff).await
    }

    /// Deletes posted readings acquired strictly before `cutoff`.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            DELETE FROM sensor_readings
            WHERE posted = 1
            AND timestamp < ?1
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Pruned posted readings");
        }

        Ok(removed)
    }

    /// Counts readings waiting to be posted.
    pub async fn count_unposted(&self) -> DbResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings WHERE posted = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> DbResult<QueueStats> {
        let (total, unposted, oldest): (i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN posted = 0 THEN 1 ELSE 0 END), 0),
                MIN(CASE WHEN posted = 0 THEN timestamp END)
            FROM sensor_readings
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            total: total as u64,
            unposted: unposted as u64,
            posted: (total - unposted) as u64,
            oldest_unposted: oldest.map(from_millis).transpose()?,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration as ChronoDuration;

    async fn queue() -> (Database, ReadingQueue) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.readings();
        (db, queue)
    }

    fn reading(name: &str, value: f64, age: ChronoDuration) -> NewReading {
        NewReading {
            point_name: name.to_string(),
            value: Some(value),
            unit: "°C".to_string(),
            error: None,
            priority_array: None,
            active_priority: None,
            timestamp: Utc::now() - age,
        }
    }

    fn batch(count: usize, age: ChronoDuration) -> Vec<NewReading> {
        (0..count)
            .map(|i| reading(&format!("point_{}", i), i as f64, age))
            .collect()
    }

    #[tokio::test]
    async fn test_store_assigns_increasing_ids() {
        let (_db, queue) = queue().await;

        let ids = queue.store(&batch(3, ChronoDuration::zero())).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let pending = queue.fetch_unposted(10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|r| !r.posted && r.posted_at.is_none()));
    }

    #[tokio::test]
    async fn test_store_empty_batch_is_noop() {
        let (_db, queue) = queue().await;
        assert!(queue.store(&[]).await.unwrap().is_empty());
        assert_eq!(queue.count_unposted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_is_all_or_nothing() {
        let (_db, queue) = queue().await;

        let mut readings = batch(5, ChronoDuration::zero());
        readings[3].point_name = String::new(); // violates CHECK, fails mid-batch

        let err = queue.store(&readings).await.unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
        assert_eq!(queue.stats().await.unwrap().total, 0);

        // The queue is still usable after the rollback.
        queue.store(&batch(2, ChronoDuration::zero())).await.unwrap();
        assert_eq!(queue.count_unposted().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_store_round_trips_failure_and_priority_array() {
        let (_db, queue) = queue().await;

        let mut slots = vec![None; 16];
        slots[7] = Some(21.5);
        let mut commanded = reading("setpoint", 21.5, ChronoDuration::zero());
        commanded.priority_array = Some(slots.clone());
        commanded.active_priority = Some(8);

        let mut failed = reading("pool_ph", 0.0, ChronoDuration::zero());
        failed.value = None;
        failed.error = Some("timeout".to_string());

        let zero = reading("flow_rate", 0.0, ChronoDuration::zero());

        queue.store(&[commanded.clone(), failed, zero]).await.unwrap();
        let stored = queue.fetch_unposted(10).await.unwrap();

        assert_eq!(stored[0].priority_array.as_deref(), Some(slots.as_slice()));
        assert_eq!(stored[0].active_priority, Some(8));
        assert_eq!(
            stored[0].timestamp.timestamp_millis(),
            commanded.timestamp.timestamp_millis()
        );

        assert_eq!(stored[1].value, None);
        assert_eq!(stored[1].error.as_deref(), Some("timeout"));

        assert_eq!(stored[2].value, Some(0.0));
        assert!(stored[2].error.is_none());
    }

    #[tokio::test]
    async fn test_fetch_unposted_is_fifo() {
        let (_db, queue) = queue().await;

        // Timestamps deliberately out of order: fetch order follows insertion.
        queue.store(&[reading("a", 1.0, ChronoDuration::zero())]).await.unwrap();
        queue.store(&[reading("b", 2.0, ChronoDuration::hours(2))]).await.unwrap();
        queue.store(&[reading("c", 3.0, ChronoDuration::hours(1))]).await.unwrap();

        let names: Vec<String> = queue
            .fetch_unposted(3)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.point_name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fetch_unposted_rejects_zero_limit() {
        let (_db, queue) = queue().await;
        assert!(matches!(
            queue.fetch_unposted(0).await,
            Err(DbError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_posted_is_idempotent() {
        let (_db, queue) = queue().await;
        let ids = queue.store(&batch(4, ChronoDuration::zero())).await.unwrap();

        assert_eq!(queue.mark_posted(&ids[..2]).await.unwrap(), 2);
        let after_first = queue.stats().await.unwrap();
        let posted_first: Vec<_> = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT id, posted_at FROM sensor_readings ORDER BY id",
        )
        .fetch_all(&queue.pool)
        .await
        .unwrap();

        assert_eq!(queue.mark_posted(&ids[..2]).await.unwrap(), 0);
        let after_second = queue.stats().await.unwrap();
        let posted_second: Vec<_> = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT id, posted_at FROM sensor_readings ORDER BY id",
        )
        .fetch_all(&queue.pool)
        .await
        .unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(posted_first, posted_second);
        assert_eq!(after_second.posted, 2);
        assert_eq!(after_second.unposted, 2);
    }

    #[tokio::test]
    async fn test_mark_posted_ignores_duplicates_and_unknown_ids() {
        let (_db, queue) = queue().await;
        let ids = queue.store(&batch(2, ChronoDuration::zero())).await.unwrap();

        let updated = queue
            .mark_posted(&[ids[0], ids[0], ids[1], 9_999])
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(queue.count_unposted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_posted_spans_chunks() {
        let (_db, queue) = queue().await;
        let ids = queue
            .store(&batch(MARK_CHUNK_SIZE + 25, ChronoDuration::zero()))
            .await
            .unwrap();

        let updated = queue.mark_posted(&ids).await.unwrap();
        assert_eq!(updated as usize, MARK_CHUNK_SIZE + 25);
        assert_eq!(queue.count_unposted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_posted_flag_never_reverts() {
        let (_db, queue) = queue().await;
        let ids = queue.store(&batch(1, ChronoDuration::zero())).await.unwrap();
        queue.mark_posted(&ids).await.unwrap();

        let err = sqlx::query("UPDATE sensor_readings SET posted = 0 WHERE id = ?1")
            .bind(ids[0])
            .execute(&queue.pool)
            .await
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));

        let err = sqlx::query("UPDATE sensor_readings SET value = 1.0 WHERE id = ?1")
            .bind(ids[0])
            .execute(&queue.pool)
            .await
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_prune_never_removes_unposted() {
        let (_db, queue) = queue().await;

        // A year old and never posted.
        queue.store(&batch(3, ChronoDuration::days(365))).await.unwrap();

        let removed = queue.prune(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(queue.count_unposted().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_prune_respects_retention_window() {
        let (_db, queue) = queue().await;

        let old = queue.store(&batch(2, ChronoDuration::days(8))).await.unwrap();
        let recent = queue.store(&batch(2, ChronoDuration::days(1))).await.unwrap();
        queue.mark_posted(&old).await.unwrap();
        queue.mark_posted(&recent).await.unwrap();

        let removed = queue
            .prune(Duration::from_secs(7 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.posted, 2);
    }

    #[tokio::test]
    async fn test_ten_reading_scenario() {
        let (_db, queue) = queue().await;
        let ids = queue.store(&batch(10, ChronoDuration::minutes(5))).await.unwrap();

        let first = queue.fetch_unposted(5).await.unwrap();
        let first_ids: Vec<i64> = first.iter().map(|r| r.id).collect();
        assert_eq!(first_ids, ids[..5]);

        queue.mark_posted(&first_ids).await.unwrap();

        let second = queue.fetch_unposted(5).await.unwrap();
        let second_ids: Vec<i64> = second.iter().map(|r| r.id).collect();
        assert_eq!(second_ids, ids[5..]);

        let removed = queue.prune(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 5);

        let remaining = queue.fetch_unposted(10).await.unwrap();
        let remaining_ids: Vec<i64> = remaining.iter().map(|r| r.id).collect();
        assert_eq!(remaining_ids, ids[5..]);
        assert_eq!(queue.stats().await.unwrap().total, 5);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_db, queue) = queue().await;
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());

        let ids = queue.store(&batch(3, ChronoDuration::hours(1))).await.unwrap();
        queue.mark_posted(&ids[..1]).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unposted, 2);
        assert_eq!(stats.posted, 1);
        assert!(stats.oldest_unposted.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_batches_stay_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("queue.db")))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = db.readings();
            handles.push(tokio::spawn(async move {
                queue.store(&batch(5, ChronoDuration::zero())).await.unwrap()
            }));
        }

        for handle in handles {
            let ids = handle.await.unwrap();
            assert_eq!(ids.len(), 5);
            assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
        }

        assert_eq!(db.readings().count_unposted().await.unwrap(), 40);
        db.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_never_sees_a_partial_batch() {
        const BATCH: usize = 5;
        const WRITERS: usize = 4;
        const BATCHES_EACH: usize = 10;

        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("queue.db")).max_connections(4))
            .await
            .unwrap();

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let queue = db.readings();
                tokio::spawn(async move {
                    for _ in 0..BATCHES_EACH {
                        queue.store(&batch(BATCH, ChronoDuration::zero())).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let queue = db.readings();
        let reader = tokio::spawn(async move {
            loop {
                let pending = queue.fetch_unposted(u32::MAX).await.unwrap();
                assert_eq!(pending.len() % BATCH, 0, "saw {} readings", pending.len());
                for chunk in pending.chunks(BATCH) {
                    assert_eq!(chunk[0].point_name, "point_0");
                    assert!(chunk.windows(2).all(|w| w[1].id == w[0].id + 1));
                }

                if pending.len() == WRITERS * BATCHES_EACH * BATCH {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        for writer in writers {
            writer.await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(30), reader)
            .await
            .expect("reader never saw every batch")
            .unwrap();

        db.close().await;
    }

    #[tokio::test]
    async fn test_unposted_readings_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor_data.db");

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            let ids = db.readings().store(&batch(3, ChronoDuration::zero())).await.unwrap();
            db.readings().mark_posted(&ids[..1]).await.unwrap();
            db.close().await;
        }

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let pending = db.readings().fetch_unposted(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].point_name, "point_1");
        db.close().await;
    }
}
