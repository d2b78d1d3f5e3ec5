//! # Sensor Poller
//!
//! Reads every configured point on a fixed interval and stores the tick as
//! one batch.
//!
//! ## Tick Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Poller Tick                                 │
//! │                                                                         │
//! │  timestamp = now()            (shared by every reading of the tick)     │
//! │                                                                         │
//! │  for point in points:                                                   │
//! │      timeout(point_timeout, source.read_point(point))                   │
//! │        ├── Ok(sample)    ──► NewReading { value: Some(v), .. }          │
//! │        ├── Err(read)     ──► NewReading { value: None, error: "..." }   │
//! │        └── elapsed       ──► NewReading { value: None, error: timeout } │
//! │                                                                         │
//! │  queue.store(&batch)          (one call, all-or-nothing)                │
//! │        └── Err ──► logged; the next tick supersedes this one            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A tick always produces exactly one reading per configured point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use heitz_core::{NewReading, PointDescriptor};
use heitz_db::ReadingQueue;

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult, ReadError};
use crate::source::PointSource;

// =============================================================================
// Tick Summary
// =============================================================================

/// What one tick stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickSummary {
    /// Readings stored (always the number of configured points).
    pub stored: usize,
    /// How many of them record a failed read.
    pub failed: usize,
}

// =============================================================================
// Sensor Poller
// =============================================================================

/// Periodic point reader.
pub struct SensorPoller {
    source: Arc<dyn PointSource>,
    queue: ReadingQueue,
    points: Vec<PointDescriptor>,
    interval: Duration,
    point_timeout: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running poller.
#[derive(Clone)]
pub struct SensorPollerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SensorPollerHandle {
    /// Asks the poller to stop after its in-flight tick.
    pub async fn shutdown(&self) -> AgentResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| AgentError::ChannelError("Poller already stopped".into()))
    }
}

impl SensorPoller {
    /// Creates a poller and returns its handle.
    pub fn new(
        config: &AgentConfig,
        source: Arc<dyn PointSource>,
        queue: ReadingQueue,
    ) -> (Self, SensorPollerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let poller = SensorPoller {
            source,
            queue,
            points: config.points.clone(),
            interval: config.read_interval(),
            point_timeout: config.point_timeout(),
            shutdown_rx,
        };

        (poller, SensorPollerHandle { shutdown_tx })
    }

    /// Overrides the per-point timeout.
    pub fn with_point_timeout(mut self, timeout: Duration) -> Self {
        self.point_timeout = timeout;
        self
    }

    /// Runs the poller loop until shutdown.
    ///
    /// The first tick fires immediately. A tick in progress when shutdown
    /// arrives completes (including its store) before the loop exits.
    pub async fn run(mut self) {
        info!(
            source = self.source.name(),
            points = self.points.len(),
            interval_secs = self.interval.as_secs(),
            "Sensor poller starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to store readings, skipping this tick");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sensor poller shutting down");
                    break;
                }
            }
        }

        info!("Sensor poller stopped");
    }

    /// Reads every point and stores the batch.
    ///
    /// ## Errors
    /// Only a storage failure; read failures are recorded in the batch.
    pub async fn poll_once(&self) -> AgentResult<TickSummary> {
        let timestamp = Utc::now();
        let batch = self.read_all(timestamp).await;

        let summary = TickSummary {
            stored: batch.len(),
            failed: batch.iter().filter(|r| r.is_failure()).count(),
        };

        self.queue.store(&batch).await?;

        if summary.failed == summary.stored && summary.stored > 0 {
            warn!(points = summary.stored, "No points responded");
        } else {
            info!(
                ok = summary.stored - summary.failed,
                failed = summary.failed,
                "Stored readings"
            );
        }

        Ok(summary)
    }

    /// Acquires one reading per point, in configuration order.
    pub async fn read_all(&self, timestamp: DateTime<Utc>) -> Vec<NewReading> {
        let mut batch = Vec::with_capacity(self.points.len());

        for point in &self.points {
            let result = tokio::time::timeout(self.point_timeout, self.source.read_point(point))
                .await
                .unwrap_or(Err(ReadError::Timeout(self.point_timeout)));

            let reading = match result {
                Ok(sample) => {
                    let reading = NewReading::from_sample(point, sample, timestamp);
                    debug!(
                        point = %point.name,
                        value = ?reading.value,
                        unit = %point.unit,
                        priority = ?reading.active_priority,
                        "Read point"
                    );
                    reading
                }
                Err(e) => {
                    warn!(point = %point.name, object = %point.object, error = %e, "Point read failed");
                    NewReading::failed(point, e.to_string(), timestamp)
                }
            };

            batch.push(reading);
        }

        batch
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use heitz_core::{default_points, PointSample};
    use heitz_db::{Database, DbConfig};
    use std::collections::HashMap;

    #[derive(Clone)]
    enum Behaviour {
        Value(f64),
        Fail(ReadError),
        Hang,
    }

    /// Source answering from a fixed table; unknown points read 1.0.
    struct ScriptedSource {
        script: HashMap<String, Behaviour>,
    }

    impl ScriptedSource {
        fn new(script: &[(&str, Behaviour)]) -> Arc<Self> {
            Arc::new(ScriptedSource {
                script: script
                    .iter()
                    .map(|(name, b)| (name.to_string(), b.clone()))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl PointSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn read_point(&self, point: &PointDescriptor) -> Result<PointSample, ReadError> {
            match self.script.get(&point.name).cloned().unwrap_or(Behaviour::Value(1.0)) {
                Behaviour::Value(v) => Ok(PointSample::new(v)),
                Behaviour::Fail(e) => Err(e),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(PointSample::new(0.0))
                }
            }
        }
    }

    async fn setup(source: Arc<dyn PointSource>) -> (SensorPoller, ReadingQueue) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.readings();
        let (poller, _handle) = SensorPoller::new(&AgentConfig::default(), source, queue.clone());
        (poller.with_point_timeout(Duration::from_millis(100)), queue)
    }

    #[tokio::test]
    async fn test_one_failure_still_stores_every_point() {
        let source = ScriptedSource::new(&[(
            "chlorine_level",
            Behaviour::Fail(ReadError::Unreachable("no route to host".into())),
        )]);
        let (poller, queue) = setup(source).await;

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary, TickSummary { stored: 5, failed: 1 });

        let stored = queue.fetch_unposted(10).await.unwrap();
        assert_eq!(stored.len(), 5);

        let failed: Vec<_> = stored.iter().filter(|r| r.value.is_none()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].point_name, "chlorine_level");
        assert_eq!(
            failed[0].error.as_deref(),
            Some("device unreachable: no route to host")
        );
    }

    #[tokio::test]
    async fn test_tick_shares_one_timestamp_in_point_order() {
        let (poller, queue) = setup(ScriptedSource::new(&[])).await;
        poller.poll_once().await.unwrap();

        let stored = queue.fetch_unposted(10).await.unwrap();
        let names: Vec<_> = stored.iter().map(|r| r.point_name.clone()).collect();
        let expected: Vec<_> = default_points().into_iter().map(|p| p.name).collect();
        assert_eq!(names, expected);
        assert!(stored.iter().all(|r| r.timestamp == stored[0].timestamp));
    }

    #[tokio::test]
    async fn test_zero_is_not_a_failure() {
        let source = ScriptedSource::new(&[("flow_rate", Behaviour::Value(0.0))]);
        let (poller, queue) = setup(source).await;

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.failed, 0);

        let stored = queue.fetch_unposted(10).await.unwrap();
        let flow = stored.iter().find(|r| r.point_name == "flow_rate").unwrap();
        assert_eq!(flow.value, Some(0.0));
        assert!(flow.error.is_none());
    }

    #[tokio::test]
    async fn test_hanging_point_times_out() {
        let source = ScriptedSource::new(&[("pool_ph", Behaviour::Hang)]);
        let (poller, queue) = setup(source).await;

        let started = std::time::Instant::now();
        let summary = poller.poll_once().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(summary, TickSummary { stored: 5, failed: 1 });

        let stored = queue.fetch_unposted(10).await.unwrap();
        let ph = stored.iter().find(|r| r.point_name == "pool_ph").unwrap();
        assert!(ph.value.is_none());
        assert_eq!(ph.error.as_deref(), Some("read timed out after 100ms"));
    }

    #[tokio::test]
    async fn test_storage_failure_is_surfaced() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (poller, _handle) =
            SensorPoller::new(&AgentConfig::default(), ScriptedSource::new(&[]), db.readings());
        db.close().await;

        let err = poller.poll_once().await.unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.readings();
        let (poller, handle) =
            SensorPoller::new(&AgentConfig::default(), ScriptedSource::new(&[]), queue.clone());

        let task = tokio::spawn(poller.run());

        // First tick fires immediately
        for _ in 0..50 {
            if queue.count_unposted().await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        // Default interval is 30 s, so exactly one tick ran
        assert_eq!(queue.count_unposted().await.unwrap(), 5);
    }
}
