//! # Sync Agent
//!
//! Uploads unposted readings to the backend and marks what it acknowledged.
//!
//! ## Sync Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Sync Cycle                                  │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  repeat up to max_batches_per_cycle:                            │   │
//! │  │                                                                 │   │
//! │  │  1. Fetch:  queue.fetch_unposted(batch_size)                    │   │
//! │  │             empty ──► stop (no network call)                    │   │
//! │  │                                                                 │   │
//! │  │  2. Send:   api.post_readings(batch)                            │   │
//! │  │             Err   ──► stop, nothing marked, wait for next tick  │   │
//! │  │                                                                 │   │
//! │  │  3. Mark:   queue.mark_posted(acknowledged ids)                 │   │
//! │  │                                                                 │   │
//! │  │  4. Drain?  batch full AND fully acknowledged ──► next batch    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  cycle without error ──► queue.prune(retention), log queue stats        │
//! │                                                                         │
//! │  RETRY POLICY:                                                          │
//! │  • None beyond the interval. Unacknowledged readings stay unposted and  │
//! │    are picked up by the next cycle.                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use heitz_db::ReadingQueue;

use crate::api::RemoteApi;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

// =============================================================================
// Sync Report
// =============================================================================

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Batches submitted to the backend.
    pub batches: u32,
    /// Readings submitted.
    pub sent: usize,
    /// Readings newly marked posted.
    pub posted: u64,
    /// Posted readings removed by retention.
    pub pruned: u64,
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Periodic uploader for the reading queue.
pub struct SyncAgent {
    api: Arc<dyn RemoteApi>,
    queue: ReadingQueue,
    interval: Duration,
    batch_size: u32,
    max_batches: u32,
    retention: Duration,
    flush_on_shutdown: bool,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running sync agent.
#[derive(Clone)]
pub struct SyncAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SyncAgentHandle {
    /// Asks the agent to stop. With `flush_on_shutdown` it runs one final
    /// cycle first.
    pub async fn shutdown(&self) -> AgentResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| AgentError::ChannelError("Sync agent already stopped".into()))
    }
}

impl SyncAgent {
    /// Creates a sync agent and returns its handle.
    pub fn new(
        config: &AgentConfig,
        api: Arc<dyn RemoteApi>,
        queue: ReadingQueue,
    ) -> (Self, SyncAgentHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let agent = SyncAgent {
            api,
            queue,
            interval: config.post_interval(),
            batch_size: config.sync.batch_size,
            max_batches: config.sync.max_batches_per_cycle,
            retention: config.retention(),
            flush_on_shutdown: config.sync.flush_on_shutdown,
            shutdown_rx,
        };

        (agent, SyncAgentHandle { shutdown_tx })
    }

    /// Runs the sync loop until shutdown.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Sync agent starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick completes immediately; let the poller fill the queue
        // for one full interval before the first upload.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync agent shutting down");
                    break;
                }
            }
        }

        if self.flush_on_shutdown {
            info!("Flushing unposted readings before exit");
            self.run_cycle().await;
        }

        info!("Sync agent stopped");
    }

    async fn run_cycle(&self) {
        match self.sync_once().await {
            Ok(report) if report.batches > 0 => info!(
                batches = report.batches,
                sent = report.sent,
                posted = report.posted,
                pruned = report.pruned,
                "Sync cycle complete"
            ),
            Ok(_) => {}
            Err(AgentError::Storage(e)) => {
                error!(error = %e, "Sync cycle aborted by storage failure");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retryable = e.is_retryable(),
                    "Sync cycle failed, readings kept for next cycle"
                );
            }
        }
    }

    /// Runs one sync cycle.
    ///
    /// ## Returns
    /// What was sent, marked and pruned. An empty queue returns a zero report
    /// without touching the network.
    ///
    /// ## Errors
    /// The first API or storage failure ends the cycle. Batches acknowledged
    /// before it stay marked; retention pruning is skipped.
    pub async fn sync_once(&self) -> AgentResult<SyncReport> {
        let mut report = SyncReport::default();

        while report.batches < self.max_batches {
            let batch = self.queue.fetch_unposted(self.batch_size).await?;
            if batch.is_empty() {
                if report.batches == 0 {
                    debug!("No unposted readings");
                }
                break;
            }

            let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
            let ack = self.api.post_readings(&batch).await?;
            report.batches += 1;
            report.sent += batch.len();

            let acknowledged = ack.acknowledged(&ids);
            report.posted += self.queue.mark_posted(&acknowledged).await?;

            if acknowledged.len() < ids.len() {
                warn!(
                    sent = ids.len(),
                    acknowledged = acknowledged.len(),
                    "Backend acknowledged part of the batch"
                );
                break;
            }

            if batch.len() < self.batch_size as usize {
                break;
            }
        }

        report.pruned = self.queue.prune(self.retention).await?;

        let stats = self.queue.stats().await?;
        info!(
            total = stats.total,
            unposted = stats.unposted,
            posted = stats.posted,
            "Queue status"
        );

        Ok(report)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
