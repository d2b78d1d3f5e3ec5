//! # Reader Service
//!
//! Owns the four periodic tasks and their shutdown order.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Task Layout                                    │
//! │                                                                         │
//! │   ┌──────────────┐  store   ┌──────────────┐  fetch/mark  ┌───────────┐ │
//! │   │ SensorPoller │ ───────► │ ReadingQueue │ ◄─────────── │ SyncAgent │ │
//! │   └──────────────┘          └──────────────┘              └─────┬─────┘ │
//! │                                                                 │       │
//! │   ┌──────────────────┐   ┌─────────────┐                        ▼       │
//! │   │ LivenessReporter │   │ UpdateAgent │ ──────────────────► RemoteApi  │
//! │   └──────────────────┘   └─────────────┘                                │
//! │                                                                         │
//! │  SHUTDOWN ORDER:                                                        │
//! │  1. Poller (finishes its in-flight tick, so its batch is stored)        │
//! │  2. Sync agent (optional final flush sees that batch)                   │
//! │  3. Heartbeat and update agents                                         │
//! │  4. Database pool                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use heitz_db::Database;

use crate::api::RemoteApi;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::heartbeat::LivenessReporter;
use crate::poller::SensorPoller;
use crate::source::PointSource;
use crate::sync::SyncAgent;
use crate::update::UpdateAgent;

/// Wires configuration, storage, the point source and the backend together.
pub struct ReaderService {
    config: Arc<AgentConfig>,
    db: Database,
    api: Arc<dyn RemoteApi>,
    source: Arc<dyn PointSource>,
}

impl ReaderService {
    pub fn new(
        config: Arc<AgentConfig>,
        db: Database,
        api: Arc<dyn RemoteApi>,
        source: Arc<dyn PointSource>,
    ) -> Self {
        ReaderService {
            config,
            db,
            api,
            source,
        }
    }

    /// Runs every task until `shutdown` resolves, then stops them in order.
    ///
    /// ## Errors
    /// Only the point source's connect step; everything after it degrades
    /// and logs instead of failing.
    pub async fn run<F>(self, shutdown: F) -> AgentResult<()>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;

        info!(
            device = %config.device_id(),
            name = %config.device.name,
            source = self.source.name(),
            points = config.points.len(),
            "Starting reader service"
        );

        match self.api.health_check().await {
            Ok(()) => info!("Backend reachable"),
            Err(e) => warn!(error = %e, "Backend health check failed, continuing offline"),
        }

        self.source.connect().await?;

        let queue = self.db.readings();

        let (poller, poller_handle) =
            SensorPoller::new(config, self.source.clone(), queue.clone());
        let (sync_agent, sync_handle) = SyncAgent::new(config, self.api.clone(), queue);
        let (reporter, reporter_handle) = LivenessReporter::new(config, self.api.clone());
        let (updater, updater_handle) = UpdateAgent::new(config, self.api.clone());

        let poller_task = tokio::spawn(poller.run());
        let sync_task = tokio::spawn(sync_agent.run());
        let reporter_task = tokio::spawn(reporter.run());
        let updater_task = tokio::spawn(updater.run());

        info!("Reader service started");

        shutdown.await;
        info!("Shutting down reader service");

        if let Err(e) = poller_handle.shutdown().await {
            warn!(error = %e, "Poller did not accept shutdown");
        }
        join("poller", poller_task).await;

        if let Err(e) = sync_handle.shutdown().await {
            warn!(error = %e, "Sync agent did not accept shutdown");
        }
        if let Err(e) = reporter_handle.shutdown().await {
            warn!(error = %e, "Liveness reporter did not accept shutdown");
        }
        if let Err(e) = updater_handle.shutdown().await {
            warn!(error = %e, "Update agent did not accept shutdown");
        }

        join("sync agent", sync_task).await;
        join("liveness reporter", reporter_task).await;
        join("update agent", updater_task).await;

        self.db.close().await;
        info!("Reader service stopped");
        Ok(())
    }
}

async fn join(task: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task, error = %e, "Task panicked");
    }
}
