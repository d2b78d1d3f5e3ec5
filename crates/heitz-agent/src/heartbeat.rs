//! Liveness reporter: tells the backend this device is alive.
//!
//! Independent of sensor data. A failed heartbeat is logged and the next one
//! goes out on schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

/// Periodic heartbeat sender.
pub struct LivenessReporter {
    api: Arc<dyn RemoteApi>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running reporter.
#[derive(Clone)]
pub struct LivenessReporterHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl LivenessReporterHandle {
    pub async fn shutdown(&self) -> AgentResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| AgentError::ChannelError("Liveness reporter already stopped".into()))
    }
}

impl LivenessReporter {
    pub fn new(config: &AgentConfig, api: Arc<dyn RemoteApi>) -> (Self, LivenessReporterHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let reporter = LivenessReporter {
            api,
            interval: config.heartbeat_interval(),
            shutdown_rx,
        };

        (reporter, LivenessReporterHandle { shutdown_tx })
    }

    /// Runs until shutdown. The first heartbeat goes out immediately.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Liveness reporter starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.beat_once().await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Liveness reporter stopped");
    }

    /// Sends one heartbeat.
    pub async fn beat_once(&self) -> AgentResult<()> {
        self.api.post_heartbeat().await?;
        debug!("Heartbeat sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AckSet, UpdateStatus};
    use crate::error::ApiError;
    use async_trait::async_trait;
    use heitz_core::Reading;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        beats: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RemoteApi for CountingBackend {
        async fn post_readings(&self, _readings: &[Reading]) -> Result<AckSet, ApiError> {
            Ok(AckSet::All)
        }

        async fn post_heartbeat(&self) -> Result<(), ApiError> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ApiError::Transport("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn latest_revision(&self) -> Result<String, ApiError> {
            Ok(String::new())
        }

        async fn report_update_status(&self, _status: &UpdateStatus) -> Result<(), ApiError> {
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn backend(fail: bool) -> Arc<CountingBackend> {
        Arc::new(CountingBackend {
            beats: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_beat_once() {
        let api = backend(false);
        let (reporter, _handle) = LivenessReporter::new(&AgentConfig::default(), api.clone());

        reporter.beat_once().await.unwrap();
        assert_eq!(api.beats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_fatal() {
        let api = backend(true);
        let (reporter, _handle) = LivenessReporter::new(&AgentConfig::default(), api.clone());

        let err = reporter.beat_once().await.unwrap_err();
        assert!(matches!(err, AgentError::Api(ApiError::Transport(_))));
    }

    #[tokio::test]
    async fn test_run_beats_immediately_and_stops() {
        let api = backend(true);
        let mut config = AgentConfig::default();
        config.heartbeat.interval_secs = 1;
        let (reporter, handle) = LivenessReporter::new(&config, api.clone());

        let task = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_millis(1300)).await;
        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        // Immediate beat plus one after a second, failures included
        assert_eq!(api.beats.load(Ordering::SeqCst), 2);
    }
}
