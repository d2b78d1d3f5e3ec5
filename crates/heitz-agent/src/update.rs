//! # Update Agent
//!
//! Compares the running revision with the one the backend wants and hands
//! the rollout to an external command.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  current  = git rev-parse HEAD (in repo_dir)                            │
//! │  target   = api.latest_revision()                                       │
//! │                                                                         │
//! │  current unknown         ──► Skipped                                    │
//! │  current ≈ target        ──► UpToDate                                   │
//! │  no update command       ──► Available (logged only)                    │
//! │  target already tried    ──► Available (not re-run)                     │
//! │  otherwise               ──► sh -c "$command"  TARGET_REVISION=target   │
//! │                               │   killed after command_timeout          │
//! │                               └─► api.report_update_status(outcome)     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The command owns pulling, installing and restarting; this agent never
//! touches the queue or the poller. Shutdown interrupts a check in
//! progress, and dropping the check kills the command.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::{RemoteApi, UpdateStatus};
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

/// Shortest backend revision accepted as an abbreviated commit hash.
const MIN_ABBREVIATED_LEN: usize = 7;

// =============================================================================
// Types
// =============================================================================

/// What happens when a newer revision is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTrigger {
    /// Log it and leave the rollout to an operator.
    LogOnly,
    /// Run this shell command with `TARGET_REVISION` set.
    Command(String),
}

/// Result of one update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// The running revision is the target.
    UpToDate { revision: String },
    /// The running revision could not be determined.
    Skipped,
    /// A different revision is available and was not acted on.
    Available { current: String, target: String },
    /// The update command ran.
    Triggered { target: String, success: bool },
}

/// Whether `current` (a full hash) is the revision named by `target`.
///
/// `target` may be abbreviated, as long as it is not too short to be
/// meaningful.
pub fn same_revision(current: &str, target: &str) -> bool {
    let current = current.trim().to_ascii_lowercase();
    let target = target.trim().to_ascii_lowercase();

    if current.is_empty() || target.is_empty() {
        return false;
    }

    current == target || (target.len() >= MIN_ABBREVIATED_LEN && current.starts_with(&target))
}

// =============================================================================
// Update Agent
// =============================================================================

/// Periodic revision checker.
pub struct UpdateAgent {
    api: Arc<dyn RemoteApi>,
    interval: Duration,
    repo_dir: Option<PathBuf>,
    trigger: UpdateTrigger,
    command_timeout: Duration,
    /// Overrides `git rev-parse HEAD`.
    revision: Option<String>,
    last_triggered: Option<String>,
    /// Taken by `run`.
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

/// Handle for stopping a running update agent.
#[derive(Clone)]
pub struct UpdateAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl UpdateAgentHandle {
    pub async fn shutdown(&self) -> AgentResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| AgentError::ChannelError("Update agent already stopped".into()))
    }
}

impl UpdateAgent {
    pub fn new(config: &AgentConfig, api: Arc<dyn RemoteApi>) -> (Self, UpdateAgentHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let trigger = match config.update.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => UpdateTrigger::Command(command.to_string()),
            _ => UpdateTrigger::LogOnly,
        };

        let agent = UpdateAgent {
            api,
            interval: config.update_check_interval(),
            repo_dir: config.update.repo_dir.clone(),
            trigger,
            command_timeout: config.update_command_timeout(),
            revision: None,
            last_triggered: None,
            shutdown_rx: Some(shutdown_rx),
        };

        (agent, UpdateAgentHandle { shutdown_tx })
    }

    /// Uses a fixed running revision instead of asking git.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn trigger(&self) -> &UpdateTrigger {
        &self.trigger
    }

    /// Runs until shutdown. The first check waits one interval.
    pub async fn run(mut self) {
        let Some(mut shutdown_rx) = self.shutdown_rx.take() else {
            warn!("Update agent has already run");
            return;
        };

        info!(
            interval_secs = self.interval.as_secs(),
            command = matches!(self.trigger, UpdateTrigger::Command(_)),
            command_timeout_secs = self.command_timeout.as_secs(),
            "Update agent starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // A running update command must not hold up shutdown.
                    tokio::select! {
                        result = self.check_once() => {
                            if let Err(e) = result {
                                warn!(error = %e, "Update check failed");
                            }
                        }

                        _ = shutdown_rx.recv() => {
                            info!("Update check interrupted by shutdown");
                            break;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Update agent stopped");
    }

    /// Runs one update check.
    ///
    /// ## Errors
    /// Fetching the target revision failed. A failing update command is not
    /// an error here; it is reported to the backend and returned as
    /// `Triggered { success: false }`.
    pub async fn check_once(&mut self) -> AgentResult<UpdateCheck> {
        let Some(current) = self.current_revision().await else {
            debug!("Running revision unknown, skipping update check");
            return Ok(UpdateCheck::Skipped);
        };

        let target = self.api.latest_revision().await?;

        if same_revision(&current, &target) {
            debug!(revision = %current, "Running the latest revision");
            return Ok(UpdateCheck::UpToDate { revision: current });
        }

        info!(current = %current, target = %target, "Update available");

        let command = match &self.trigger {
            UpdateTrigger::LogOnly => None,
            UpdateTrigger::Command(command) => Some(command.clone()),
        };

        let Some(command) = command else {
            return Ok(UpdateCheck::Available { current, target });
        };

        if self.last_triggered.as_deref() == Some(target.as_str()) {
            debug!(target = %target, "Update command already ran for this revision");
            return Ok(UpdateCheck::Available { current, target });
        }
        self.last_triggered = Some(target.clone());

        let status = match self.run_command(&command, &target).await {
            Ok(()) => {
                info!(target = %target, "Update command completed");
                UpdateStatus::succeeded(target.clone())
            }
            Err(e) => {
                error!(target = %target, error = %e, "Update command failed");
                UpdateStatus::failed(e.to_string())
            }
        };

        let success = status.success;
        if let Err(e) = self.api.report_update_status(&status).await {
            warn!(error = %e, "Could not report update status");
        }

        Ok(UpdateCheck::Triggered { target, success })
    }

    async fn current_revision(&self) -> Option<String> {
        if let Some(revision) = &self.revision {
            return Some(revision.clone());
        }

        let mut command = Command::new("git");
        command.args(["rev-parse", "HEAD"]).stdin(Stdio::null());
        if let Some(dir) = &self.repo_dir {
            command.current_dir(dir);
        }

        match command.output().await {
            Ok(output) if output.status.success() => {
                let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!revision.is_empty()).then_some(revision)
            }
            Ok(output) => {
                debug!(
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "git rev-parse failed"
                );
                None
            }
            Err(e) => {
                debug!(error = %e, "Could not run git");
                None
            }
        }
    }

    async fn run_command(&self, command: &str, target: &str) -> AgentResult<()> {
        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .env("TARGET_REVISION", target)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.repo_dir {
            process.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.command_timeout, process.output()).await {
            Ok(result) => result.map_err(|e| {
                AgentError::UpdateFailed(format!("could not start command: {}", e))
            })?,
            Err(_) => {
                return Err(AgentError::UpdateFailed(format!(
                    "command timed out after {}s",
                    self.command_timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let status = output
            .status
            .code()
            .map(|code| format!("exit status {}", code))
            .unwrap_or_else(|| "terminated by signal".to_string());

        Err(AgentError::UpdateFailed(if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        }))
    }
}
