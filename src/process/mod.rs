//! Supervisor for the local Grafana server process
//!
//! The handle belongs to one warm environment. Starting is idempotent so
//! static-asset requests can reuse a running server; stopping always leaves
//! the supervisor in `Stopped`, escalating to SIGKILL when SIGTERM is
//! ignored past the stop timeout.

mod config;

pub use config::{render_config, ServerContext, ServerSettings};

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{GrafanaLambdaError, Result};

const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    /// Spawned, not yet known to answer requests
    Starting,
    Running,
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Exited(ExitStatus),
    /// Ignored SIGTERM for the whole stop timeout
    Killed,
}

pub struct ProcessSupervisor {
    settings: ServerSettings,
    child: Option<Child>,
    state: ProcessState,
}

impl ProcessSupervisor {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            child: None,
            state: ProcessState::Stopped,
        }
    }

    /// Current state, noticing a child that exited on its own
    pub fn state(&mut self) -> ProcessState {
        if let Some(child) = self.child.as_mut() {
            if !matches!(child.try_wait(), Ok(None)) {
                self.child = None;
                self.state = ProcessState::Stopped;
            }
        }
        self.state
    }

    /// Fail with `Unprovisioned` unless the server binary is in place
    pub fn ensure_provisioned(&self) -> Result<()> {
        if !self.settings.home.is_dir() {
            return Err(GrafanaLambdaError::Unprovisioned(format!(
                "Grafana home {} not found",
                self.settings.home.display()
            )));
        }
        let binary = self.settings.binary();
        if !binary.is_file() {
            return Err(GrafanaLambdaError::Unprovisioned(format!(
                "Grafana binary {} not found",
                binary.display()
            )));
        }
        Ok(())
    }

    /// Start the server for `context` unless it is already running
    pub async fn start_if_needed(&mut self, context: &ServerContext) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait()? {
                None => {
                    tracing::debug!("Grafana is already running");
                    return Ok(());
                }
                Some(status) => {
                    tracing::warn!("Grafana exited unexpectedly: {}", status);
                    self.child = None;
                    self.state = ProcessState::Stopped;
                }
            }
        }

        self.ensure_provisioned()?;

        let rendered = render_config(&self.settings, context);
        if let Some(parent) = self.settings.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.settings.config_path, rendered).await?;

        tracing::info!(domain = %context.domain, stage = %context.stage, "Starting Grafana");
        let child = Command::new(self.settings.binary())
            .arg("-homepath")
            .arg(&self.settings.home)
            .arg("-config")
            .arg(&self.settings.config_path)
            .arg("-pidfile")
            .arg(&self.settings.pidfile)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GrafanaLambdaError::Process(format!("failed to start Grafana: {}", e)))?;

        self.child = Some(child);
        self.state = ProcessState::Starting;
        Ok(())
    }

    /// Record that the server answered a request
    pub fn mark_ready(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Running;
        }
    }

    /// Stop the server if one is tracked and discard its rendered config.
    /// Never fails; the handle is cleared whatever the child does.
    pub async fn stop(&mut self) -> StopOutcome {
        self.state = ProcessState::Stopped;
        let outcome = match self.child.take() {
            Some(child) => self.terminate(child).await,
            None => StopOutcome::NotRunning,
        };

        match tokio::fs::remove_file(&self.settings.config_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove Grafana config: {}", e),
        }
        outcome
    }

    async fn terminate(&self, mut child: Child) -> StopOutcome {
        if let Ok(Some(status)) = child.try_wait() {
            return StopOutcome::Exited(status);
        }

        tracing::info!("Stopping Grafana");
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("Failed to signal Grafana: {}", e);
            }
        }

        match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => StopOutcome::Exited(status),
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for Grafana: {}", e);
                self.force_kill(&mut child).await
            }
            Err(_) => {
                tracing::warn!(
                    "Grafana did not exit within {:?}, killing it",
                    self.settings.stop_timeout
                );
                self.force_kill(&mut child).await
            }
        }
    }

    async fn force_kill(&self, child: &mut Child) -> StopOutcome {
        if let Err(e) = child.start_kill() {
            tracing::warn!("Failed to kill Grafana: {}", e);
        }
        if tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait()).await.is_err() {
            tracing::warn!("Grafana not reaped after SIGKILL");
        }
        StopOutcome::Killed
    }
}
