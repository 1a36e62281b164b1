//! Engine connections
//!
//! An engine connection is one running instance of the rendering engine. The
//! runner commands it to load a test and forwards input events to it; the
//! engine reports completion back over its own harness binding.

use crate::config::EngineConfig;
use crate::runner::RunnerCommand;
use crate::view::Surface;
use async_trait::async_trait;
use futures::SinkExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use sky_harness_common::{Error, InputEvent, Result, RunId};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Handle to one running engine instance
#[async_trait]
pub trait EngineConnection: Send {
    /// Command the engine to load a test document
    async fn load(&mut self, path: &str, package_root: &str) -> Result<()>;

    /// Forward an input event
    async fn forward_input_event(&mut self, event: &InputEvent) -> Result<()>;

    /// Release the engine; no notifications are delivered afterwards
    async fn close(&mut self) -> Result<()>;
}

/// Creates engine connections bound to a surface
#[async_trait]
pub trait EngineHost: Send + Sync {
    async fn connect(&self, surface: &Surface, ctx: RunContext) -> Result<Box<dyn EngineConnection>>;
}

/// Per-run channel from an engine connection back to the runner.
///
/// Notifications carry the run id and are dropped once the run has been torn
/// down, so a late exit from a previous engine never affects a newer run.
#[derive(Clone)]
pub struct RunContext {
    run_id: RunId,
    cancel: CancellationToken,
    notify: mpsc::WeakUnboundedSender<RunnerCommand>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: RunId,
        cancel: CancellationToken,
        notify: mpsc::WeakUnboundedSender<RunnerCommand>,
    ) -> Self {
        Self {
            run_id,
            cancel,
            notify,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the run is torn down
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Report that the engine went away. Returns whether the runner was told.
    pub fn engine_lost(&self, reason: impl Into<String>) -> bool {
        if self.cancel.is_cancelled() {
            trace!("Run {} already torn down, dropping engine notification", self.run_id);
            return false;
        }

        match self.notify.upgrade() {
            Some(tx) => tx
                .send(RunnerCommand::EngineLost {
                    run_id: self.run_id,
                    reason: reason.into(),
                })
                .is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Command line written to an engine process
#[derive(Debug, Serialize)]
#[serde(tag = "execute", rename_all = "snake_case")]
enum EngineCommand<'a> {
    Load {
        path: &'a str,
        package_root: &'a str,
    },
    InputEvent {
        event: &'a InputEvent,
    },
}

/// Launches the engine as a child process
pub struct ProcessEngineHost {
    config: EngineConfig,
    socket_path: PathBuf,
}

impl ProcessEngineHost {
    /// `socket_path` is where the engine reaches the harness interface
    pub fn new(config: EngineConfig, socket_path: PathBuf) -> Self {
        Self {
            config,
            socket_path,
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_grace_ms)
    }
}

#[async_trait]
impl EngineHost for ProcessEngineHost {
    async fn connect(&self, surface: &Surface, ctx: RunContext) -> Result<Box<dyn EngineConnection>> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("SKY_HARNESS_SOCKET", &self.socket_path)
            .env("SKY_VIEW_ID", surface.id.to_string())
            .env("SKY_VIEW_SIZE", surface.size_label())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Engine(format!(
                "Failed to spawn {}: {}",
                self.config.binary.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Engine("Engine stdin unavailable".to_string()))?;
        let pid = child.id();

        info!(
            "Engine started for run {} (pid {:?}, surface {})",
            ctx.run_id(),
            pid,
            surface.id
        );

        let watcher = tokio::spawn(watch_engine(child, ctx.clone(), self.grace()));

        Ok(Box::new(ProcessEngine {
            pid,
            stdin: Some(FramedWrite::new(stdin, LinesCodec::new())),
            ctx,
            watcher: Some(watcher),
        }))
    }
}

/// Engine running as a child process, commanded over stdin
pub struct ProcessEngine {
    pid: Option<u32>,
    stdin: Option<FramedWrite<ChildStdin, LinesCodec>>,
    ctx: RunContext,
    watcher: Option<JoinHandle<Result<()>>>,
}

impl ProcessEngine {
    async fn send(&mut self, command: EngineCommand<'_>) -> Result<()> {
        let line = serde_json::to_string(&command)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Engine("Engine connection closed".to_string()))?;

        trace!("Engine command: {}", line);
        stdin
            .send(line)
            .await
            .map_err(|e| Error::Engine(format!("Failed to write to engine: {}", e)))
    }
}

#[async_trait]
impl EngineConnection for ProcessEngine {
    async fn load(&mut self, path: &str, package_root: &str) -> Result<()> {
        self.send(EngineCommand::Load { path, package_root }).await
    }

    async fn forward_input_event(&mut self, event: &InputEvent) -> Result<()> {
        self.send(EngineCommand::InputEvent { event }).await
    }

    async fn close(&mut self) -> Result<()> {
        self.ctx.cancel();

        if let Some(mut stdin) = self.stdin.take() {
            // The engine may already be gone; a broken pipe here is expected.
            let _ = SinkExt::<String>::close(&mut stdin).await;
        }

        if let Some(watcher) = self.watcher.take() {
            watcher
                .await
                .map_err(|e| Error::Engine(format!("Engine watcher failed: {}", e)))??;
        }

        debug!("Engine for run {} released (pid {:?})", self.ctx.run_id(), self.pid);
        Ok(())
    }
}

/// Wait for the engine to exit or for the run to be torn down
async fn watch_engine(mut child: Child, ctx: RunContext, grace: Duration) -> Result<()> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = ctx.cancelled() => None,
    };

    match exited {
        Some(Ok(status)) => {
            ctx.engine_lost(format!("engine exited with {}", status));
            Ok(())
        }
        Some(Err(e)) => {
            ctx.engine_lost(format!("failed to wait for engine: {}", e));
            Ok(())
        }
        None => terminate(&mut child, grace).await,
    }
}

/// SIGTERM, then SIGKILL after the grace period
async fn terminate(child: &mut Child, grace: Duration) -> Result<()> {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                debug!("Engine {} exited with {}", pid, status?);
                return Ok(());
            }
            Err(_) => {
                warn!("Engine {} ignored SIGTERM for {:?}, killing", pid, grace);
            }
        }
    }

    child.kill().await?;
    Ok(())
}
