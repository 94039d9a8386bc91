//! Orchestrator - runs the engine as a child process.
//!
//! Flow:
//! 1. Spawn the engine subprocess (stdin/stdout piped, stderr inherited)
//! 2. Wait for Ready (lists the registered commands)
//! 3. Pump the hub's Hub→Engine queue into the child's stdin
//! 4. Pump Reply frames from the child's stdout into the Engine→Hub queue
//! 5. On child exit: stop pumping, which closes the queue the hub writes to

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::EngineChannels;
use crate::bridge::codec::JsonCodec;
use crate::bridge::pipe::forward_queue;
use crate::bridge::protocol::{ControlRequest, ControlResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Extension point for how the engine process is started.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns `program args...` with the pipes the bridge needs.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable, typically with an `engine` subcommand.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl EngineSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub struct OrchestratorConfig {
    pub spawner: Arc<dyn EngineSpawner>,
    /// How long the child may take to report Ready.
    pub ready_timeout: Duration,
    /// How often the stdin forwarder checks the Hub→Engine queue.
    pub poll_interval: Duration,
}

impl OrchestratorConfig {
    pub fn new(spawner: Arc<dyn EngineSpawner>) -> Self {
        Self {
            spawner,
            ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to spawn engine: {0}")]
    Spawn(String),
    #[error("engine did not become ready in time")]
    ReadyTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("engine exited")]
    EngineExited,
}

/// How the engine process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The engine sent `ShuttingDown` before closing its pipe.
    pub announced: bool,
    /// `None` if the engine had to be killed.
    pub status: Option<ExitStatus>,
}

/// Handle to a running engine child process.
pub struct EngineProcess {
    child: Child,
    commands: Vec<String>,
    stop: CancellationToken,
    forwarder: JoinHandle<()>,
    collector: JoinHandle<bool>,
}

impl EngineProcess {
    /// Commands the engine reported in its Ready message.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Fires when the child's stdout closes or the handle is shut down.
    pub fn stopped(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Ask the engine to stop, then wait up to `grace` before killing it.
    ///
    /// Replies the engine flushes while stopping still reach the hub's queue.
    pub async fn shutdown(
        mut self,
        grace: Duration,
    ) -> Result<ShutdownReport, OrchestratorError> {
        self.stop.cancel();
        if let Err(e) = self.forwarder.await {
            tracing::warn!(error = %e, "Engine forwarder task failed");
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Engine process exited");
                Some(status)
            }
            Ok(Err(e)) => {
                return Err(OrchestratorError::Protocol(format!(
                    "failed to wait for engine: {e}"
                )));
            }
            Err(_) => {
                tracing::warn!("Engine did not exit in time, killing it");
                self.child
                    .kill()
                    .await
                    .map_err(|e| OrchestratorError::Protocol(format!("failed to kill engine: {e}")))?;
                None
            }
        };

        // The child is gone so its stdout is at EOF; the collector only has
        // buffered frames left.
        let announced = match tokio::time::timeout(grace, &mut self.collector).await {
            Ok(Ok(announced)) => announced,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Engine collector task failed");
                false
            }
            Err(_) => {
                self.collector.abort();
                false
            }
        };

        Ok(ShutdownReport { announced, status })
    }
}

/// Start the engine process and bridge it onto `channels`.
///
/// `channels` are the engine's ends of the hub's channel pair: requests the
/// hub pushes are written to the child, replies from the child are pushed
/// back for the hub to pop.
pub async fn spawn_engine(
    config: OrchestratorConfig,
    channels: EngineChannels,
) -> Result<EngineProcess, OrchestratorError> {
    tracing::info!("Spawning engine subprocess");
    let mut child = config
        .spawner
        .spawn()
        .map_err(|e| OrchestratorError::Spawn(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| OrchestratorError::Spawn("stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::Spawn("stdout not captured".to_string()))?;

    let mut ctrl_writer = FramedWrite::new(stdin, JsonCodec::<ControlRequest>::new());
    let mut ctrl_reader = FramedRead::new(stdout, JsonCodec::<ControlResponse>::new());

    tracing::debug!("Waiting for Ready from engine");
    let ready = tokio::time::timeout(config.ready_timeout, async {
        loop {
            match ctrl_reader.next().await {
                Some(Ok(ControlResponse::Ready { commands })) => return Ok(commands),
                Some(Ok(other)) => {
                    tracing::warn!(?other, "Unexpected message before Ready");
                }
                Some(Err(e)) => {
                    return Err(OrchestratorError::Protocol(format!(
                        "control pipe error: {e}"
                    )));
                }
                None => return Err(OrchestratorError::EngineExited),
            }
        }
    })
    .await;

    let commands = match ready {
        Ok(Ok(commands)) => commands,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(OrchestratorError::ReadyTimeout),
    };
    tracing::info!(?commands, "Engine ready");

    let stop = CancellationToken::new();
    let EngineChannels { from_hub, to_hub } = channels;

    let forward_stop = stop.clone();
    let poll_interval = config.poll_interval;
    let forwarder = tokio::spawn(async move {
        let result = forward_queue(
            from_hub,
            &mut ctrl_writer,
            |request| ControlRequest::Deliver { request },
            poll_interval,
            forward_stop,
        )
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to forward requests to engine");
            return;
        }
        if let Err(e) = ctrl_writer.send(ControlRequest::Shutdown).await {
            tracing::debug!(error = %e, "Could not send Shutdown to engine");
        }
    });

    let collector = tokio::spawn(collect_replies(ctrl_reader, to_hub, stop.clone()));

    Ok(EngineProcess {
        child,
        commands,
        stop,
        forwarder,
        collector,
    })
}

async fn collect_replies(
    mut reader: FramedRead<ChildStdout, JsonCodec<ControlResponse>>,
    to_hub: crossbeam::channel::Sender<Response>,
    stop: CancellationToken,
) -> bool {
    let mut announced = false;
    loop {
        match reader.next().await {
            Some(Ok(ControlResponse::Reply { response })) => {
                tracing::trace!(timestamp = %response.timestamp, "Reply received from engine");
                if to_hub.send(response).is_err() {
                    tracing::debug!("Hub side gone, dropping engine reply");
                    break;
                }
            }
            Some(Ok(ControlResponse::Ready { .. })) => {
                tracing::warn!("Unexpected Ready from running engine");
            }
            Some(Ok(ControlResponse::ShuttingDown)) => {
                tracing::info!("Engine shutting down");
                announced = true;
                break;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Engine pipe error");
                break;
            }
            None => {
                tracing::warn!("Engine pipe closed (engine crashed?)");
                break;
            }
        }
    }
    stop.cancel();
    announced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_config_defaults() {
        let config = OrchestratorConfig::new(Arc::new(CommandSpawner::new("true")));
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn command_spawner_collects_args() {
        let spawner = CommandSpawner::new("observatory")
            .arg("engine")
            .args(["--heartbeat", "0.1"]);
        assert_eq!(spawner.args, vec!["engine", "--heartbeat", "0.1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_that_exits_before_ready_is_reported() {
        let config = OrchestratorConfig::new(Arc::new(CommandSpawner::new("true")))
            .with_ready_timeout(Duration::from_secs(5));
        let (_hub, engine) = crate::bridge::channel::channel_pair();

        let err = spawn_engine(config, engine).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::EngineExited));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_engine_times_out() {
        let config = OrchestratorConfig::new(Arc::new(CommandSpawner::new("sleep").arg("5")))
            .with_ready_timeout(Duration::from_millis(100));
        let (_hub, engine) = crate::bridge::channel::channel_pair();

        let err = spawn_engine(config, engine).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::ReadyTimeout));
    }
}
