//! observatory: runs the hub and the engine, or talks to a running hub.

mod capabilities;
mod config;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use observatory::transport::bind;
use observatory::{
    CommandSpawner, Engine, EngineError, EngineProcess, Hub, HubClient, OrchestratorConfig,
    Request, Timestamp, WorkerConfig, channel_pair, run_worker, spawn_engine,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use config::{Cli, Command, EngineArgs, HubArgs, SendArgs};

/// How long the engine gets to finish after the hub stops.
const ENGINE_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = config::load_dotenv();
    if let Err(e) = logging::init_tracing() {
        eprintln!("observatory: logging disabled: {e}");
    }
    match dotenv {
        Ok(Some(path)) => tracing::debug!(path = %path.display(), "Loaded .env"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to load .env"),
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => run_hub(args).await,
        Command::Engine(args) => run_engine(args).await,
        Command::Send(args) => send(args).await,
    }
}

enum RunningEngine {
    InProcess {
        task: JoinHandle<Result<(), EngineError>>,
        stop: CancellationToken,
    },
    Process(EngineProcess),
}

impl RunningEngine {
    /// Fires if the engine goes away on its own.
    fn stopped(&self) -> CancellationToken {
        match self {
            Self::InProcess { stop, .. } => stop.clone(),
            Self::Process(process) => process.stopped(),
        }
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        match self {
            Self::InProcess { task, stop } => {
                stop.cancel();
                match tokio::time::timeout(ENGINE_GRACE, task).await {
                    Ok(joined) => {
                        joined.context("engine task panicked")??;
                    }
                    Err(_) => tracing::warn!("Engine did not stop in time"),
                }
                Ok(())
            }
            Self::Process(process) => {
                let report = process.shutdown(ENGINE_GRACE).await?;
                if !report.announced {
                    tracing::warn!("Engine stopped without announcing shutdown");
                }
                Ok(())
            }
        }
    }
}

async fn run_hub(args: HubArgs) -> anyhow::Result<()> {
    let (hub_channels, engine_channels) = channel_pair();

    let engine = if args.in_process {
        tracing::info!("Running engine in-process");
        let registry = capabilities::build_registry(&args.engine)
            .context("failed to open measurement store")?;
        let engine = Engine::new(
            args.engine.engine_config(),
            Arc::new(registry),
            engine_channels,
        );
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move { engine.run(token).await });
        RunningEngine::InProcess { task, stop }
    } else {
        let spawner = CommandSpawner::current_exe()
            .context("failed to locate current executable")?
            .args(args.engine.to_args());
        let config = OrchestratorConfig::new(Arc::new(spawner))
            .with_ready_timeout(args.ready_timeout);
        let process = spawn_engine(config, engine_channels)
            .await
            .context("failed to start engine process")?;
        tracing::info!(commands = ?process.commands(), "Engine process ready");
        RunningEngine::Process(process)
    };

    let listener = bind(&args.server_config())
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    let hub = Hub::new(args.hub_config(), hub_channels);
    tracing::info!(
        timeout_secs = args.timeout.as_secs_f64(),
        cpu_delay_secs = args.cpu_delay.as_secs_f64(),
        correlation = %args.correlation,
        "Hub starting"
    );

    let shutdown = CancellationToken::new();
    let engine_stopped = engine.stopped();
    let outcome = tokio::select! {
        result = hub.listen(listener, shutdown.clone()) => {
            result.context("hub lost the engine")
        }
        _ = shutdown_signal() => {
            shutdown.cancel();
            Ok(())
        }
        _ = engine_stopped.cancelled() => {
            Err(anyhow::anyhow!("engine stopped unexpectedly"))
        }
    };

    if let Err(e) = engine.shutdown().await {
        tracing::error!(error = %e, "Engine shutdown failed");
    }
    outcome
}

async fn run_engine(args: EngineArgs) -> anyhow::Result<()> {
    let registry =
        capabilities::build_registry(&args).context("failed to open measurement store")?;
    let config = WorkerConfig {
        engine: args.engine_config(),
        ..WorkerConfig::default()
    };
    run_worker(registry, config)
        .await
        .context("engine pipe failed")
}

async fn send(args: SendArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
    if args.command.trim().is_empty() {
        bail!("command must not be empty");
    }

    let request = Request::new(args.command, payload, Timestamp::now_unique()).synced(args.synced);
    let mut client = HubClient::connect(args.addr.as_str())
        .await
        .with_context(|| format!("failed to connect to hub at {}", args.addr))?;
    let response = client.request(&request).await.context("request failed")?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// runtime is misconfigured.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
