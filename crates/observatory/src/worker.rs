//! Engine process side of the pipe.
//!
//! The hub process spawns the engine as a child and talks to it over the
//! child's stdin/stdout (see `orchestrator.rs` for the parent side). Inside the
//! child a local channel pair is fed from stdin and drained to stdout, so the
//! [`Engine`] sees the same queues it would see in-process.
//!
//! stdout carries frames only; logs must go to stderr.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{HubChannels, channel_pair};
use crate::bridge::codec::JsonCodec;
use crate::bridge::pipe::{BridgeError, forward_queue};
use crate::bridge::protocol::{ControlRequest, ControlResponse, Request};
use crate::engine::{CommandRegistry, Engine, EngineConfig, EngineError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    /// How often the stdout forwarder checks for responses.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Run the engine on this process's stdin/stdout until the parent asks for
/// shutdown or goes away.
pub async fn run_worker(registry: CommandRegistry, config: WorkerConfig) -> Result<(), BridgeError> {
    run_worker_on(tokio::io::stdin(), tokio::io::stdout(), registry, config).await
}

/// [`run_worker`] over arbitrary pipe halves.
pub async fn run_worker_on<R, W>(
    reader: R,
    writer: W,
    registry: CommandRegistry,
    config: WorkerConfig,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (hub_side, engine_side) = channel_pair();
    let HubChannels {
        to_engine,
        from_engine,
    } = hub_side;

    let mut ctrl_writer = FramedWrite::new(writer, JsonCodec::<ControlResponse>::new());
    let ctrl_reader = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());

    let registry = Arc::new(registry);
    let commands = registry.commands();
    tracing::info!(?commands, "Engine worker ready");
    ctrl_writer.send(ControlResponse::Ready { commands }).await?;

    let shutdown = CancellationToken::new();
    let reader_task = tokio::spawn(read_control(ctrl_reader, to_engine, shutdown.clone()));

    let engine = Engine::new(config.engine.clone(), registry, engine_side);
    let drained = CancellationToken::new();

    let run_engine = async {
        let result = engine.run(shutdown.clone()).await;
        drained.cancel();
        result
    };
    let forward = forward_queue(
        from_engine,
        &mut ctrl_writer,
        |response| ControlResponse::Reply { response },
        config.poll_interval,
        drained.clone(),
    );

    let (engine_result, forward_result) = tokio::join!(run_engine, forward);
    shutdown.cancel();

    match engine_result {
        Ok(()) => {}
        Err(EngineError::RequestChannelClosed) => {
            tracing::info!("Request pipe closed, engine stopped");
        }
    }
    forward_result?;

    if let Err(e) = reader_task.await {
        tracing::warn!(error = %e, "Control reader task failed");
    }

    ctrl_writer.send(ControlResponse::ShuttingDown).await?;
    tracing::info!("Engine worker exiting");
    Ok(())
}

async fn read_control<R>(
    mut reader: FramedRead<R, JsonCodec<ControlRequest>>,
    to_engine: crossbeam::channel::Sender<Request>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = reader.next() => msg,
        };
        match msg {
            Some(Ok(ControlRequest::Deliver { request })) => {
                tracing::trace!(timestamp = %request.timestamp, "Request received over pipe");
                if to_engine.send(request).is_err() {
                    break;
                }
            }
            Some(Ok(ControlRequest::Shutdown)) => {
                tracing::info!("Shutdown requested");
                break;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Control pipe error");
                break;
            }
            None => {
                tracing::warn!("Control pipe closed (hub died?), exiting");
                break;
            }
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Timestamp;
    use crate::engine::{HandlerError, HandlerOutput};
    use serde_json::{Value, json};

    async fn pong(_: Value) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::ok(json!("pong")))
    }

    #[test]
    fn worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.engine.heartbeat, Duration::from_millis(100));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn worker_announces_serves_and_shuts_down() {
        let (parent_to_child, child_in) = tokio::io::duplex(64 * 1024);
        let (child_out, parent_from_child) = tokio::io::duplex(64 * 1024);

        let registry = CommandRegistry::builder().register_fn("ping", pong).build();
        let config = WorkerConfig {
            engine: EngineConfig::default().with_heartbeat(Duration::from_millis(5)),
            poll_interval: Duration::from_millis(5),
        };
        let worker = tokio::spawn(run_worker_on(child_in, child_out, registry, config));

        let mut to_child = FramedWrite::new(parent_to_child, JsonCodec::<ControlRequest>::new());
        let mut from_child = FramedRead::new(parent_from_child, JsonCodec::<ControlResponse>::new());

        match from_child.next().await {
            Some(Ok(ControlResponse::Ready { commands })) => assert_eq!(commands, vec!["ping"]),
            other => panic!("expected ready, got {other:?}"),
        }

        let request = Request::new("ping", json!("x"), Timestamp::new(100)).synced(true);
        to_child
            .send(ControlRequest::Deliver { request })
            .await
            .unwrap();

        match from_child.next().await {
            Some(Ok(ControlResponse::Reply { response })) => {
                assert_eq!(response.payload, json!("pong"));
                assert_eq!(response.timestamp, Timestamp::new(100));
            }
            other => panic!("expected reply, got {other:?}"),
        }

        to_child.send(ControlRequest::Shutdown).await.unwrap();
        match from_child.next().await {
            Some(Ok(ControlResponse::ShuttingDown)) => {}
            other => panic!("expected shutting_down, got {other:?}"),
        }
        worker.await.unwrap().unwrap();
    }
}
