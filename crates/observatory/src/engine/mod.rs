//! Engine: the single-threaded polling dispatcher.
//!
//! Each pass takes at most one request off the Hub→Engine queue, runs it to
//! completion and, for synced requests, pushes exactly one correlated response
//! onto Engine→Hub. Then it sleeps one heartbeat, work or not.
//!
//! The dequeued request lives only inside its pass; nothing carries it into
//! the next one, so a request cannot be executed twice.

mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{EngineChannels, Poll, poll_one};
use crate::bridge::protocol::{Request, Response, Timestamp};

pub use registry::{
    CommandContext, CommandHandler, CommandRegistry, DispatchError, FnHandler, HandlerError, HandlerOutput,
    RegistryBuilder,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between passes.
    pub heartbeat: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("request channel closed")]
    RequestChannelClosed,
}

/// What happened to one dequeued request.
#[derive(Debug)]
pub struct Dispatch {
    pub timestamp: Timestamp,
    pub command: String,
    pub synced: bool,
    pub outcome: Result<HandlerOutput, DispatchError>,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<CommandRegistry>,
    channels: EngineChannels,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: Arc<CommandRegistry>, channels: EngineChannels) -> Self {
        Self {
            config,
            registry,
            channels,
        }
    }

    /// Run passes until `shutdown` fires or the hub side goes away.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        tracing::info!(
            heartbeat_ms = self.config.heartbeat.as_millis() as u64,
            commands = ?self.registry.commands(),
            "Engine loop starting"
        );

        while !shutdown.is_cancelled() {
            self.tick().await?;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.heartbeat) => {}
            }
        }

        tracing::info!("Engine loop stopped");
        Ok(())
    }

    /// One pass without the heartbeat sleep.
    ///
    /// Returns `Ok(None)` when nothing was queued.
    pub async fn tick(&self) -> Result<Option<Dispatch>, EngineError> {
        match poll_one(&self.channels.from_hub) {
            Poll::Item(request) => Ok(Some(self.process(request).await)),
            Poll::Empty => Ok(None),
            Poll::Closed => Err(EngineError::RequestChannelClosed),
        }
    }

    async fn process(&self, request: Request) -> Dispatch {
        tracing::info!(
            command = %request.command,
            timestamp = %request.timestamp,
            synced = request.synced,
            "Executing request"
        );
        tracing::debug!(payload = %request.payload, "Request payload");

        let outcome = self.registry.dispatch(&request).await;

        match &outcome {
            Ok(output) => {
                tracing::info!(timestamp = %request.timestamp, message = %output.message, "Request completed");
            }
            Err(e @ DispatchError::UnknownCommand { .. }) => {
                tracing::warn!(timestamp = %request.timestamp, error = %e, "Received unknown command");
            }
            Err(e) => {
                tracing::error!(timestamp = %request.timestamp, error = %e, "Request failed");
            }
        }

        if request.synced {
            let response = match &outcome {
                Ok(output) => {
                    Response::new(output.payload.clone(), output.message.clone(), request.timestamp)
                }
                Err(e) => Response::error(&request, e.kind(), e.to_string()),
            };
            if self.channels.to_hub.send(response).is_err() {
                tracing::warn!(timestamp = %request.timestamp, "Response channel closed, dropping response");
            }
        }

        Dispatch {
            timestamp: request.timestamp,
            command: request.command,
            synced: request.synced,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{HubChannels, channel_pair};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl CommandHandler for Counter {
        async fn handle(
            &self,
            payload: Value,
            _context: CommandContext,
        ) -> Result<HandlerOutput, HandlerError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(HandlerOutput::new(json!({"runs": n, "echo": payload}), "counted"))
        }
    }

    async fn broken(_: Value) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::failed("store offline"))
    }

    fn setup() -> (Engine, HubChannels, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = CommandRegistry::builder()
            .register("count", Counter(Arc::clone(&runs)))
            .register_fn("broken", broken)
            .build();
        let (hub, engine) = channel_pair();
        let engine = Engine::new(
            EngineConfig::default().with_heartbeat(Duration::from_millis(10)),
            Arc::new(registry),
            engine,
        );
        (engine, hub, runs)
    }

    fn req(command: &str, ts: u64, synced: bool) -> Request {
        Request::new(command, json!("x"), Timestamp::new(ts)).synced(synced)
    }

    #[test]
    fn engine_config_default() {
        assert_eq!(EngineConfig::default().heartbeat, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tick_on_empty_queue_does_nothing() {
        let (engine, _hub, runs) = setup();
        assert!(engine.tick().await.unwrap().is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tick_takes_at_most_one_request() {
        let (engine, hub, runs) = setup();
        hub.to_engine.send(req("count", 1, false)).unwrap();
        hub.to_engine.send(req("count", 2, false)).unwrap();

        let first = engine.tick().await.unwrap().unwrap();
        assert_eq!(first.timestamp, Timestamp::new(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(hub.to_engine.len(), 1);
    }

    #[tokio::test]
    async fn single_request_runs_once() {
        let (engine, hub, runs) = setup();
        hub.to_engine.send(req("count", 1, false)).unwrap();

        for _ in 0..5 {
            engine.tick().await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn synced_request_gets_correlated_response() {
        let (engine, hub, _runs) = setup();
        hub.to_engine.send(req("count", 100, true)).unwrap();

        engine.tick().await.unwrap();
        let resp = hub.from_engine.try_recv().unwrap();
        assert_eq!(resp.timestamp, Timestamp::new(100));
        assert_eq!(resp.message, "counted");
        assert_eq!(resp.payload, json!({"runs": 1, "echo": "x"}));
        assert!(hub.from_engine.is_empty());
    }

    #[tokio::test]
    async fn fire_and_forget_produces_no_response() {
        let (engine, hub, _runs) = setup();
        hub.to_engine.send(req("count", 1, false)).unwrap();
        hub.to_engine.send(req("broken", 2, false)).unwrap();

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        assert!(hub.from_engine.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_recorded_and_next_request_still_runs() {
        let (engine, hub, runs) = setup();
        hub.to_engine.send(req("self_destruct", 1, true)).unwrap();
        hub.to_engine.send(req("count", 2, false)).unwrap();

        let unknown = engine.tick().await.unwrap().unwrap();
        assert!(matches!(
            unknown.outcome,
            Err(DispatchError::UnknownCommand { ref command }) if command == "self_destruct"
        ));
        let resp = hub.from_engine.try_recv().unwrap();
        assert_eq!(resp.timestamp, Timestamp::new(1));
        assert_eq!(
            resp.payload,
            json!({"error": "unknown_command", "command": "self_destruct"})
        );

        let next = engine.tick().await.unwrap().unwrap();
        assert!(next.outcome.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_response() {
        let (engine, hub, _runs) = setup();
        hub.to_engine.send(req("broken", 9, true)).unwrap();

        let dispatch = engine.tick().await.unwrap().unwrap();
        assert_eq!(dispatch.outcome.unwrap_err().kind(), "handler_failed");

        let resp = hub.from_engine.try_recv().unwrap();
        assert_eq!(resp.message, "command 'broken' failed: store offline");
        assert_eq!(resp.payload["error"], "handler_failed");
    }

    #[tokio::test]
    async fn tick_reports_closed_request_channel() {
        let (engine, hub, _runs) = setup();
        drop(hub);
        assert!(matches!(
            engine.tick().await,
            Err(EngineError::RequestChannelClosed)
        ));
    }

    #[tokio::test]
    async fn run_processes_until_shutdown() {
        let (engine, hub, runs) = setup();
        let engine = Arc::new(engine);
        let shutdown = CancellationToken::new();

        let task = {
            let engine = Arc::clone(&engine);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run(shutdown).await })
        };

        for ts in 0..3 {
            hub.to_engine.send(req("count", ts, false)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while runs.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine did not drain the queue");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
