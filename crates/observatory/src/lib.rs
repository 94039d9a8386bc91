//! observatory: request bridge between a socket hub and a polling device engine.

pub mod bridge;
pub mod engine;
pub mod hub;
pub mod orchestrator;
pub mod transport;
pub mod worker;

pub use bridge::channel::{EngineChannels, HubChannels, channel_pair};
pub use bridge::protocol::{
    PROCESSING_MESSAGE, Request, RequestError, Response, TIMED_OUT_MESSAGE, Timestamp,
};
pub use engine::{
    CommandContext, CommandHandler, CommandRegistry, DispatchError, Engine, EngineConfig, EngineError,
    HandlerError, HandlerOutput,
};
pub use hub::{CorrelationMode, Hub, HubConfig, HubError};
pub use orchestrator::{
    CommandSpawner, EngineProcess, OrchestratorConfig, ShutdownReport, spawn_engine,
};
pub use transport::{HubClient, ServerConfig};
pub use worker::{WorkerConfig, run_worker};
