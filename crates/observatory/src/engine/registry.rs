//! Command registry: the engine's only API.
//!
//! Built once at startup from command name → handler, immutable afterwards.
//! Lookup misses and handler failures are distinct [`DispatchError`] kinds.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::bridge::protocol::{Request, Timestamp};

/// Successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub payload: Value,
    pub message: String,
}

impl HandlerOutput {
    pub fn new(payload: Value, message: impl Into<String>) -> Self {
        Self {
            payload,
            message: message.into(),
        }
    }

    pub fn ok(payload: Value) -> Self {
        Self::new(payload, "ok")
    }
}

/// Failure raised by a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown command: {command}")]
    UnknownCommand { command: String },
    #[error("command '{command}' failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: HandlerError,
    },
    #[error("command '{command}' panicked: {message}")]
    Panicked { command: String, message: String },
}

impl DispatchError {
    /// Stable identifier carried in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownCommand { .. } => "unknown_command",
            Self::Handler { .. } => "handler_failed",
            Self::Panicked { .. } => "handler_panicked",
        }
    }
}

/// What a handler knows about the request besides its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    /// Correlation key of the request being handled.
    pub timestamp: Timestamp,
    pub synced: bool,
}

impl CommandContext {
    pub fn of(request: &Request) -> Self {
        Self {
            timestamp: request.timestamp,
            synced: request.synced,
        }
    }
}

/// A capability invoked by command name.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        payload: Value,
        context: CommandContext,
    ) -> Result<HandlerOutput, HandlerError>;
}

/// Adapter turning an async closure over the payload into a [`CommandHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        payload: Value,
        _context: CommandContext,
    ) -> Result<HandlerOutput, HandlerError> {
        (self.0)(payload).await
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl RegistryBuilder {
    pub fn register(mut self, command: impl Into<String>, handler: impl CommandHandler) -> Self {
        let command = command.into();
        if self
            .handlers
            .insert(command.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!(%command, "Handler registered twice, keeping the last one");
        }
        self
    }

    pub fn register_fn<F, Fut>(self, command: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
    {
        self.register(command, FnHandler(f))
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry {
            handlers: self.handlers,
        }
    }
}

pub struct CommandRegistry {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Run the handler bound to `request.command`.
    ///
    /// Handler errors and panics are caught here and never reach the caller as
    /// anything but a [`DispatchError`].
    pub async fn dispatch(&self, request: &Request) -> Result<HandlerOutput, DispatchError> {
        let Some(handler) = self.handlers.get(&request.command) else {
            return Err(DispatchError::UnknownCommand {
                command: request.command.clone(),
            });
        };

        let context = CommandContext::of(request);
        let result = AssertUnwindSafe(handler.handle(request.payload.clone(), context))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(DispatchError::Handler {
                command: request.command.clone(),
                source,
            }),
            Err(panic) => Err(DispatchError::Panicked {
                command: request.command.clone(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
