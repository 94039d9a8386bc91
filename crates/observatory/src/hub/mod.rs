//! Hub: terminates the external socket and bridges it to the engine.
//!
//! Callers are read concurrently; exchanges go through one at a time (see
//! [`CorrelationMode`]).
//!
//! Flow per exchange:
//! 1. Read one request from the caller (malformed → log, close connection)
//! 2. Push it onto the Hub→Engine queue, synced or not
//! 3. Fire-and-forget: acknowledge immediately
//! 4. Synced: wait for the correlated response, bounded by the timeout
//! 5. Write the reply (failure → log, back to accepting)

mod correlation;

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::HubChannels;
use crate::bridge::protocol::{Request, Response};
use crate::transport::{Connection, InboundError};

pub use correlation::{CorrelationMode, Correlator};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a synced request waits for the engine.
    pub timeout: Duration,
    /// Poll interval while waiting.
    pub cpu_delay: Duration,
    pub correlation: CorrelationMode,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            cpu_delay: Duration::from_millis(10),
            correlation: CorrelationMode::Discard,
        }
    }
}

impl HubConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cpu_delay(mut self, cpu_delay: Duration) -> Self {
        self.cpu_delay = cpu_delay;
        self
    }

    pub fn with_correlation(mut self, mode: CorrelationMode) -> Self {
        self.correlation = mode;
        self
    }
}

enum Event {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Served(Result<(), HubError>),
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("engine channel closed")]
    EngineUnavailable,
}

pub struct Hub {
    to_engine: crossbeam::channel::Sender<Request>,
    correlator: Correlator,
    /// Held for the whole of one exchange in `Discard` mode.
    exchange: Mutex<()>,
}

impl Hub {
    pub fn new(config: HubConfig, channels: HubChannels) -> Self {
        let correlator = Correlator::new(
            channels.from_engine,
            config.correlation,
            config.timeout,
            config.cpu_delay,
        );
        Self {
            to_engine: channels.to_engine,
            correlator,
            exchange: Mutex::new(()),
        }
    }

    /// Serve callers until `shutdown` fires.
    ///
    /// Every connection is read independently, so a silent caller never holds
    /// up the others. Exchanges are serialized unless correlation is `Keyed`.
    /// Only a closed engine channel ends the loop with an error.
    pub async fn listen(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), HubError> {
        let mut connections = FuturesUnordered::new();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => Event::Accepted(accepted),
                Some(served) = connections.next(), if !connections.is_empty() => {
                    Event::Served(served)
                }
            };

            match event {
                Event::Accepted(Ok((stream, peer))) => {
                    tracing::debug!(%peer, "Caller connected");
                    let conn = Connection::new(stream, peer);
                    connections.push(self.serve_connection(conn, shutdown.clone()));
                }
                Event::Accepted(Err(e)) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
                Event::Served(result) => result?,
            }
        }

        tracing::info!(open_connections = connections.len(), "Hub stopped listening");
        Ok(())
    }

    async fn serve_connection(
        &self,
        mut conn: Connection,
        shutdown: CancellationToken,
    ) -> Result<(), HubError> {
        let peer = conn.peer();
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                inbound = conn.next_request() => inbound,
            };

            let request = match inbound {
                Some(Ok(request)) => request,
                Some(Err(InboundError::Malformed(e))) => {
                    tracing::error!(%peer, error = %e, "Dropping malformed request, closing connection");
                    return Ok(());
                }
                Some(Err(InboundError::Io(e))) => {
                    tracing::error!(%peer, error = %e, "Error receiving request");
                    return Ok(());
                }
                None => {
                    tracing::debug!(%peer, "Caller disconnected");
                    return Ok(());
                }
            };

            let response = self.handle_request(request).await?;

            if let Err(e) = conn.send_response(&response).await {
                tracing::error!(%peer, error = %e, "Error sending response");
                return Ok(());
            }
            tracing::debug!(%peer, timestamp = %response.timestamp, message = %response.message, "Sent response");
        }
    }

    /// Forward a request to the engine and produce the caller's reply.
    pub async fn handle_request(&self, request: Request) -> Result<Response, HubError> {
        let _exchange = match self.correlator.mode() {
            CorrelationMode::Discard => Some(self.exchange.lock().await),
            CorrelationMode::Keyed => None,
        };

        tracing::info!(
            command = %request.command,
            timestamp = %request.timestamp,
            synced = request.synced,
            "Received request"
        );

        self.to_engine
            .send(request.clone())
            .map_err(|_| HubError::EngineUnavailable)?;

        if request.synced {
            Ok(self.await_response(&request).await)
        } else {
            Ok(Response::acknowledge(&request))
        }
    }

    /// Wait for the engine's response to a synced request (see [`Correlator`]).
    pub async fn await_response(&self, request: &Request) -> Response {
        self.correlator.await_response(request).await
    }
}
