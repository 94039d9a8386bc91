//! Synchronous request/reply over TCP.
//!
//! One exchange at a time per connection: the caller writes a request frame and
//! blocks until the reply frame arrives. Frames use the bridge framing
//! (4-byte length + JSON); decoding is lenient so a malformed frame is reported
//! as such instead of as a broken stream.

use std::io;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::bridge::codec::{encode_json, frame_codec};
use crate::bridge::protocol::{Request, RequestError, Response, WireRequest};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 52902,
        }
    }
}

/// Bind the hub's listener. Failure here is fatal at startup.
pub async fn bind(config: &ServerConfig) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Hub listening");
    Ok(listener)
}

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error(transparent)]
    Malformed(#[from] RequestError),
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}

/// Hub side of one accepted caller connection.
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            framed: Framed::new(stream, frame_codec()),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next request from the caller. `None` when the caller hung up.
    pub async fn next_request(&mut self) -> Option<Result<Request, InboundError>> {
        let frame = match self.framed.next().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e.into())),
        };
        Some(WireRequest::parse(&frame).map_err(InboundError::from))
    }

    pub async fn send_response(&mut self, response: &Response) -> io::Result<()> {
        self.framed.send(encode_json(response)?).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("hub closed the connection without replying")]
    NoReply,
    #[error("invalid reply from hub: {0}")]
    InvalidReply(#[from] serde_json::Error),
}

/// Caller side: a blocking request/reply client for the hub.
pub struct HubClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl HubClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec()),
        })
    }

    /// Send a request and wait for its reply.
    pub async fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.request_value(&serde_json::to_value(request)?).await
    }

    /// Send an arbitrary JSON document as a request, e.g. one without a
    /// timestamp so the hub stamps it.
    pub async fn request_value(
        &mut self,
        request: &serde_json::Value,
    ) -> Result<Response, ClientError> {
        self.send_frame(encode_json(request)?).await?;
        self.read_reply().await
    }

    /// Write raw bytes as one frame without waiting for a reply.
    pub async fn send_frame(&mut self, body: impl Into<Bytes>) -> Result<(), ClientError> {
        let body: Bytes = body.into();
        self.framed.send(body).await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Response, ClientError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(serde_json::from_slice(&frame)?),
            Some(Err(e)) => Err(e.into()),
            None => Err(ClientError::NoReply),
        }
    }

    /// Wait for a reply or the hub closing the connection.
    pub async fn next_reply(&mut self) -> Result<Option<Response>, ClientError> {
        match self.read_reply().await {
            Ok(resp) => Ok(Some(resp)),
            Err(ClientError::NoReply) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
