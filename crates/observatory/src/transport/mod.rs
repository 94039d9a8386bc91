//! External transport for the hub.
//!
//! Currently a framed TCP request/reply socket.

pub mod tcp;

pub use tcp::{ClientError, Connection, HubClient, InboundError, ServerConfig, bind};
