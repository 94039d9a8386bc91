//! Plumbing between the hub and the engine.
//!
//! # Architecture
//!
//! - **protocol**: Request/Response plus the engine pipe control envelopes
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **channel**: the Hub→Engine / Engine→Hub queue pair
//! - **pipe**: pumps extending a queue over a child process pipe

pub mod channel;
pub mod codec;
pub mod pipe;
pub mod protocol;
