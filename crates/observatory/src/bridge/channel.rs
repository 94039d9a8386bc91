//! The channel pair coupling the hub and the engine.
//!
//! Two unbounded FIFO queues, one per direction. Both ends of both queues are
//! cloneable and safe to use from any thread, so either side may be split
//! across tasks. Pops are non-blocking; waiting is done by the callers' polling
//! loops.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use super::protocol::{Request, Response};

/// The hub's ends: pushes requests, pops responses.
#[derive(Debug, Clone)]
pub struct HubChannels {
    pub to_engine: Sender<Request>,
    pub from_engine: Receiver<Response>,
}

/// The engine's ends: pops requests, pushes responses.
#[derive(Debug, Clone)]
pub struct EngineChannels {
    pub from_hub: Receiver<Request>,
    pub to_hub: Sender<Response>,
}

/// Create the Hub→Engine and Engine→Hub queues.
pub fn channel_pair() -> (HubChannels, EngineChannels) {
    let (req_tx, req_rx) = channel::unbounded();
    let (resp_tx, resp_rx) = channel::unbounded();
    (
        HubChannels {
            to_engine: req_tx,
            from_engine: resp_rx,
        },
        EngineChannels {
            from_hub: req_rx,
            to_hub: resp_tx,
        },
    )
}

/// Result of a single non-blocking pop.
#[derive(Debug, PartialEq)]
pub enum Poll<T> {
    Item(T),
    Empty,
    Closed,
}

/// Pop at most one item without blocking.
pub fn poll_one<T>(rx: &Receiver<T>) -> Poll<T> {
    match rx.try_recv() {
        Ok(item) => Poll::Item(item),
        Err(TryRecvError::Empty) => Poll::Empty,
        Err(TryRecvError::Disconnected) => Poll::Closed,
    }
}
