//! Waiting for the engine's answer to a synced request.
//!
//! The only link between a request and its response is the timestamp. The
//! waiter polls the Engine→Hub queue until it sees a matching response or the
//! deadline passes, in which case it answers with a synthetic timeout.
//!
//! A response that does not match the current waiter is a *stray*. What
//! happens to strays depends on [`CorrelationMode`]:
//! - `Discard`: dropped. Safe only while a single synced wait is active, which
//!   the hub guarantees by serving one exchange at a time. Strays are then
//!   late answers to requests that already timed out.
//! - `Keyed`: parked in a table keyed by timestamp, where the waiter that owns
//!   the timestamp picks it up. Parked entries expire after one timeout.

use std::str::FromStr;
use std::time::Duration;

use crossbeam::channel::Receiver;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::bridge::channel::{Poll, poll_one};
use crate::bridge::protocol::{Request, Response, Timestamp};

/// Policy for responses that arrive while a different request is awaited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorrelationMode {
    #[default]
    Discard,
    Keyed,
}

impl CorrelationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::Keyed => "keyed",
        }
    }
}

impl std::fmt::Display for CorrelationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrelationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "keyed" => Ok(Self::Keyed),
            other => Err(format!(
                "unknown correlation mode '{other}' (expected 'discard' or 'keyed')"
            )),
        }
    }
}

struct Parked {
    response: Response,
    expires_at: Instant,
}

pub struct Correlator {
    mode: CorrelationMode,
    timeout: Duration,
    cpu_delay: Duration,
    from_engine: Receiver<Response>,
    parked: DashMap<Timestamp, Parked>,
}

impl Correlator {
    pub fn new(
        from_engine: Receiver<Response>,
        mode: CorrelationMode,
        timeout: Duration,
        cpu_delay: Duration,
    ) -> Self {
        Self {
            mode,
            timeout,
            cpu_delay,
            from_engine,
            parked: DashMap::new(),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Number of strays currently held for other waiters (always 0 in
    /// `Discard` mode).
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Wait for the response to `request`.
    ///
    /// Returns the engine's response verbatim if one with the same timestamp
    /// arrives before the deadline, otherwise [`Response::timed_out`]. Never
    /// sleeps past the deadline.
    pub async fn await_response(&self, request: &Request) -> Response {
        let deadline = Instant::now() + self.timeout;

        loop {
            if let Some(response) = self.take_parked(request.timestamp) {
                tracing::debug!(timestamp = %request.timestamp, "Matched parked response");
                return response;
            }

            match poll_one(&self.from_engine) {
                Poll::Item(response) if response.answers(request) => {
                    tracing::debug!(timestamp = %request.timestamp, "Matched engine response");
                    return response;
                }
                Poll::Item(stray) => self.handle_stray(stray, request.timestamp),
                Poll::Empty | Poll::Closed => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep((deadline - now).min(self.cpu_delay)).await;
                    continue;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        tracing::warn!(
            timestamp = %request.timestamp,
            command = %request.command,
            timeout_secs = self.timeout.as_secs_f64(),
            "Timed out waiting for engine response"
        );
        Response::timed_out(request)
    }

    fn take_parked(&self, timestamp: Timestamp) -> Option<Response> {
        if self.parked.is_empty() {
            return None;
        }
        let (_, parked) = self.parked.remove(&timestamp)?;
        if parked.expires_at <= Instant::now() {
            tracing::debug!(%timestamp, "Dropping expired parked response");
            return None;
        }
        Some(parked.response)
    }

    fn handle_stray(&self, stray: Response, awaited: Timestamp) {
        match self.mode {
            CorrelationMode::Discard => {
                tracing::warn!(
                    stray = %stray.timestamp,
                    %awaited,
                    "Discarding response that matches no waiting request"
                );
            }
            CorrelationMode::Keyed => {
                let now = Instant::now();
                self.parked.retain(|_, p| p.expires_at > now);
                tracing::debug!(stray = %stray.timestamp, %awaited, "Parking response for another waiter");
                self.parked.insert(
                    stray.timestamp,
                    Parked {
                        response: stray,
                        expires_at: now + self.timeout,
                    },
                );
            }
        }
    }
}
