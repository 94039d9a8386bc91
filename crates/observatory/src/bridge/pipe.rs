//! Carrying one direction of the channel pair over a byte pipe.
//!
//! When the engine runs as a child process, each side keeps a local
//! [`channel_pair`](super::channel::channel_pair) and these pumps move items
//! between the local queue and the child's stdin/stdout.

use std::time::Duration;

use crossbeam::channel::Receiver;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::channel::{Poll, poll_one};
use super::codec::JsonCodec;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("pipe write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// Drain a local queue onto a framed writer until the queue closes or
/// `shutdown` fires.
///
/// The queue is polled every `poll_interval`. On shutdown whatever is already
/// queued is still written before returning.
pub async fn forward_queue<T, M, W>(
    rx: Receiver<T>,
    writer: &mut FramedWrite<W, JsonCodec<M>>,
    wrap: impl Fn(T) -> M,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), BridgeError>
where
    M: Serialize,
    W: AsyncWrite + Unpin,
{
    loop {
        match poll_one(&rx) {
            Poll::Item(item) => writer.send(wrap(item)).await?,
            Poll::Closed => {
                tracing::debug!("Local queue closed, pipe forwarder exiting");
                return Ok(());
            }
            Poll::Empty => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    for item in rx.try_iter() {
        writer.send(wrap(item)).await?;
    }
    tracing::debug!("Pipe forwarder flushed on shutdown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::channel_pair;
    use crate::bridge::protocol::{ControlRequest, Request, Timestamp};
    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn forwards_requests_in_order_and_flushes_on_shutdown() {
        let (hub, engine) = channel_pair();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();

        for ts in [10, 20] {
            hub.to_engine
                .send(Request::new("ping", json!(ts), Timestamp::new(ts)))
                .unwrap();
        }

        let token = shutdown.clone();
        let rx = engine.from_hub.clone();
        let pump = tokio::spawn(async move {
            let mut writer = FramedWrite::new(client, JsonCodec::<ControlRequest>::new());
            forward_queue(
                rx,
                &mut writer,
                |request| ControlRequest::Deliver { request },
                Duration::from_millis(5),
                token,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.to_engine
            .send(Request::new("ping", json!(30), Timestamp::new(30)))
            .unwrap();
        shutdown.cancel();
        pump.await.unwrap().unwrap();

        let mut reader = FramedRead::new(server, JsonCodec::<ControlRequest>::new());
        let mut seen = Vec::new();
        for _ in 0..3 {
            match reader.next().await {
                Some(Ok(ControlRequest::Deliver { request })) => {
                    seen.push(request.timestamp.as_u64())
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn exits_when_queue_closes() {
        let (hub, engine) = channel_pair();
        let (client, _server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, JsonCodec::<ControlRequest>::new());
        drop(hub);

        forward_queue(
            engine.from_hub,
            &mut writer,
            |request| ControlRequest::Deliver { request },
            Duration::from_millis(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }
}
