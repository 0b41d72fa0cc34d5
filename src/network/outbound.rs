//! Outbound Delivery
//!
//! Each live connection owns one bounded queue of server messages and a
//! writer task that drains it. Enqueueing never waits: a full queue means
//! the client is not keeping up, so the message is dropped and the
//! connection is shut down instead of buffering without bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use crate::network::protocol::{coalesce, ServerMessage};

/// Identifier of one physical connection.
pub type ConnectionId = u64;

/// Messages drained into a single text frame at most.
pub const MAX_BATCH: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Queue was full; the connection has been shut down.
    #[error("outbound queue overflowed")]
    Overflow,
    /// Connection already shut down.
    #[error("connection closed")]
    Closed,
}

/// Sending half of a connection's outbound queue.
///
/// Cheap to clone; all clones address the same connection.
#[derive(Clone, Debug)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    close_tx: Arc<watch::Sender<bool>>,
}

/// Receiving half, owned by the connection's writer task.
#[derive(Debug)]
pub struct OutboxReceiver {
    /// Queued messages.
    pub rx: mpsc::Receiver<ServerMessage>,
    /// Flips to true when the connection must shut down.
    pub closed: watch::Receiver<bool>,
}

impl Outbox {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, closed) = watch::channel(false);
        let outbox = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            close_tx: Arc::new(close_tx),
        };
        (outbox, OutboxReceiver { rx, closed })
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue without waiting.
    ///
    /// On overflow the message is dropped and the connection is closed.
    pub fn push(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for connection {}, closing", self.id);
                self.close();
                Err(DeliveryError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(DeliveryError::Closed)
            }
        }
    }

    /// Shut the connection down. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether the connection has been shut down.
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.tx.is_closed()
    }

    /// Wait until the connection is shut down.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        // The sender lives in self, so this only errors if already dropped.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Wait for the next message and take whatever else is already queued,
/// up to `MAX_BATCH`. `None` once the queue is closed and empty.
async fn recv_batch(rx: &mut mpsc::Receiver<ServerMessage>) -> Option<Vec<ServerMessage>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while batch.len() < MAX_BATCH {
        match rx.try_recv() {
            Ok(msg) => batch.push(msg),
            Err(_) => break,
        }
    }
    Some(batch)
}

/// Spawn the writer task for a WebSocket sink.
///
/// Queued messages are serialized and newline-joined into one text frame.
/// Exits when the queue closes, the connection is shut down, or a socket
/// write fails; a shut-down connection gets a close frame on the way out.
pub fn spawn_ws_writer<S>(
    mut sink: S,
    outbox: OutboxReceiver,
    conn_id: ConnectionId,
) -> tokio::task::JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let OutboxReceiver { mut rx, mut closed } = outbox;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                batch = recv_batch(&mut rx) => {
                    let batch = match batch {
                        Some(b) => b,
                        None => break,
                    };
                    let mut lines = Vec::with_capacity(batch.len());
                    for msg in &batch {
                        match msg.to_json() {
                            Ok(text) => lines.push(text),
                            Err(e) => error!("Failed to serialize message: {}", e),
                        }
                    }
                    if lines.is_empty() {
                        continue;
                    }
                    if let Err(e) = sink.send(Message::Text(coalesce(&lines))).await {
                        debug!("Write failed on connection {}: {}", conn_id, e);
                        return;
                    }
                }
                // The watch guard must not outlive the branch.
                _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                    break;
                }
            }
        }

        // Flush what is already queued so a final error event still lands.
        let mut lines = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Ok(text) = msg.to_json() {
                lines.push(text);
            }
        }
        if !lines.is_empty() {
            let _ = sink.send(Message::Text(coalesce(&lines))).await;
        }
        let _ = sink.send(Message::Close(None)).await;
        debug!("Writer for connection {} finished", conn_id);
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use crate::network::protocol::ErrorCode;

    /// Sink that records every frame it is given.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Message>>>);

    impl Sink<Message> for RecordingSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.0.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn msg(n: usize) -> ServerMessage {
        ServerMessage::error(ErrorCode::InvalidMessage, format!("m{}", n))
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _ra) = Outbox::new(4);
        let (b, _rb) = Outbox::new(4);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[tokio::test]
    async fn test_push_and_batch() {
        let (outbox, mut rx) = Outbox::new(8);
        for i in 0..3 {
            outbox.push(msg(i)).unwrap();
        }

        let batch = recv_batch(&mut rx.rx).await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_overflow_drops_and_closes() {
        let (outbox, mut rx) = Outbox::new(2);
        outbox.push(msg(0)).unwrap();
        outbox.push(msg(1)).unwrap();

        assert_eq!(outbox.push(msg(2)), Err(DeliveryError::Overflow));
        assert!(outbox.is_closed());
        assert!(*rx.closed.borrow());

        // Terminal: later pushes fail even with room.
        let _ = recv_batch(&mut rx.rx).await;
        assert_eq!(outbox.push(msg(3)), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_push_after_receiver_dropped() {
        let (outbox, rx) = Outbox::new(2);
        drop(rx);
        assert_eq!(outbox.push(msg(0)), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let (outbox, _rx) = Outbox::new(2);
        let waiter = outbox.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });

        outbox.close();
        outbox.close();
        handle.await.unwrap();
        assert!(outbox.is_closed());
    }

    #[tokio::test]
    async fn test_writer_coalesces_frames() {
        let (outbox, rx) = Outbox::new(8);
        let sink = RecordingSink::default();

        outbox.push(msg(0)).unwrap();
        outbox.push(msg(1)).unwrap();
        outbox.close();
        spawn_ws_writer(sink.clone(), rx, outbox.id()).await.unwrap();

        let frames = sink.0.lock().unwrap().clone();
        let text = match frames.first() {
            Some(Message::Text(text)) => text.clone(),
            other => panic!("unexpected frame {:?}", other),
        };
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("m0"));
        assert!(lines[1].contains("m1"));
        assert!(matches!(frames.last(), Some(Message::Close(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_stops_on_shutdown() {
        let (outbox, rx) = Outbox::new(8);
        let sink = RecordingSink::default();
        let writer = spawn_ws_writer(sink.clone(), rx, outbox.id());

        outbox.push(msg(0)).unwrap();
        for _ in 0..100 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(sink.0.lock().unwrap().len(), 1);

        outbox.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), writer)
            .await
            .expect("writer did not stop")
            .unwrap();

        let frames = sink.0.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Message::Close(_)));
    }
}
