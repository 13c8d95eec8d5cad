//! Broadcast hub
//!
//! Owns the set of connected viewers and pushes every encoded unit to all of
//! them. Delivery is best-effort: there is no per-client queue and no
//! retransmission. A client whose write fails is evicted on the spot; a
//! replacement connection resynchronizes on the next keyframe, which the hub
//! requests from the encoder whenever someone joins.
//!
//! Writes are serialized by the single client-set mutex, so frames reach
//! each client in encoder-emission order. There is no ordering guarantee
//! between clients.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tungstenite::Message;

struct Client<S> {
    id: u64,
    label: String,
    sink: S,
}

/// Fan-out point between the video pump and the WebSocket clients.
///
/// Generic over the sink so tests can observe writes without sockets; the
/// server instantiates it with the TLS WebSocket write half.
pub struct Hub<S> {
    clients: Mutex<Vec<Client<S>>>,
    next_id: AtomicU64,
    keyframe_wanted: AtomicBool,
}

impl<S> Hub<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: std::fmt::Display,
{
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            keyframe_wanted: AtomicBool::new(false),
        }
    }

    /// Register a viewer; returns its id for later removal.
    pub async fn add(&self, label: impl Into<String>, sink: S) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();

        let mut clients = self.clients.lock().await;
        clients.push(Client {
            id,
            label: label.clone(),
            sink,
        });

        // New viewers can only start decoding at an IDR; ask for one rather
        // than making them wait out the GOP.
        self.keyframe_wanted.store(true, Ordering::Relaxed);

        info!(client = %label, viewers = clients.len(), "viewer connected");
        id
    }

    /// Remove a viewer by id (normal close path).
    pub async fn remove(&self, id: u64) {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|c| c.id != id);
        if clients.len() != before {
            info!(viewers = clients.len(), "viewer disconnected");
        }
    }

    /// Send one encoded unit to every viewer as a single binary message.
    ///
    /// The payload is borrowed for the duration of the call (it lives in the
    /// encoder's mapped slot); the only copies are the per-client wire
    /// frames. Failed writers are evicted; everyone else is unaffected.
    /// Returns the number of clients that received the payload.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return 0;
        }

        let mut failed: Vec<u64> = Vec::new();
        for client in clients.iter_mut() {
            let message = Message::Binary(payload.to_vec());
            if let Err(err) = client.sink.send(message).await {
                warn!(client = %client.label, %err, "viewer write failed");
                failed.push(client.id);
            }
        }

        if !failed.is_empty() {
            clients.retain(|c| !failed.contains(&c.id));
            warn!(
                evicted = failed.len(),
                viewers = clients.len(),
                "evicted stalled viewers"
            );
        }

        clients.len()
    }

    /// Number of connected viewers.
    pub async fn viewer_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Consume the pending keyframe request, if any. Polled by the pump once
    /// per cycle.
    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_wanted.swap(false, Ordering::Relaxed)
    }
}

impl<S> Default for Hub<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: std::fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::task::{Context, Poll};

    /// Records everything sent through it; optionally fails every write.
    struct MockSink {
        sent: Arc<StdMutex<Vec<Message>>>,
        fail: bool,
    }

    impl MockSink {
        fn new() -> (Self, Arc<StdMutex<Vec<Message>>>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    sent: Arc::clone(&sent),
                    fail: false,
                },
                sent,
            )
        }

        fn failing() -> Self {
            Self {
                sent: Arc::new(StdMutex::new(Vec::new())),
                fail: true,
            }
        }
    }

    impl Sink<Message> for MockSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_viewers() {
        let hub: Hub<MockSink> = Hub::new();
        let (sink_a, sent_a) = MockSink::new();
        let (sink_b, sent_b) = MockSink::new();
        hub.add("a", sink_a).await;
        hub.add("b", sink_b).await;

        let delivered = hub.broadcast(b"frame").await;
        assert_eq!(delivered, 2);

        for sent in [sent_a, sent_b] {
            let messages = sent.lock().unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0], Message::Binary(b"frame".to_vec()));
        }
    }

    #[tokio::test]
    async fn test_failing_viewer_evicted_others_unaffected() {
        let hub: Hub<MockSink> = Hub::new();
        let (sink_a, sent_a) = MockSink::new();
        let (sink_c, sent_c) = MockSink::new();
        hub.add("a", sink_a).await;
        hub.add("b", MockSink::failing()).await;
        hub.add("c", sink_c).await;

        let delivered = hub.broadcast(b"frame").await;
        assert_eq!(delivered, 2);
        assert_eq!(hub.viewer_count().await, 2);

        for sent in [sent_a, sent_c] {
            let messages = sent.lock().unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0], Message::Binary(b"frame".to_vec()));
        }
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_without_duplication() {
        let hub: Hub<MockSink> = Hub::new();
        let (sink, sent) = MockSink::new();
        hub.add("a", sink).await;

        for i in 0u8..10 {
            hub.broadcast(&[i]).await;
        }

        let messages = sent.lock().unwrap();
        assert_eq!(messages.len(), 10);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(*message, Message::Binary(vec![i as u8]));
        }
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let hub: Hub<MockSink> = Hub::new();
        let (sink_a, _) = MockSink::new();
        let (sink_b, sent_b) = MockSink::new();
        let id_a = hub.add("a", sink_a).await;
        hub.add("b", sink_b).await;

        hub.remove(id_a).await;
        assert_eq!(hub.viewer_count().await, 1);

        hub.broadcast(b"x").await;
        assert_eq!(sent_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_join_requests_keyframe() {
        let hub: Hub<MockSink> = Hub::new();
        assert!(!hub.take_keyframe_request());

        let (sink, _) = MockSink::new();
        hub.add("a", sink).await;
        assert!(hub.take_keyframe_request());
        // Consumed.
        assert!(!hub.take_keyframe_request());
    }

    #[tokio::test]
    async fn test_broadcast_with_no_viewers() {
        let hub: Hub<MockSink> = Hub::new();
        assert_eq!(hub.broadcast(b"frame").await, 0);
    }
}
