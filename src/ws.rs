use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded depth of each client's send queue. A client that lets this fill
/// up is considered slow and is dropped on the next broadcast.
const SEND_QUEUE_DEPTH: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(54);
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// JSON frame exchanged with WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

struct Registration {
    id: Uuid,
    sender: mpsc::Sender<WsMessage>,
}

/// Registration/broadcast engine for upgraded connections.
///
/// A single supervisor task owns the client table and multiplexes the
/// register, unregister, broadcast, and shutdown channels; it never performs
/// network I/O itself, only queue operations on per-client senders.
pub struct Hub {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Uuid>,
    broadcast_tx: mpsc::Sender<WsMessage>,
    client_count: Arc<AtomicUsize>,
}

impl Hub {
    pub fn new() -> (Self, Supervisor) {
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(256);
        let client_count = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            client_count: Arc::clone(&client_count),
        };
        let supervisor = Supervisor {
            register_rx,
            unregister_rx,
            broadcast_rx,
            clients: HashMap::new(),
            client_count,
        };
        (hub, supervisor)
    }

    pub async fn register(&self, id: Uuid, sender: mpsc::Sender<WsMessage>) {
        let _ = self.register_tx.send(Registration { id, sender }).await;
    }

    /// Idempotent: unregistering an unknown or already-removed client is a
    /// no-op.
    pub async fn unregister(&self, id: Uuid) {
        let _ = self.unregister_tx.send(id).await;
    }

    /// Enqueue a message for every connected client.
    pub async fn broadcast(&self, message: WsMessage) {
        let _ = self.broadcast_tx.send(message).await;
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }
}

/// Owns the client table; consumed by `spawn`.
pub struct Supervisor {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Uuid>,
    broadcast_rx: mpsc::Receiver<WsMessage>,
    clients: HashMap<Uuid, mpsc::Sender<WsMessage>>,
    client_count: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                Some(registration) = self.register_rx.recv() => {
                    debug!(client = %registration.id, "WebSocket client registered");
                    self.clients.insert(registration.id, registration.sender);
                    self.publish_count();
                }
                Some(id) = self.unregister_rx.recv() => {
                    if self.clients.remove(&id).is_some() {
                        debug!(client = %id, "WebSocket client unregistered");
                        self.publish_count();
                    }
                }
                Some(message) = self.broadcast_rx.recv() => {
                    let mut slow = Vec::new();
                    for (id, sender) in &self.clients {
                        if sender.try_send(message.clone()).is_err() {
                            slow.push(*id);
                        }
                    }
                    for id in slow {
                        warn!(client = %id, "Dropping slow WebSocket client");
                        self.clients.remove(&id);
                    }
                    self.publish_count();
                }
                _ = shutdown.changed() => {
                    info!(clients = self.clients.len(), "WebSocket hub shutting down");
                    self.clients.clear();
                    self.publish_count();
                    return;
                }
            }
        }
    }

    fn publish_count(&self) {
        let count = self.clients.len();
        self.client_count.store(count, Ordering::Relaxed);
        gauge!("gateway_websocket_clients").set(count as f64);
    }
}

/// Drive one upgraded connection: a writer that consumes the send queue and
/// pings every 54 s, and a reader with a 60 s deadline refreshed by every
/// inbound frame (pongs included). Inbound JSON frames are re-broadcast.
pub async fn serve(hub: Arc<Hub>, socket: WebSocket) {
    let id = Uuid::new_v4();
    let (sender, mut send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    hub.register(id, sender).await;

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                message = send_rx.recv() => match message {
                    Some(message) => {
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(_) => continue,
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    // Queue closed by the hub: say goodbye and stop.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    loop {
        match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!(client = %id, "WebSocket read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(message) = serde_json::from_str::<WsMessage>(&text) {
                    hub.broadcast(message).await;
                }
            }
            // Pongs and other control frames just refresh the deadline.
            Ok(Some(Ok(_))) => {}
        }
    }

    hub.unregister(id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: &str) -> WsMessage {
        WsMessage {
            kind: kind.to_string(),
            payload: serde_json::json!({}),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let (hub, supervisor) = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = supervisor.spawn(shutdown_rx);

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.register(Uuid::new_v4(), tx_a).await;
        hub.register(Uuid::new_v4(), tx_b).await;
        settle().await;
        assert_eq!(hub.client_count(), 2);

        hub.broadcast(message("event")).await;
        settle().await;

        assert_eq!(rx_a.recv().await.unwrap().kind, "event");
        assert_eq!(rx_b.recv().await.unwrap().kind, "event");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn slow_client_is_dropped_others_still_receive() {
        let (hub, supervisor) = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = supervisor.spawn(shutdown_rx);

        // Queue of depth 1 that is already full.
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        tx_slow.try_send(message("backlog")).unwrap();
        let (tx_ok, mut rx_ok) = mpsc::channel(8);

        hub.register(Uuid::new_v4(), tx_slow).await;
        hub.register(Uuid::new_v4(), tx_ok).await;
        settle().await;
        assert_eq!(hub.client_count(), 2);

        hub.broadcast(message("event")).await;
        settle().await;

        assert_eq!(hub.client_count(), 1);
        assert_eq!(rx_ok.recv().await.unwrap().kind, "event");
        // The slow client only ever saw its backlog; its queue is now closed.
        assert_eq!(rx_slow.recv().await.unwrap().kind, "backlog");
        assert!(rx_slow.recv().await.is_none());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (hub, supervisor) = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = supervisor.spawn(shutdown_rx);

        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);
        hub.register(id, tx).await;
        settle().await;
        assert_eq!(hub.client_count(), 1);

        hub.unregister(id).await;
        hub.unregister(id).await;
        settle().await;
        assert_eq!(hub.client_count(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_clients() {
        let (hub, supervisor) = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = supervisor.spawn(shutdown_rx);

        let (tx, mut rx) = mpsc::channel(8);
        hub.register(Uuid::new_v4(), tx).await;
        settle().await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(hub.client_count(), 0);
        // Dropping the table closed the client's send queue.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn ws_message_round_trips() {
        let msg: WsMessage =
            serde_json::from_str(r#"{"type": "notice", "payload": {"k": 1}}"#).unwrap();
        assert_eq!(msg.kind, "notice");
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""type":"notice""#));
    }
}
