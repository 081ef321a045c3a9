//! Connected-client registry and the per-socket read/write pump.
//!
//! Each WebSocket connection gets a `ClientId`, an outbound send queue,
//! and an entry in the registry. Frames received from the socket are
//! forwarded to the coordinator's processing channel; frames queued for
//! the client are drained by the writer half of the pump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Interval between server-initiated pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A client that has not ponged for this long is considered dead.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Opaque per-connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State for one connected client. Identity is fixed for the lifetime
/// of the connection, so only liveness flags need atomics.
pub struct Client {
    pub id: ClientId,
    pub identity: String,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    /// Set once the history snapshot has been queued. Broadcasts skip
    /// clients that are not yet ready so a client never sees a message
    /// both in its snapshot and as a live broadcast.
    ready: AtomicBool,
    last_pong_ms: AtomicU64,
}

impl Client {
    fn new(id: ClientId, identity: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            identity,
            tx,
            connected: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            last_pong_ms: AtomicU64::new(now_ms()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_pong_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn is_stale(&self, timeout: Duration) -> bool {
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        now_ms().saturating_sub(last) > timeout.as_millis() as u64
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registry of live connections. Cheap to clone handles out of; all
/// methods are safe to call from any task.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    send_queue_size: usize,
}

impl ClientRegistry {
    pub fn new(send_queue_size: usize) -> Self {
        Self {
            clients: DashMap::new(),
            send_queue_size,
        }
    }

    /// Register a connection under the given identity. Returns the
    /// receiver half of the client's outbound queue; the socket writer
    /// drains it.
    pub fn register(&self, id: ClientId, identity: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.send_queue_size);
        let client = Arc::new(Client::new(id.clone(), identity.to_string(), tx));
        self.clients.insert(id.clone(), client);
        debug!(client_id = %id, identity, "client registered");
        rx
    }

    /// Remove a connection. Idempotent.
    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
            debug!(client_id = %id, identity = %client.identity, "client unregistered");
        }
    }

    /// Mark a client eligible for broadcasts. Called after its history
    /// snapshot has been queued.
    pub fn mark_ready(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.ready.store(true, Ordering::Relaxed);
        }
    }

    pub fn identity_of(&self, id: &ClientId) -> Option<String> {
        self.clients.get(id).map(|c| c.identity.clone())
    }

    /// Number of live connections sharing an identity.
    pub fn identity_connections(&self, identity: &str) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.identity == identity && entry.is_connected())
            .count()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Queue a frame for one client. Returns false if the client is
    /// gone or its queue is full; a full queue drops the frame rather
    /// than stalling the caller.
    pub fn send_to(&self, id: &ClientId, frame: String) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        if !client.is_connected() {
            return false;
        }
        match client.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = %id, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every ready client. Returns the number of
    /// clients it was delivered to. A slow client only loses its own
    /// frames.
    pub fn broadcast(&self, frame: &str) -> usize {
        let mut delivered = 0;
        for entry in self.clients.iter() {
            if !entry.is_connected() || !entry.is_ready() {
                continue;
            }
            match entry.tx.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = %entry.id, "send queue full, dropping broadcast frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn record_pong(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.touch();
        }
    }

    /// Ids of clients that stopped answering pings. Teardown is the
    /// coordinator's job so gauges and cooldowns stay consistent.
    pub fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.is_stale(timeout))
            .map(|entry| entry.id.clone())
            .collect()
    }
}

/// Run the socket pump for an admitted client until it disconnects.
///
/// The writer half drains the client's outbound queue and sends
/// heartbeat pings; the reader half forwards text frames to the
/// coordinator channel and records pongs. Either half ending tears the
/// connection down.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut outbound: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    frames: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        debug!(client_id = %writer_id, "ping failed, closing writer");
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "websocket read error");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                if frames.send((client_id.clone(), text.to_string())).await.is_err() {
                    break;
                }
            }
            WsMessage::Pong(_) => registry.record_pong(&client_id),
            WsMessage::Close(_) => {
                debug!(client_id = %client_id, "client sent close frame");
                break;
            }
            _ => {}
        }
    }

    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_send() {
        let registry = ClientRegistry::new(16);
        let id = ClientId::new();
        let mut rx = registry.register(id.clone(), "alice");

        assert!(registry.send_to(&id, "hello".to_string()));
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(registry.identity_of(&id).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn send_to_unknown_client_returns_false() {
        let registry = ClientRegistry::new(16);
        assert!(!registry.send_to(&ClientId::new(), "hello".to_string()));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ClientRegistry::new(16);
        let id = ClientId::new();
        let _rx = registry.register(id.clone(), "alice");

        registry.unregister(&id);
        registry.unregister(&id);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_not_ready_clients() {
        let registry = ClientRegistry::new(16);
        let ready_id = ClientId::new();
        let mut ready_rx = registry.register(ready_id.clone(), "alice");
        let pending_id = ClientId::new();
        let mut pending_rx = registry.register(pending_id.clone(), "bob");

        registry.mark_ready(&ready_id);
        assert_eq!(registry.broadcast("frame"), 1);

        assert_eq!(ready_rx.recv().await.as_deref(), Some("frame"));
        assert!(pending_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_drops_frames_for_full_queues() {
        let registry = ClientRegistry::new(1);
        let slow_id = ClientId::new();
        let _slow_rx = registry.register(slow_id.clone(), "slow");
        let fast_id = ClientId::new();
        let mut fast_rx = registry.register(fast_id.clone(), "fast");
        registry.mark_ready(&slow_id);
        registry.mark_ready(&fast_id);

        // Fill the slow client's queue.
        assert!(registry.send_to(&slow_id, "first".to_string()));

        assert_eq!(registry.broadcast("second"), 1);
        assert_eq!(fast_rx.recv().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn identity_connections_counts_per_identity() {
        let registry = ClientRegistry::new(16);
        let a = ClientId::new();
        let b = ClientId::new();
        let c = ClientId::new();
        let _rx_a = registry.register(a.clone(), "alice");
        let _rx_b = registry.register(b.clone(), "alice");
        let _rx_c = registry.register(c.clone(), "bob");

        assert_eq!(registry.identity_connections("alice"), 2);
        registry.unregister(&a);
        assert_eq!(registry.identity_connections("alice"), 1);
        assert_eq!(registry.identity_connections("bob"), 1);
    }

    #[tokio::test]
    async fn stale_clients_reports_silent_connections() {
        let registry = ClientRegistry::new(16);
        let id = ClientId::new();
        let _rx = registry.register(id.clone(), "alice");
        assert!(registry.stale_clients(CLIENT_TIMEOUT).is_empty());

        registry
            .clients
            .get(&id)
            .unwrap()
            .last_pong_ms
            .store(now_ms() - 120_000, Ordering::Relaxed);
        assert_eq!(registry.stale_clients(CLIENT_TIMEOUT), vec![id]);
    }

    #[test]
    fn client_ids_are_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }
}
