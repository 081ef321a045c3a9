//! HTTP/WebSocket surface: router, hello handshake, and startup.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use relay_core::{ClientCommand, RejectKind, RelayLimits, ServerEvent};
use relay_store::{Database, MessageRepo, VoteRepo};
use relay_telemetry::MetricsRecorder;

use crate::auth::CredentialVerifier;
use crate::client::{self, ClientId, ClientRegistry};
use crate::coordinator::Coordinator;

/// Inbound frames waiting for the processing task.
const FRAME_QUEUE_SIZE: usize = 1024;

#[derive(Clone)]
pub struct ServerConfig {
    /// Interface to bind. All interfaces by default; the relay serves
    /// remote frontends, not just loopback.
    pub host: String,
    pub port: u16,
    pub limits: RelayLimits,
    /// Outbound frames buffered per client before drops start.
    pub send_queue_size: usize,
    /// How long a connection may sit silent before its hello is due.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            limits: RelayLimits::default(),
            send_queue_size: 256,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    registry: Arc<ClientRegistry>,
    messages: Arc<MessageRepo>,
    metrics: Arc<MetricsRecorder>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    frames: mpsc::Sender<(ClientId, String)>,
    limits: RelayLimits,
    handshake_timeout: Duration,
}

/// Running server. Dropping the handle aborts its tasks.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
    processor: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.server.abort();
        self.processor.abort();
        self.cleanup.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind and start the relay. Port 0 picks an ephemeral port; the bound
/// port is on the returned handle.
pub async fn start(
    config: ServerConfig,
    db: Database,
    verifier: Option<Arc<dyn CredentialVerifier>>,
) -> std::io::Result<ServerHandle> {
    let registry = Arc::new(ClientRegistry::new(config.send_queue_size));
    let metrics = Arc::new(MetricsRecorder::new());
    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        MessageRepo::new(db.clone()),
        VoteRepo::new(db.clone()),
        config.limits,
        metrics.clone(),
    ));

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_SIZE);

    let state = AppState {
        coordinator: coordinator.clone(),
        registry: registry.clone(),
        messages: Arc::new(MessageRepo::new(db)),
        metrics,
        verifier,
        frames: frame_tx,
        limits: config.limits,
        handshake_timeout: config.handshake_timeout,
    };

    let router = build_router(state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    let port = listener.local_addr()?.port();
    info!(host = %config.host, port, "relay listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!(error = %err, "server exited");
        }
    });

    // Single consumer: every frame in the relay goes through this task,
    // one at a time.
    let processor = tokio::spawn(process_frames(frame_rx, coordinator.clone()));
    let cleanup = tokio::spawn(async move {
        let mut interval = tokio::time::interval(client::HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            let removed = coordinator.sweep_dead_clients(client::CLIENT_TIMEOUT);
            if removed > 0 {
                debug!(removed, "swept unresponsive clients");
            }
        }
    });

    Ok(ServerHandle {
        port,
        server,
        processor,
        cleanup,
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/history", get(history_handler).delete(clear_history_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn process_frames(
    mut frames: mpsc::Receiver<(ClientId, String)>,
    coordinator: Arc<Coordinator>,
) {
    while let Some((client_id, raw)) = frames.recv().await {
        coordinator.handle_frame(&client_id, &raw);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one connection: handshake, admit, pump, tear down.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = ClientId::new();

    let identity = match perform_handshake(&mut socket, &state, &client_id).await {
        Some(identity) => identity,
        None => return,
    };

    let rx = state.registry.register(client_id.clone(), &identity);
    state.coordinator.admit(&client_id);
    state.metrics.counter_inc("connections.opened", &[], 1);

    client::handle_ws_connection(
        socket,
        client_id.clone(),
        rx,
        state.registry.clone(),
        state.frames.clone(),
    )
    .await;

    state.coordinator.handle_disconnect(&client_id);
}

/// Wait for the hello frame and resolve the connection's identity.
/// Returns None when the connection is refused; the refusal frame has
/// already been sent.
async fn perform_handshake(
    socket: &mut WebSocket,
    state: &AppState,
    client_id: &ClientId,
) -> Option<String> {
    let raw = match tokio::time::timeout(state.handshake_timeout, first_text_frame(socket)).await
    {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(_) => {
            debug!(client_id = %client_id, "handshake timed out");
            refuse(socket, RejectKind::InvalidFrame, "hello expected").await;
            return None;
        }
    };

    let hello: ClientCommand = match serde_json::from_str(&raw) {
        Ok(command) => command,
        Err(err) => {
            debug!(client_id = %client_id, error = %err, "unparseable hello");
            refuse(socket, RejectKind::InvalidFrame, "unrecognized frame").await;
            return None;
        }
    };

    let ClientCommand::Hello { identity, secret } = hello else {
        refuse(socket, RejectKind::InvalidFrame, "hello must be the first frame").await;
        return None;
    };

    if let Some(verifier) = &state.verifier {
        let (Some(identity), Some(secret)) = (identity, secret) else {
            refuse(socket, RejectKind::AuthRequired, "identity and secret required").await;
            return None;
        };
        if !verifier.verify(&identity, &secret).await {
            warn!(identity, "credential check failed");
            refuse(socket, RejectKind::AuthInvalid, "credentials rejected").await;
            return None;
        }
        return Some(identity);
    }

    // Open relay: take the claimed identity, or derive an anonymous one
    // from the connection id.
    Some(identity.unwrap_or_else(|| format!("anon-{}", &client_id.as_str()[5..13])))
}

async fn first_text_frame(socket: &mut WebSocket) -> Option<String> {
    while let Some(msg) = socket.recv().await {
        match msg.ok()? {
            WsMessage::Text(text) => return Some(text.to_string()),
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn refuse(socket: &mut WebSocket, kind: RejectKind, detail: &str) {
    let frame = ServerEvent::error(kind, detail).to_json();
    let _ = socket.send(WsMessage::Text(frame.into())).await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.messages.total() {
        Ok(total) => Json(json!({
            "status": "healthy",
            "connected_clients": state.registry.count(),
            "total_messages": total,
            "messages_accepted": state.metrics.counter_get("messages.accepted", &[]),
            "messages_rejected": state.metrics.counter_sum("messages.rejected"),
        }))
        .into_response(),
        Err(err) => {
            error!(error = %err, "health check store probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(state.limits.max_total_messages)
        .min(state.limits.max_total_messages);
    match state.messages.read_recent(limit) {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => {
            error!(error = %err, "history read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "history unavailable" })),
            )
                .into_response()
        }
    }
}

async fn clear_history_handler(State(state): State<AppState>) -> Response {
    match state.messages.clear() {
        Ok(cleared) => {
            info!(cleared, "history cleared");
            Json(json!({ "cleared": cleared })).into_response()
        }
        Err(err) => {
            error!(error = %err, "history clear failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "clear failed" })),
            )
                .into_response()
        }
    }
}
