//! Push transport: WebSocket server for operators.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/ws` | WebSocket upgrade |
//! | `GET`  | `/health` | Health check (version, connected clients, dropped frames) |
//!
//! # Protocol
//!
//! Every frame is a JSON text message tagged by `type`. The first client
//! message must be a handshake, sent within `handshake_timeout_secs`:
//!
//! ```json
//! {"type": "handshake", "device_id": "laptop", "auth_tokens": "viewer-token,operator-token"}
//! ```
//!
//! Each token is checked against the status-subscriber and command-publisher
//! sets. The reply names the granted roles:
//!
//! ```json
//! {"type": "handshake", "handshake_string": "Authorized for: recv_status,send_cmd"}
//! ```
//!
//! | Situation | Reply | Close code |
//! |-----------|-------|------------|
//! | no valid token | `handshake_string: "Unauthorized"` | 1008 |
//! | first message is not a handshake | `error_string: "Handshake required"` | 1008 |
//! | no handshake before the timeout | none | 1008 |
//! | `max_clients` already connected | none | 1013 |
//!
//! Subscribers then receive one `{"type": "status", ...}` per control tick.
//! Publishers send `{"type": "command", "command_string": "capture/pause"}`,
//! which is acknowledged with `{"type": "ack", ...}` and forwarded at once.
//!
//! Each client has a bounded outbound buffer of [`CLIENT_BUFFER`] frames.
//! A client that stops reading loses the frames that do not fit; the hub
//! counts them in [`PushHub::dropped_messages`].

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::PushConfig;
use crate::control::submit;
use crate::error::{Error, Result};
use crate::models::{RemoteCommand, StatusSnapshot, Transport};
use crate::shutdown::Shutdown;

// ============ Tokens ============

/// Roles granted by a handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Roles {
    pub recv_status: bool,
    pub send_cmd: bool,
}

impl Roles {
    pub fn describe(&self) -> String {
        let mut roles = Vec::new();
        if self.recv_status {
            roles.push("recv_status");
        }
        if self.send_cmd {
            roles.push("send_cmd");
        }
        roles.join(",")
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    status: HashSet<String>,
    command: HashSet<String>,
}

impl TokenRegistry {
    pub fn new(
        status: impl IntoIterator<Item = String>,
        command: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            status: status.into_iter().filter(|t| !t.is_empty()).collect(),
            command: command.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    /// Inline tokens plus those in `tokens_file`.
    pub fn from_config(cfg: &PushConfig) -> Result<Self> {
        let mut registry = Self::new(cfg.status_tokens.clone(), cfg.command_tokens.clone());
        if let Some(path) = &cfg.tokens_file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read tokens file {}: {}", path.display(), e))
            })?;
            registry.add_tokens_file(&text)?;
        }
        if registry.status.is_empty() && registry.command.is_empty() {
            return Err(Error::Config("push transport has no tokens".into()));
        }
        Ok(registry)
    }

    /// Lines of `recv_key,send_key,client_id`; `#` starts a comment.
    fn add_tokens_file(&mut self, text: &str) -> Result<()> {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 2 {
                return Err(Error::Config(format!(
                    "tokens file line {}: expected recv_key,send_key,client_id",
                    lineno + 1
                )));
            }
            if !parts[0].is_empty() {
                self.status.insert(parts[0].to_string());
            }
            if !parts[1].is_empty() {
                self.command.insert(parts[1].to_string());
            }
        }
        Ok(())
    }

    /// Check a comma-separated token list.
    pub fn authorize(&self, tokens: &str) -> Result<Roles> {
        let mut roles = Roles::default();
        for token in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            roles.recv_status |= self.status.contains(token);
            roles.send_cmd |= self.command.contains(token);
        }
        if roles == Roles::default() {
            Err(Error::Auth("no valid token".into()))
        } else {
            Ok(roles)
        }
    }
}

// ============ Messages ============

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake {
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        auth_tokens: String,
    },
    Command {
        command_string: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Handshake {
        handshake_string: String,
    },
    Status {
        device_id: String,
        time: String,
        snapshot: StatusSnapshot,
    },
    Ack {
        command_string: String,
    },
    Error {
        error_string: String,
    },
}

impl ServerMessage {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error_string":"serialization failed: {}"}}"#, e)
        })
    }
}

// ============ Hub ============

/// Outbound frames buffered per client before new ones are dropped.
pub const CLIENT_BUFFER: usize = 16;

struct ClientConnection {
    peer: String,
    roles: Roles,
    tx: mpsc::Sender<String>,
}

/// Connected, authenticated clients.
pub struct PushHub {
    device_id: String,
    tokens: TokenRegistry,
    max_clients: usize,
    handshake_timeout: Duration,
    commands: mpsc::Sender<RemoteCommand>,
    clients: RwLock<HashMap<Uuid, ClientConnection>>,
    dropped: AtomicU64,
}

impl PushHub {
    pub fn new(
        device_id: impl Into<String>,
        tokens: TokenRegistry,
        max_clients: usize,
        handshake_timeout: Duration,
        commands: mpsc::Sender<RemoteCommand>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            tokens,
            max_clients: max_clients.max(1),
            handshake_timeout,
            commands,
            clients: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        device_id: &str,
        cfg: &PushConfig,
        commands: mpsc::Sender<RemoteCommand>,
    ) -> Result<Self> {
        Ok(Self::new(
            device_id,
            TokenRegistry::from_config(cfg)?,
            cfg.max_clients,
            Duration::from_secs(cfg.handshake_timeout_secs.max(1)),
            commands,
        ))
    }

    async fn register(
        &self,
        peer: String,
        roles: Roles,
    ) -> Option<(Uuid, mpsc::Receiver<String>)> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.max_clients {
            return None;
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        clients.insert(id, ClientConnection { peer, roles, tx });
        tracing::info!(connection_id = %id, roles = %roles.describe(), clients = clients.len(), "Push client connected");
        Some((id, rx))
    }

    async fn unregister(&self, id: &Uuid) {
        let mut clients = self.clients.write().await;
        if let Some(conn) = clients.remove(id) {
            tracing::info!(connection_id = %id, peer = %conn.peer, "Push client disconnected");
        }
    }

    async fn send_to(&self, id: &Uuid, message: &ServerMessage) {
        let clients = self.clients.read().await;
        if let Some(conn) = clients.get(id) {
            self.offer(id, conn, message.to_json());
        }
    }

    /// Queue `json` for one client without waiting. Returns whether it fit.
    fn offer(&self, id: &Uuid, conn: &ClientConnection, json: String) -> bool {
        match conn.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(connection_id = %id, peer = %conn.peer, dropped, "Client buffer full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %id, "Client writer gone");
                false
            }
        }
    }

    /// Frames dropped because a client's buffer was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Send `snapshot` to every status subscriber. Returns how many got it.
    pub async fn broadcast_status(&self, snapshot: &StatusSnapshot) -> usize {
        let json = ServerMessage::Status {
            device_id: self.device_id.clone(),
            time: snapshot.taken_at.to_rfc3339(),
            snapshot: snapshot.clone(),
        }
        .to_json();

        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (id, conn) in clients.iter().filter(|(_, c)| c.roles.recv_status) {
            if self.offer(id, conn, json.clone()) {
                delivered += 1;
            }
        }
        tracing::debug!(delivered, "Status broadcast");
        delivered
    }

    /// Drop every client; their connections close with a normal close frame.
    pub async fn close_all(&self) {
        self.clients.write().await.clear();
    }
}

// ============ Server ============

#[derive(Clone)]
struct PushState {
    hub: Arc<PushHub>,
    shutdown: Shutdown,
}

pub fn router(hub: Arc<PushHub>, shutdown: Shutdown) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(handle_ws))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(PushState { hub, shutdown })
}

/// Serve on `listener` until shutdown is requested.
pub async fn serve(listener: TcpListener, hub: Arc<PushHub>, shutdown: Shutdown) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Push transport listening");
    }
    let app = router(hub.clone(), shutdown.clone());
    let stop = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        stop.requested().await;
        hub.close_all().await;
    })
    .await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    clients: usize,
    dropped_frames: u64,
}

async fn handle_health(State(state): State<PushState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        clients: state.hub.client_count().await,
        dropped_frames: state.hub.dropped_messages(),
    })
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<std::net::SocketAddr>,
    State(state): State<PushState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer.to_string(), state))
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_json(sender: &mut WsSender, message: &ServerMessage) -> bool {
    sender
        .send(Message::Text(message.to_json().into()))
        .await
        .is_ok()
}

async fn close_with(sender: &mut WsSender, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

/// Next text frame, skipping pings. `None` once the peer is gone.
async fn next_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn handle_socket(socket: WebSocket, peer: String, state: PushState) {
    let hub = state.hub;
    let (mut sender, mut receiver) = socket.split();

    // Handshake
    let first = match tokio::time::timeout(hub.handshake_timeout, next_text(&mut receiver)).await {
        Ok(Some(text)) => text,
        Ok(None) => return,
        Err(_) => {
            tracing::info!(%peer, "Push client sent no handshake in time");
            close_with(&mut sender, close_code::POLICY, "Handshake timeout").await;
            return;
        }
    };
    let roles = match serde_json::from_str::<ClientMessage>(&first) {
        Ok(ClientMessage::Handshake {
            device_id,
            auth_tokens,
        }) => match hub.tokens.authorize(&auth_tokens) {
            Ok(roles) => {
                tracing::debug!(%peer, client = ?device_id, "Push handshake accepted");
                roles
            }
            Err(e) => {
                tracing::warn!(%peer, client = ?device_id, error = %e, "Push handshake rejected");
                let reply = ServerMessage::Handshake {
                    handshake_string: "Unauthorized".to_string(),
                };
                send_json(&mut sender, &reply).await;
                close_with(&mut sender, close_code::POLICY, "Unauthorized").await;
                return;
            }
        },
        _ => {
            let reply = ServerMessage::Error {
                error_string: "Handshake required".to_string(),
            };
            send_json(&mut sender, &reply).await;
            close_with(&mut sender, close_code::POLICY, "Handshake required").await;
            return;
        }
    };

    let Some((conn_id, mut rx)) = hub.register(peer.clone(), roles).await else {
        tracing::warn!(%peer, max_clients = hub.max_clients, "Push client limit reached");
        close_with(&mut sender, close_code::AGAIN, "Too many clients").await;
        return;
    };

    let reply = ServerMessage::Handshake {
        handshake_string: format!("Authorized for: {}", roles.describe()),
    };
    if !send_json(&mut sender, &reply).await {
        hub.unregister(&conn_id).await;
        return;
    }

    // Outbound: everything queued for this client, then a normal close
    // once the hub drops it.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                return;
            }
        }
        close_with(&mut sender, close_code::NORMAL, "Server shutting down").await;
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            _ = state.shutdown.requested() => {
                hub.unregister(&conn_id).await;
                let _ = tokio::time::timeout(Duration::from_secs(1), &mut send_task).await;
                return;
            }
            incoming = next_text(&mut receiver) => {
                let Some(text) = incoming else { break };
                let reply = handle_client_text(&hub, roles, &text);
                hub.send_to(&conn_id, &reply).await;
            }
        }
    }

    hub.unregister(&conn_id).await;
    send_task.abort();
}

fn handle_client_text(hub: &PushHub, roles: Roles, text: &str) -> ServerMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Command { command_string }) => {
            if !roles.send_cmd {
                return ServerMessage::Error {
                    error_string: "Not authorized to send commands".to_string(),
                };
            }
            match submit(&hub.commands, &command_string, Transport::Push) {
                Ok(_) => ServerMessage::Ack { command_string },
                Err(e) => ServerMessage::Error {
                    error_string: e.to_string(),
                },
            }
        }
        Ok(ClientMessage::Handshake { .. }) => ServerMessage::Error {
            error_string: "Already authorized".to_string(),
        },
        Err(e) => ServerMessage::Error {
            error_string: format!("Unrecognized message: {}", e),
        },
    }
}
