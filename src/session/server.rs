//! Gateway session server.
//!
//! Accepts gateway transports, authenticates them, keeps one session per
//! plcId and correlates telegram responses with pending requests.
//!
//! # Session rules
//!
//! - A session is created by the first liveness signal (authentication or
//!   ping) of an authenticated transport for a plcId.
//! - Last writer wins: a newer transport for the same plcId evicts the
//!   existing session.
//! - Eviction fails the plcId's pending requests with
//!   `"disconnected/timed out"`, tells its remote listeners the connection
//!   was lost, deregisters them and revokes the old transport.
//! - Pings only count when they come from a transport authenticated for the
//!   plcId in the payload.
//!
//! Over the network, gateways connect to the WebSocket endpoint [`WS_PATH`]
//! served by [`GatewayServer::serve`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::address::LogicalKey;
use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::logging::{Component, LogContext};
use crate::core::traits::ListenerId;
use crate::gateway::config::ServerSettings;
use crate::gateway::listeners::panic_message;

use super::message::{
    AuthenticationRequest, AuthenticationResponse, GatewayMessage, PlcNotification, PlcStateQuery,
    PlcTelegram, PlcTelegramResponse, StateNotification, TelegramState,
};
use super::pending::{PendingResponses, ResponseState, TelegramReceipt, DISCONNECTED};
use super::transport::{server_channel, Frame, FrameChannel, FrameSender};

/// Route of the gateway WebSocket endpoint.
pub const WS_PATH: &str = "/ws";

/// Receives notifications forwarded by one gateway.
pub trait RemoteListener: Send + Sync {
    /// A value changed on the gateway.
    fn on_notification(&self, plc_id: &str, key: &LogicalKey, value: &Value);

    /// The gateway's session went away. The listener is deregistered
    /// right after this call.
    fn handle_connection_lost(&self, plc_id: &str);
}

/// Validates gateway credentials and issues session tokens.
pub trait Authenticator: Send + Sync {
    /// Returns the token for an accepted request.
    fn authenticate(&self, request: &AuthenticationRequest) -> Result<String>;
}

/// Fixed credential table.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    credentials: HashMap<String, (String, String)>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        settings
            .credentials
            .iter()
            .fold(Self::new(), |auth, c| {
                auth.with_credential(&c.plc_id, &c.username, &c.password)
            })
    }

    pub fn with_credential(
        mut self,
        plc_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials
            .insert(plc_id.into(), (username.into(), password.into()));
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, request: &AuthenticationRequest) -> Result<String> {
        match self.credentials.get(&request.plc_id) {
            Some((username, password))
                if *username == request.username && *password == request.password =>
            {
                Ok(uuid::Uuid::new_v4().to_string())
            }
            Some(_) => Err(GatewayError::Auth(format!(
                "invalid credentials for {}",
                request.plc_id
            ))),
            None => Err(GatewayError::Auth(format!(
                "unknown plcId {}",
                request.plc_id
            ))),
        }
    }
}

struct Session {
    connection_id: u64,
    peer: String,
    tx: FrameSender,
    token: String,
    revoked: Arc<AtomicBool>,
    connected_at: DateTime<Utc>,
    last_seen: Instant,
    last_state: Option<StateNotification>,
}

/// Introspection view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub plc_id: String,
    pub connection_id: u64,
    pub peer: String,
    pub token: String,
    pub connected_at: DateTime<Utc>,
    pub idle: Duration,
    pub last_state: Option<StateNotification>,
}

struct RegisteredListener {
    id: ListenerId,
    key: LogicalKey,
    listener: Arc<dyn RemoteListener>,
}

/// Per-transport state of an accepted connection.
struct Link {
    connection_id: u64,
    peer: String,
    tx: FrameSender,
    plc_id: Option<String>,
    token: Option<String>,
    revoked: Arc<AtomicBool>,
}

/// Server side of the gateway session protocol.
pub struct GatewayServer {
    settings: ServerSettings,
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<String, Session>,
    pending: PendingResponses,
    listeners: DashMap<String, Vec<RegisteredListener>>,
    next_connection: AtomicU64,
    next_listener: AtomicU64,
    log: LogContext,
}

impl GatewayServer {
    pub fn new(settings: ServerSettings, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            settings,
            authenticator,
            sessions: DashMap::new(),
            pending: PendingResponses::new(),
            listeners: DashMap::new(),
            next_connection: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            log: LogContext::default(),
        }
    }

    /// Server authenticating against the configured credential table.
    pub fn from_settings(settings: ServerSettings) -> Self {
        let authenticator = Arc::new(StaticAuthenticator::from_settings(&settings));
        Self::new(settings, authenticator)
    }

    pub fn with_log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Bind the configured listen address, start the expiry sweep and
    /// serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.settings.listen).await?;
        tracing::info!(
            endpoint = %format!("ws://{}{}", self.settings.listen, WS_PATH),
            "Gateway server listening"
        );
        let sweeper = self.spawn_sweeper();
        let result = Arc::clone(&self).serve(listener).await;
        sweeper.abort();
        result
    }

    /// HTTP routes: the WebSocket endpoint and a health check.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(WS_PATH, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(Arc::clone(self))
    }

    /// Accept WebSocket transports from `listener`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }

    /// Serve one transport on its own task.
    pub fn accept(self: &Arc<Self>, channel: FrameChannel) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.serve_connection(channel).await })
    }

    async fn serve_connection(&self, channel: FrameChannel) {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let peer = channel.peer.clone();
        let (tx, mut rx) = channel.split();
        let mut link = Link {
            connection_id,
            peer,
            tx,
            plc_id: None,
            token: None,
            revoked: Arc::new(AtomicBool::new(false)),
        };
        tracing::debug!(connection_id, peer = %link.peer, "Transport accepted");

        while let Some(frame) = rx.recv().await {
            if link.revoked.load(Ordering::SeqCst) {
                break;
            }
            match frame {
                Frame::Close => break,
                Frame::Ping(payload) => self.on_ping(&link, payload),
                Frame::Pong(_) => {}
                Frame::Text(text) => {
                    if !self.on_text(&mut link, &text) {
                        break;
                    }
                }
            }
        }

        let _ = link.tx.send(Frame::Close);
        if let Some(plc_id) = &link.plc_id {
            self.evict_connection(plc_id, connection_id, "disconnected");
        }
        tracing::debug!(connection_id, peer = %link.peer, "Transport closed");
    }

    fn on_ping(&self, link: &Link, payload: Vec<u8>) {
        let claimed = String::from_utf8_lossy(&payload).into_owned();
        match &link.plc_id {
            Some(plc_id) if *plc_id == claimed => {
                self.adopt(plc_id, link);
                let _ = link.tx.send(Frame::Pong(payload));
            }
            _ => tracing::warn!(
                connection_id = link.connection_id,
                claimed = %claimed,
                "Ignoring ping not matching the authenticated plcId"
            ),
        }
    }

    /// Returns `false` when the transport must be closed.
    fn on_text(&self, link: &mut Link, text: &str) -> bool {
        let message = match GatewayMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(connection_id = link.connection_id, error = %e, "Dropping message");
                return true;
            }
        };

        match message {
            GatewayMessage::Authentication(request) => return self.on_authentication(link, request),
            other if link.plc_id.is_none() => {
                tracing::warn!(
                    connection_id = link.connection_id,
                    message_type = other.message_type(),
                    "Message before authentication dropped"
                );
            }
            GatewayMessage::PlcNotification(notification) => {
                self.on_notification(link, notification)
            }
            GatewayMessage::PlcTelegramResponse(response) => self.on_response(response),
            GatewayMessage::StateNotification(state) => self.on_state(link, state),
            GatewayMessage::Message(m) => tracing::info!(
                plc_id = ?link.plc_id,
                level = m.level.as_deref().unwrap_or("info"),
                text = %m.text,
                "Gateway log message"
            ),
            GatewayMessage::DisableMessage(_) => {
                tracing::info!(plc_id = ?link.plc_id, "Gateway disabled log forwarding")
            }
            other => tracing::warn!(
                plc_id = ?link.plc_id,
                message_type = other.message_type(),
                "Unexpected message from gateway"
            ),
        }
        true
    }

    fn on_authentication(&self, link: &mut Link, request: AuthenticationRequest) -> bool {
        match self.authenticator.authenticate(&request) {
            Ok(token) => {
                if let Some(previous) = link.plc_id.as_ref().filter(|p| **p != request.plc_id) {
                    self.evict_connection(previous, link.connection_id, "re-authenticated");
                }
                link.plc_id = Some(request.plc_id.clone());
                link.token = Some(token.clone());
                self.adopt(&request.plc_id, link);
                self.send_to(link, GatewayMessage::AuthenticationResponse(
                    AuthenticationResponse::success(token),
                ));
                true
            }
            Err(e) => {
                self.log.lifecycle(
                    Component::Session,
                    &request.plc_id,
                    "Rejected",
                    Some(&e.to_string()),
                );
                self.send_to(link, GatewayMessage::AuthenticationResponse(
                    AuthenticationResponse::failure(e.to_string()),
                ));
                false
            }
        }
    }

    fn send_to(&self, link: &Link, message: GatewayMessage) {
        match message.encode() {
            Ok(text) => {
                let _ = link.tx.send(Frame::Text(text));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode message"),
        }
    }

    /// Liveness signal from an authenticated transport: refresh its session
    /// or make it the session of `plc_id`.
    fn adopt(&self, plc_id: &str, link: &Link) {
        let token = link.token.clone().unwrap_or_default();
        let refreshed = match self.sessions.get_mut(plc_id) {
            Some(mut session) if session.connection_id == link.connection_id => {
                session.last_seen = Instant::now();
                session.token = token.clone();
                true
            }
            _ => false,
        };
        if refreshed {
            return;
        }

        self.evict(plc_id, "replaced by a newer connection");
        self.sessions.insert(
            plc_id.to_string(),
            Session {
                connection_id: link.connection_id,
                peer: link.peer.clone(),
                tx: link.tx.clone(),
                token,
                revoked: Arc::clone(&link.revoked),
                connected_at: Utc::now(),
                last_seen: Instant::now(),
                last_state: None,
            },
        );
        self.log
            .lifecycle(Component::Session, plc_id, "Connected", Some(&link.peer));
    }

    fn on_notification(&self, link: &Link, notification: PlcNotification) {
        if link.plc_id.as_deref() != Some(notification.plc_id.as_str()) {
            tracing::warn!(
                connection_id = link.connection_id,
                plc_id = %notification.plc_id,
                "Notification for a plcId this transport is not authenticated for"
            );
            return;
        }

        let key = notification.key();
        let targets: Vec<Arc<dyn RemoteListener>> = self
            .listeners
            .get(&notification.plc_id)
            .map(|list| {
                list.iter()
                    .filter(|r| r.key == key)
                    .map(|r| Arc::clone(&r.listener))
                    .collect()
            })
            .unwrap_or_default();

        if targets.is_empty() {
            tracing::debug!(plc_id = %notification.plc_id, address = %key, "No listener, notification dropped");
            return;
        }
        for listener in targets {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_notification(&notification.plc_id, &key, &notification.value)
            }));
            if let Err(panic) = result {
                self.log.listener_failed(&key, panic_message(&panic));
            }
        }
    }

    fn on_response(&self, response: PlcTelegramResponse) {
        let state = match response.state {
            TelegramState::Done => ResponseState::Done,
            TelegramState::Failed => ResponseState::Failed,
        };
        if !self
            .pending
            .complete(response.sequence_id, state, response.message, response.value)
        {
            tracing::warn!(
                sequence_id = response.sequence_id,
                "Response for unknown sequence id dropped"
            );
        }
    }

    fn on_state(&self, link: &Link, state: StateNotification) {
        let Some(plc_id) = &link.plc_id else { return };
        if *plc_id != state.plc_id {
            tracing::warn!(plc_id = %state.plc_id, "State notification for a foreign plcId dropped");
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(plc_id) {
            if session.connection_id == link.connection_id {
                session.last_state = Some(state);
            }
        }
    }

    /// Send a telegram; the receipt resolves with the gateway's response.
    pub fn send_telegram(
        &self,
        plc_id: &str,
        resource: &str,
        action: &str,
        value: Option<Value>,
    ) -> Result<TelegramReceipt> {
        self.dispatch(plc_id, LogicalKey::new(resource, action), |sequence_id| {
            GatewayMessage::PlcTelegram(PlcTelegram {
                sequence_id,
                plc_id: plc_id.to_string(),
                resource: resource.to_string(),
                action: action.to_string(),
                value,
            })
        })
    }

    /// Ask the gateway for the last known value of an address.
    pub fn query_state(&self, plc_id: &str, resource: &str, action: &str) -> Result<TelegramReceipt> {
        self.dispatch(plc_id, LogicalKey::new(resource, action), |sequence_id| {
            GatewayMessage::PlcStateQuery(PlcStateQuery {
                sequence_id,
                plc_id: plc_id.to_string(),
                resource: resource.to_string(),
                action: action.to_string(),
            })
        })
    }

    fn dispatch(
        &self,
        plc_id: &str,
        key: LogicalKey,
        build: impl FnOnce(u64) -> GatewayMessage,
    ) -> Result<TelegramReceipt> {
        let (tx, connection_id) = self
            .sessions
            .get(plc_id)
            .map(|s| (s.tx.clone(), s.connection_id))
            .ok_or_else(|| GatewayError::NotConnected(plc_id.to_string()))?;

        let receipt = self.pending.insert(plc_id, key);
        let sequence_id = receipt.sequence_id;
        let sent = build(sequence_id)
            .encode()
            .and_then(|text| tx.send(Frame::Text(text)));
        if let Err(e) = sent {
            self.pending
                .complete(sequence_id, ResponseState::Failed, Some(e.to_string()), None);
            return Err(e);
        }
        self.pending.mark_sent(sequence_id);

        // evicted between lookup and registration
        let current = self
            .sessions
            .get(plc_id)
            .is_some_and(|s| s.connection_id == connection_id);
        if !current {
            self.pending.complete(
                sequence_id,
                ResponseState::Failed,
                Some(DISCONNECTED.to_string()),
                None,
            );
        }
        Ok(receipt)
    }

    /// Route notifications of `(resource, action)` from `plc_id` to
    /// `listener`.
    pub fn register_listener(
        &self,
        plc_id: &str,
        resource: &str,
        action: &str,
        listener: Arc<dyn RemoteListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(plc_id.to_string())
            .or_default()
            .push(RegisteredListener {
                id,
                key: LogicalKey::new(resource, action),
                listener,
            });
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut removed = false;
        for mut list in self.listeners.iter_mut() {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
        }
        self.listeners.retain(|_, list| !list.is_empty());
        removed
    }

    /// Listeners registered for `plc_id`.
    pub fn listener_count(&self, plc_id: &str) -> usize {
        self.listeners.get(plc_id).map(|l| l.len()).unwrap_or(0)
    }

    /// Evict sessions without liveness for longer than the session timeout.
    /// Returns the evicted plcIds.
    pub fn sweep_expired(&self) -> Vec<String> {
        let timeout = self.settings.session_timeout();
        let expired: Vec<(String, u64)> = self
            .sessions
            .iter()
            .filter(|s| s.last_seen.elapsed() > timeout)
            .map(|s| (s.key().clone(), s.connection_id))
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for (plc_id, connection_id) in expired {
            if self.evict_connection(&plc_id, connection_id, "timed out") {
                evicted.push(plc_id);
            }
        }
        evicted
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every sweep interval
    /// until the server is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::downgrade(self);
        let period = self.settings.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else { break };
                let evicted = server.sweep_expired();
                if !evicted.is_empty() {
                    tracing::info!(?evicted, "Expired sessions evicted");
                }
            }
        })
    }

    /// Close the session of `plc_id`.
    pub fn disconnect(&self, plc_id: &str) -> bool {
        self.evict(plc_id, "disconnected by server")
    }

    fn evict(&self, plc_id: &str, reason: &str) -> bool {
        match self.sessions.remove(plc_id) {
            Some((_, session)) => {
                self.retire(plc_id, session, reason);
                true
            }
            None => false,
        }
    }

    fn evict_connection(&self, plc_id: &str, connection_id: u64, reason: &str) -> bool {
        match self
            .sessions
            .remove_if(plc_id, |_, s| s.connection_id == connection_id)
        {
            Some((_, session)) => {
                self.retire(plc_id, session, reason);
                true
            }
            None => false,
        }
    }

    fn retire(&self, plc_id: &str, session: Session, reason: &str) {
        session.revoked.store(true, Ordering::SeqCst);
        let _ = session.tx.send(Frame::Close);

        let failed = self.pending.fail_for_plc(plc_id, DISCONNECTED);
        let listeners = self
            .listeners
            .remove(plc_id)
            .map(|(_, list)| list)
            .unwrap_or_default();
        for registered in &listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                registered.listener.handle_connection_lost(plc_id)
            }));
            if let Err(panic) = result {
                self.log.listener_failed(&registered.key, panic_message(&panic));
            }
        }

        tracing::info!(
            plc_id,
            connection_id = session.connection_id,
            failed_requests = failed,
            listeners = listeners.len(),
            reason,
            "Session evicted"
        );
        self.log
            .lifecycle(Component::Session, plc_id, "Disconnected", Some(reason));
    }

    pub fn is_connected(&self, plc_id: &str) -> bool {
        self.sessions.contains_key(plc_id)
    }

    pub fn session(&self, plc_id: &str) -> Option<SessionInfo> {
        self.sessions.get(plc_id).map(|s| Self::info(s.key(), &s))
    }

    /// Snapshot of every session, ordered by plcId.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|s| Self::info(s.key(), s.value()))
            .collect();
        sessions.sort_by(|a, b| a.plc_id.cmp(&b.plc_id));
        sessions
    }

    fn info(plc_id: &str, session: &Session) -> SessionInfo {
        SessionInfo {
            plc_id: plc_id.to_string(),
            connection_id: session.connection_id,
            peer: session.peer.clone(),
            token: session.token.clone(),
            connected_at: session.connected_at,
            idle: session.last_seen.elapsed(),
            last_state: session.last_state.clone(),
        }
    }

    /// Outstanding requests.
    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(server): State<Arc<GatewayServer>>,
) -> impl IntoResponse {
    let max_message_size = server.settings.max_message_size;
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let channel = server_channel(socket, peer.to_string());
            server.serve_connection(channel).await;
        })
}

/// Health check endpoint
async fn health_handler(State(server): State<Arc<GatewayServer>>) -> impl IntoResponse {
    let sessions: Vec<String> = server.sessions().into_iter().map(|s| s.plc_id).collect();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "pending": server.pending().len(),
    }))
}
