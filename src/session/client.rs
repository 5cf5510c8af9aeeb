//! Gateway session client.
//!
//! Maintains the outbound session of this gateway:
//!
//! ```text
//! Disconnected ──► Connecting ──► Authenticating ──► Connected
//!       ▲               │                │               │
//!       └───────────────┴── retry delay ─┴───────────────┘
//! ```
//!
//! While connected it pings with the plcId as payload, pushes a periodic
//! state snapshot, forwards values of remote-flagged addresses and executes
//! inbound telegrams through the [`Handler`]. While not connected, forwarded
//! values are buffered (last value per address) and flushed once on the next
//! successful authentication.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::address::{LogicalAddress, LogicalKey};
use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::logging::{Component, LogContext};
use crate::core::traits::ListenerId;
use crate::gateway::config::ClientSettings;
use crate::gateway::handler::Handler;

use super::buffer::NotificationBuffer;
use super::message::{
    AuthenticationRequest, ConnectionSnapshot, GatewayMessage, PlcNotification, PlcStateQuery,
    PlcTelegram, PlcTelegramResponse, StateNotification, SystemState,
};
use super::transport::{Connector, Frame, FrameSender};

/// Client session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Connected => "Connected",
        };
        f.write_str(s)
    }
}

/// State plus the diagnostic message of the last transition.
pub type ClientStatus = (ClientState, Option<String>);

/// Forwarding target: the live transport, or the buffer while there is none.
#[derive(Default)]
struct Outbox {
    buffer: NotificationBuffer,
    tx: Option<FrameSender>,
}

struct ClientInner {
    settings: ClientSettings,
    handler: Arc<Handler>,
    connector: Arc<dyn Connector>,
    status: watch::Sender<ClientStatus>,
    outbox: Mutex<Outbox>,
    token: Mutex<Option<String>>,
    started: Instant,
    log: LogContext,
}

/// Client side of the gateway session protocol.
pub struct GatewayClient {
    inner: Arc<ClientInner>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    forwarders: Mutex<Vec<ListenerId>>,
}

impl GatewayClient {
    pub fn new(settings: ClientSettings, handler: Arc<Handler>, connector: Arc<dyn Connector>) -> Self {
        let (status, _) = watch::channel((ClientState::Disconnected, None));
        Self {
            inner: Arc::new(ClientInner {
                settings,
                handler,
                connector,
                status,
                outbox: Mutex::new(Outbox::default()),
                token: Mutex::new(None),
                started: Instant::now(),
                log: LogContext::default(),
            }),
            shutdown: Mutex::new(None),
            supervisor: Mutex::new(None),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Set the state log. Only effective before [`start`](Self::start).
    pub fn with_log(mut self, log: LogContext) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.log = log;
        }
        self
    }

    /// Register forwarders for the handler's remote addresses and start the
    /// connection supervisor. The handler must be configured.
    pub fn start(&self) -> Result<()> {
        let mut supervisor = self
            .supervisor
            .lock()
            .map_err(|_| GatewayError::InvalidState("client lock poisoned".into()))?;
        if supervisor.is_some() {
            return Err(GatewayError::InvalidState("client already started".into()));
        }

        let mut ids = Vec::new();
        for address in self.inner.handler.remote_addresses() {
            let inner = Arc::downgrade(&self.inner);
            let forwarder = move |address: &LogicalAddress, value: &Value| -> Result<()> {
                if let Some(inner) = inner.upgrade() {
                    inner.forward(&address.key, value);
                }
                Ok(())
            };
            match self.inner.handler.register_listener(
                address.resource(),
                address.action(),
                Arc::new(forwarder),
            ) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        self.inner.handler.unregister_listener(id);
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(
            plc_id = %self.inner.settings.plc_id,
            forwarded = ids.len(),
            "Remote forwarders registered"
        );
        if let Ok(mut forwarders) = self.forwarders.lock() {
            *forwarders = ids;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Ok(mut shutdown) = self.shutdown.lock() {
            *shutdown = Some(shutdown_tx);
        }
        *supervisor = Some(tokio::spawn(supervise(
            Arc::clone(&self.inner),
            shutdown_rx,
        )));
        Ok(())
    }

    /// Close the session and stop reconnecting.
    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().ok().and_then(|mut s| s.take()) {
            let _ = shutdown.send(true);
        }
        let handle = self.supervisor.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Client supervisor ended abnormally");
            }
        }
        let ids = self
            .forwarders
            .lock()
            .map(|mut f| std::mem::take(&mut *f))
            .unwrap_or_default();
        for id in ids {
            self.inner.handler.unregister_listener(id);
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.status.borrow().0
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    /// Token of the current (or last) session.
    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().ok().and_then(|t| t.clone())
    }

    /// Values waiting for the next connection.
    pub fn buffered(&self) -> usize {
        self.inner
            .outbox
            .lock()
            .map(|o| o.buffer.len())
            .unwrap_or(0)
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(handle) = supervisor.take() {
                handle.abort();
            }
        }
    }
}

/// Sleep for `duration` unless shutdown comes first. Returns `false` on
/// shutdown.
async fn pause(duration: std::time::Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}

async fn supervise(inner: Arc<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    if pause(inner.settings.initial_delay(), &mut shutdown).await {
        loop {
            let result = inner.run_session(&mut shutdown).await;
            inner.detach();
            match result {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(plc_id = %inner.settings.plc_id, error = %e, "Gateway session ended");
                    inner.set_state(ClientState::Disconnected, Some(e.to_string()));
                }
            }
            if !pause(inner.settings.retry_delay(), &mut shutdown).await {
                break;
            }
        }
    }
    inner.set_state(ClientState::Disconnected, None);
}

impl ClientInner {
    fn set_state(&self, state: ClientState, message: Option<String>) {
        self.status.send_replace((state, message.clone()));
        self.log
            .lifecycle(Component::Client, &self.settings.plc_id, state, message.as_deref());
        self.handler.record_state(
            "client",
            &self.settings.plc_id,
            &state.to_string(),
            message.as_deref(),
        );
    }

    /// One connection attempt and, if it authenticates, the session loop.
    /// `Ok` means shutdown was requested.
    async fn run_session(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.set_state(ClientState::Connecting, None);
        let channel = tokio::select! {
            channel = self.connector.connect() => channel?,
            _ = shutdown.changed() => return Ok(()),
        };
        let local_addr = channel.local_addr.clone();
        let (tx, mut rx) = channel.split();

        self.set_state(ClientState::Authenticating, None);
        let request = GatewayMessage::Authentication(self.auth_request(&local_addr));
        tx.send(Frame::Text(request.encode()?))?;

        let timeout = self.settings.auth_timeout();
        let token = tokio::select! {
            result = tokio::time::timeout(timeout, await_authentication(&mut rx, &tx)) => {
                result.map_err(|_| {
                    GatewayError::Timeout(format!("no authentication response within {:?}", timeout))
                })??
            }
            _ = shutdown.changed() => {
                let _ = tx.send(Frame::Close);
                return Ok(());
            }
        };
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }

        self.attach(&tx)?;
        self.set_state(ClientState::Connected, None);

        let ping = Frame::Ping(self.settings.plc_id.as_bytes().to_vec());
        let heartbeat_period = self.settings.heartbeat_interval();
        let snapshot_period = self.settings.snapshot_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let mut snapshot = tokio::time::interval_at(Instant::now() + snapshot_period, snapshot_period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = tx.send(Frame::Close);
                    return Ok(());
                }
                _ = heartbeat.tick() => tx.send(ping.clone())?,
                _ = snapshot.tick() => {
                    let state = GatewayMessage::StateNotification(self.state_notification(&local_addr));
                    tx.send(Frame::Text(state.encode()?))?;
                    tx.send(ping.clone())?;
                }
                frame = rx.recv() => match frame {
                    None | Some(Frame::Close) => {
                        return Err(GatewayError::Io("transport closed by server".into()));
                    }
                    Some(Frame::Ping(payload)) => tx.send(Frame::Pong(payload))?,
                    Some(Frame::Pong(_)) => {}
                    Some(Frame::Text(text)) => self.on_text(&tx, &text),
                },
            }
        }
    }

    fn on_text(self: &Arc<Self>, tx: &FrameSender, text: &str) {
        match GatewayMessage::decode(text) {
            Ok(GatewayMessage::PlcTelegram(telegram)) => {
                let inner = Arc::clone(self);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = inner.execute(telegram).await;
                    reply(&tx, response);
                });
            }
            Ok(GatewayMessage::PlcStateQuery(query)) => reply(tx, self.query(query)),
            Ok(GatewayMessage::Message(m)) => {
                tracing::info!(text = %m.text, "Message from server")
            }
            Ok(GatewayMessage::DisableMessage(_)) => {
                tracing::info!("Server disabled log forwarding")
            }
            Ok(other) => tracing::warn!(
                message_type = other.message_type(),
                "Unexpected message from server"
            ),
            Err(e) => tracing::warn!(error = %e, "Dropping message from server"),
        }
    }

    async fn execute(&self, telegram: PlcTelegram) -> PlcTelegramResponse {
        if telegram.plc_id != self.settings.plc_id {
            return PlcTelegramResponse::failed(
                telegram.sequence_id,
                format!("telegram addressed to {}", telegram.plc_id),
            );
        }
        match self
            .handler
            .send(&telegram.resource, &telegram.action, telegram.value)
            .await
        {
            Ok(value) => PlcTelegramResponse::done(telegram.sequence_id, Some(value)),
            Err(e) => PlcTelegramResponse::failed(telegram.sequence_id, e.to_string()),
        }
    }

    fn query(&self, query: PlcStateQuery) -> PlcTelegramResponse {
        if query.plc_id != self.settings.plc_id {
            return PlcTelegramResponse::failed(
                query.sequence_id,
                format!("query addressed to {}", query.plc_id),
            );
        }
        match self.handler.current_value(&query.resource, &query.action) {
            Some(value) => PlcTelegramResponse::done(query.sequence_id, Some(value)),
            None => PlcTelegramResponse::failed(
                query.sequence_id,
                format!("no value for {}/{}", query.resource, query.action),
            ),
        }
    }

    fn notification_frame(&self, key: &LogicalKey, value: &Value) -> Option<Frame> {
        let message = GatewayMessage::PlcNotification(PlcNotification {
            plc_id: self.settings.plc_id.clone(),
            resource: key.resource().to_string(),
            action: key.action().to_string(),
            value: value.clone(),
        });
        match message.encode() {
            Ok(text) => Some(Frame::Text(text)),
            Err(e) => {
                tracing::warn!(address = %key, error = %e, "Failed to encode notification");
                None
            }
        }
    }

    /// Send on the live transport, or buffer.
    fn forward(&self, key: &LogicalKey, value: &Value) {
        let Ok(mut outbox) = self.outbox.lock() else { return };
        if let Some(tx) = &outbox.tx {
            let Some(frame) = self.notification_frame(key, value) else { return };
            if tx.send(frame).is_ok() {
                return;
            }
            outbox.tx = None;
        }
        outbox.buffer.push(key.clone(), value.clone());
    }

    /// Flush the buffer onto `tx` and make it the live transport.
    fn attach(&self, tx: &FrameSender) -> Result<()> {
        let mut outbox = self
            .outbox
            .lock()
            .map_err(|_| GatewayError::InvalidState("outbox lock poisoned".into()))?;

        let buffered = outbox.buffer.drain();
        let count = buffered.len();
        let mut pending = buffered.into_iter();
        while let Some((key, value)) = pending.next() {
            let Some(frame) = self.notification_frame(&key, &value) else { continue };
            if let Err(e) = tx.send(frame) {
                outbox.buffer.push(key, value);
                for (key, value) in pending {
                    outbox.buffer.push(key, value);
                }
                return Err(e);
            }
        }
        outbox.tx = Some(tx.clone());
        if count > 0 {
            tracing::debug!(plc_id = %self.settings.plc_id, flushed = count, "Buffered notifications flushed");
        }
        Ok(())
    }

    fn detach(&self) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.tx = None;
        }
    }

    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("gateway".to_string(), self.settings.version.clone()),
            (env!("CARGO_PKG_NAME").to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ])
    }

    fn system_state(&self) -> SystemState {
        SystemState {
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            connections: self
                .handler
                .connection_statuses()
                .into_iter()
                .map(|(id, status)| ConnectionSnapshot {
                    id,
                    state: status.state,
                    message: status.message,
                })
                .collect(),
        }
    }

    fn auth_request(&self, local_addr: &Option<String>) -> AuthenticationRequest {
        AuthenticationRequest {
            plc_id: self.settings.plc_id.clone(),
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            ip_addresses: local_addr.iter().cloned().collect(),
            versions: self.versions(),
            system_state: self.system_state(),
        }
    }

    fn state_notification(&self, local_addr: &Option<String>) -> StateNotification {
        StateNotification {
            plc_id: self.settings.plc_id.clone(),
            ip_addresses: local_addr.iter().cloned().collect(),
            versions: self.versions(),
            system_state: self.system_state(),
        }
    }
}

async fn await_authentication(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Frame>,
    tx: &FrameSender,
) -> Result<String> {
    loop {
        match rx.recv().await {
            None | Some(Frame::Close) => {
                return Err(GatewayError::Io("transport closed during authentication".into()))
            }
            Some(Frame::Ping(payload)) => tx.send(Frame::Pong(payload))?,
            Some(Frame::Pong(_)) => {}
            Some(Frame::Text(text)) => match GatewayMessage::decode(&text)? {
                GatewayMessage::AuthenticationResponse(response) => {
                    return response.accepted_token().map(str::to_string)
                }
                other => tracing::debug!(
                    message_type = other.message_type(),
                    "Ignoring message before authentication"
                ),
            },
        }
    }
}

fn reply(tx: &FrameSender, response: PlcTelegramResponse) {
    let sequence_id = response.sequence_id;
    let sent = GatewayMessage::PlcTelegramResponse(response)
        .encode()
        .and_then(|text| tx.send(Frame::Text(text)));
    if let Err(e) = sent {
        tracing::debug!(sequence_id, error = %e, "Response not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::config::{CredentialDef, GatewayConfig, ServerSettings, EXAMPLE_CONFIG};
    use crate::session::message::AuthenticationResponse;
    use crate::session::pending::ResponseState;
    use crate::session::server::{GatewayServer, RemoteListener};
    use crate::session::transport::{FrameChannel, MemoryConnector};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn started_handler() -> Arc<Handler> {
        let handler = Arc::new(Handler::new(Arc::new(MemoryStore::new())));
        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();
        handler.start().await.unwrap();
        handler
    }

    fn settings() -> ClientSettings {
        ClientSettings::new("plc-0001").with_credentials("gateway", "secret")
    }

    async fn started_client(
        handler: &Arc<Handler>,
    ) -> (GatewayClient, mpsc::UnboundedReceiver<FrameChannel>) {
        let (connector, incoming) = MemoryConnector::new();
        let client = GatewayClient::new(settings(), Arc::clone(handler), Arc::new(connector));
        client.start().unwrap();
        (client, incoming)
    }

    async fn next_message(channel: &mut FrameChannel) -> GatewayMessage {
        loop {
            match channel.rx.recv().await {
                Some(Frame::Text(text)) => return GatewayMessage::decode(&text).unwrap(),
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        }
    }

    async fn next_response(channel: &mut FrameChannel) -> PlcTelegramResponse {
        loop {
            if let GatewayMessage::PlcTelegramResponse(r) = next_message(channel).await {
                return r;
            }
        }
    }

    /// Accept the next connection and answer its authentication.
    async fn accept(
        incoming: &mut mpsc::UnboundedReceiver<FrameChannel>,
        response: AuthenticationResponse,
    ) -> (FrameChannel, AuthenticationRequest) {
        let mut server = incoming.recv().await.unwrap();
        let request = match next_message(&mut server).await {
            GatewayMessage::Authentication(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        server
            .tx
            .send(Frame::Text(
                GatewayMessage::AuthenticationResponse(response).encode().unwrap(),
            ))
            .unwrap();
        (server, request)
    }

    async fn wait_for(client: &GatewayClient, state: ClientState) -> ClientStatus {
        let mut rx = client.subscribe();
        let status = rx.wait_for(|(s, _)| *s == state).await.unwrap().clone();
        status
    }

    fn text(message: GatewayMessage) -> Frame {
        Frame::Text(message.encode().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_flushed_once_on_connect() {
        let handler = started_handler().await;
        let (client, mut incoming) = started_client(&handler).await;

        handler
            .notify("Conveyor", "Running", Value::Bool(false))
            .unwrap();
        // echo of DO.1 delivers Conveyor/Running = true through the queue
        handler
            .send("Conveyor", "On", Some(Value::Bool(true)))
            .await
            .unwrap();
        handler.flush().await;
        assert_eq!(client.buffered(), 2);

        let (mut server, request) = accept(&mut incoming, AuthenticationResponse::success("tok")).await;
        assert_eq!(request.plc_id, "plc-0001");
        assert_eq!(request.username, "gateway");
        assert_eq!(request.system_state.connections.len(), 1);

        let mut flushed = Vec::new();
        for _ in 0..2 {
            match next_message(&mut server).await {
                GatewayMessage::PlcNotification(n) => flushed.push((n.key(), n.value)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            flushed,
            vec![
                (LogicalKey::new("Conveyor", "Running"), Value::Bool(true)),
                (LogicalKey::new("Conveyor", "On"), Value::Bool(true)),
            ]
        );

        wait_for(&client, ClientState::Connected).await;
        assert_eq!(client.buffered(), 0);
        assert_eq!(client.token().as_deref(), Some("tok"));

        // live forwarding; nothing from the buffer is repeated
        handler
            .notify("Conveyor", "Running", Value::Bool(false))
            .unwrap();
        match next_message(&mut server).await {
            GatewayMessage::PlcNotification(n) => {
                assert_eq!(n.key(), LogicalKey::new("Conveyor", "Running"));
                assert_eq!(n.value, Value::Bool(false));
            }
            other => panic!("unexpected {:?}", other),
        }

        client.stop().await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_authentication_retries_after_delay() {
        let handler = started_handler().await;
        let (client, mut incoming) = started_client(&handler).await;

        let (_first, _) = accept(&mut incoming, AuthenticationResponse::failure("bad password")).await;
        let (state, message) = wait_for(&client, ClientState::Disconnected).await;
        assert_eq!(state, ClientState::Disconnected);
        assert!(message.unwrap().contains("bad password"));

        let rejected_at = Instant::now();
        let no_token = AuthenticationResponse {
            state: Some(crate::session::message::AuthState::Success),
            message: None,
            auth_token: None,
        };
        let (_second, _) = accept(&mut incoming, no_token).await;
        assert!(rejected_at.elapsed() >= Duration::from_millis(30_000));
        let (_, message) = wait_for(&client, ClientState::Disconnected).await;
        assert!(message.unwrap().contains("no token"));

        let (_third, _) = accept(&mut incoming, AuthenticationResponse::success("tok")).await;
        wait_for(&client, ClientState::Connected).await;
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_timeout() {
        let handler = started_handler().await;
        let (client, mut incoming) = started_client(&handler).await;

        let mut silent = incoming.recv().await.unwrap();
        assert!(matches!(
            next_message(&mut silent).await,
            GatewayMessage::Authentication(_)
        ));
        let (_, message) = wait_for(&client, ClientState::Disconnected).await;
        assert!(message.unwrap().contains("timeout"));

        // retried after the retry delay
        let (_server, _) = accept(&mut incoming, AuthenticationResponse::success("tok")).await;
        wait_for(&client, ClientState::Connected).await;
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_carries_plc_id() {
        let handler = started_handler().await;
        let (client, mut incoming) = started_client(&handler).await;
        let (mut server, _) = accept(&mut incoming, AuthenticationResponse::success("tok")).await;
        wait_for(&client, ClientState::Connected).await;

        server.tx.send(Frame::Ping(b"liveness".to_vec())).unwrap();
        assert_eq!(server.rx.recv().await, Some(Frame::Pong(b"liveness".to_vec())));

        let connected_at = Instant::now();
        assert_eq!(server.rx.recv().await, Some(Frame::Ping(b"plc-0001".to_vec())));
        assert!(connected_at.elapsed() >= Duration::from_millis(30_000));
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_telegrams_and_queries() {
        let handler = started_handler().await;
        let (client, mut incoming) = started_client(&handler).await;
        let (mut server, _) = accept(&mut incoming, AuthenticationResponse::success("tok")).await;
        wait_for(&client, ClientState::Connected).await;

        server
            .tx
            .send(text(GatewayMessage::PlcTelegram(PlcTelegram {
                sequence_id: 5,
                plc_id: "plc-0001".into(),
                resource: "Conveyor".into(),
                action: "On".into(),
                value: None,
            })))
            .unwrap();
        let response = next_response(&mut server).await;
        assert_eq!(response.sequence_id, 5);
        assert_eq!(response.state, crate::session::message::TelegramState::Done);
        assert_eq!(response.value, Some(Value::Bool(true)));

        server
            .tx
            .send(text(GatewayMessage::PlcTelegram(PlcTelegram {
                sequence_id: 6,
                plc_id: "plc-0001".into(),
                resource: "Conveyor".into(),
                action: "Reverse".into(),
                value: Some(Value::Bool(true)),
            })))
            .unwrap();
        let response = next_response(&mut server).await;
        assert_eq!(response.sequence_id, 6);
        assert!(response.message.unwrap().contains("unknown address"));

        server
            .tx
            .send(text(GatewayMessage::PlcStateQuery(PlcStateQuery {
                sequence_id: 7,
                plc_id: "plc-0001".into(),
                resource: "Conveyor".into(),
                action: "On".into(),
            })))
            .unwrap();
        let response = next_response(&mut server).await;
        assert_eq!(response.sequence_id, 7);
        assert_eq!(response.value, Some(Value::Bool(true)));

        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_buffers_until_reconnect() {
        let handler = started_handler().await;
        let (client, mut incoming) = started_client(&handler).await;
        let (server, _) = accept(&mut incoming, AuthenticationResponse::success("tok")).await;
        wait_for(&client, ClientState::Connected).await;

        drop(server);
        let (_, message) = wait_for(&client, ClientState::Disconnected).await;
        assert!(message.unwrap().contains("closed"));

        handler
            .notify("Conveyor", "Running", Value::Bool(true))
            .unwrap();
        assert_eq!(client.buffered(), 1);

        let (mut server, _) = accept(&mut incoming, AuthenticationResponse::success("tok-2")).await;
        match next_message(&mut server).await {
            GatewayMessage::PlcNotification(n) => assert_eq!(n.value, Value::Bool(true)),
            other => panic!("unexpected {:?}", other),
        }
        wait_for(&client, ClientState::Connected).await;
        assert_eq!(client.token().as_deref(), Some("tok-2"));
        client.stop().await;
    }

    struct Watcher {
        values: mpsc::UnboundedSender<Value>,
        lost: mpsc::UnboundedSender<String>,
    }

    impl RemoteListener for Watcher {
        fn on_notification(&self, _plc_id: &str, _key: &LogicalKey, value: &Value) {
            let _ = self.values.send(value.clone());
        }

        fn handle_connection_lost(&self, plc_id: &str) {
            let _ = self.lost.send(plc_id.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_with_server() {
        let server = Arc::new(GatewayServer::from_settings(ServerSettings {
            credentials: vec![CredentialDef {
                plc_id: "plc-0001".into(),
                username: "gateway".into(),
                password: "secret".into(),
            }],
            ..Default::default()
        }));
        let (values_tx, mut values) = mpsc::unbounded_channel();
        let (lost_tx, mut lost) = mpsc::unbounded_channel();
        server.register_listener(
            "plc-0001",
            "Conveyor",
            "Running",
            Arc::new(Watcher {
                values: values_tx,
                lost: lost_tx,
            }),
        );

        let handler = started_handler().await;
        let (connector, mut incoming) = MemoryConnector::new();
        let acceptor = Arc::clone(&server);
        tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                acceptor.accept(channel);
            }
        });
        let client = GatewayClient::new(settings(), Arc::clone(&handler), Arc::new(connector));
        client.start().unwrap();
        wait_for(&client, ClientState::Connected).await;
        assert!(server.is_connected("plc-0001"));

        let outcome = server
            .send_telegram("plc-0001", "Conveyor", "On", Some(Value::Bool(true)))
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome.state, ResponseState::Done);
        assert_eq!(outcome.value, Some(Value::Bool(true)));

        // DO.1 echo reaches the server as Conveyor/Running
        assert_eq!(values.recv().await, Some(Value::Bool(true)));

        client.stop().await;
        assert_eq!(lost.recv().await.as_deref(), Some("plc-0001"));
        assert!(!server.is_connected("plc-0001"));
    }

    #[tokio::test]
    async fn test_end_to_end_over_websocket() {
        use crate::session::server::WS_PATH;
        use crate::session::transport::WsConnector;

        let server = Arc::new(GatewayServer::from_settings(ServerSettings {
            credentials: vec![CredentialDef {
                plc_id: "plc-0001".into(),
                username: "gateway".into(),
                password: "secret".into(),
            }],
            ..Default::default()
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}{}", listener.local_addr().unwrap(), WS_PATH);
        tokio::spawn(Arc::clone(&server).serve(listener));

        let handler = started_handler().await;
        let mut settings = settings();
        settings.initial_delay_ms = 10;
        settings.heartbeat_interval_ms = 50;
        let connector = Arc::new(WsConnector::new(url));
        let client = GatewayClient::new(settings, Arc::clone(&handler), connector);
        client.start().unwrap();

        let connected =
            tokio::time::timeout(Duration::from_secs(5), wait_for(&client, ClientState::Connected))
                .await;
        assert!(connected.is_ok());
        assert!(server.is_connected("plc-0001"));

        // heartbeats keep the session fresh
        tokio::time::sleep(Duration::from_millis(200)).await;
        let idle = server.session("plc-0001").unwrap().idle;
        assert!(idle < Duration::from_millis(150), "idle for {:?}", idle);

        let outcome = server
            .send_telegram("plc-0001", "Conveyor", "On", Some(Value::Bool(true)))
            .unwrap()
            .outcome_within(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.state, ResponseState::Done);
        assert_eq!(handler.current_value("Conveyor", "On"), Some(Value::Bool(true)));

        client.stop().await;
        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while server.is_connected("plc-0001") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(gone.is_ok());
    }
}
