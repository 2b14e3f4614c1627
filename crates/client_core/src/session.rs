use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use shared::{
    error::CommandError,
    protocol::{AuthMessage, ClientCommand, ServerMessage},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex, Notify},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SessionError, SetupError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Opaque duplex command/event channel toward the remote endpoint.
///
/// Implementations reconnect internally while not suspended; a subscription
/// receiver obtained from `subscribe` keeps delivering events across
/// reconnects.
#[async_trait]
pub trait Session: Send + Sync {
    /// Fire-and-forget command send.
    async fn send_command(&self, command: ClientCommand) -> Result<(), SessionError>;

    /// Sends a command and waits for its `result` frame.
    async fn send_command_await_response(
        &self,
        command: ClientCommand,
    ) -> Result<Value, SessionError>;

    /// Registers a server-initiated event stream for `request`.
    async fn subscribe(
        &self,
        request: ClientCommand,
    ) -> Result<mpsc::UnboundedReceiver<Value>, SessionError>;

    /// Bounded liveness probe. A failed probe tears the socket down so the
    /// internal reconnect loop takes over.
    async fn ping(&self) -> Result<(), SessionError>;

    /// Drops the socket and holds off reconnection until the gate installed
    /// via [`resume_after`](Session::resume_after) resolves.
    async fn suspend(&self);

    /// Installs the gate the reconnect loop must await while suspended.
    /// Expected to be called before [`suspend`](Session::suspend).
    async fn resume_after(&self, gate: oneshot::Receiver<()>);

    /// Terminal and idempotent.
    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Connected,
    Suspended,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub access_token: String,
    pub reconnect_backoff: Duration,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    /// `http(s)` base URL rewritten to the websocket endpoint.
    fn websocket_url(&self) -> Result<String, SetupError> {
        let trimmed = self.url.trim_end_matches('/');
        let parsed = Url::parse(trimmed).map_err(|err| SetupError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;
        let base = match parsed.scheme() {
            "http" => trimmed.replacen("http://", "ws://", 1),
            "https" => trimmed.replacen("https://", "wss://", 1),
            "ws" | "wss" => trimmed.to_string(),
            other => {
                return Err(SetupError::InvalidUrl {
                    url: self.url.clone(),
                    reason: format!("unsupported scheme {other:?}"),
                })
            }
        };
        Ok(format!("{base}/api/websocket"))
    }
}

/// Production [`Session`] over `tokio-tungstenite`.
pub struct WsSession {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession").finish_non_exhaustive()
    }
}

struct SessionShared {
    ws_url: String,
    access_token: String,
    reconnect_backoff: Duration,
    next_id: AtomicU64,
    inner: Mutex<SessionInner>,
    /// Wakes the supervisor out of whatever it is awaiting on close.
    closed: Notify,
    /// Forces the read loop off a socket we intend to drop.
    interrupt: Notify,
}

struct SessionInner {
    lifecycle: Lifecycle,
    writer: Option<WsWriter>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, SessionError>>>,
    subscriptions: HashMap<u64, Subscription>,
    resume_gate: Option<oneshot::Receiver<()>>,
}

struct Subscription {
    request: ClientCommand,
    tx: mpsc::UnboundedSender<Value>,
}

impl WsSession {
    pub async fn connect(config: SessionConfig) -> Result<Arc<Self>, SetupError> {
        if config.access_token.is_empty() {
            return Err(SetupError::MissingCredentials);
        }
        let ws_url = config.websocket_url()?;
        let (writer, reader) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            dial(&ws_url, &config.access_token),
        )
        .await
        .map_err(|_| SessionError::Timeout(HANDSHAKE_TIMEOUT))??;

        let shared = Arc::new(SessionShared {
            ws_url,
            access_token: config.access_token,
            reconnect_backoff: config.reconnect_backoff,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(SessionInner {
                lifecycle: Lifecycle::Connected,
                writer: Some(writer),
                pending: HashMap::new(),
                subscriptions: HashMap::new(),
                resume_gate: None,
            }),
            closed: Notify::new(),
            interrupt: Notify::new(),
        });

        tokio::spawn(supervise(Arc::clone(&shared), reader));
        Ok(Arc::new(Self { shared }))
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.shared.inner.lock().await.lifecycle
    }

    async fn teardown_socket(&self) {
        teardown_socket(&self.shared).await;
    }
}

#[async_trait]
impl Session for WsSession {
    async fn send_command(&self, command: ClientCommand) -> Result<(), SessionError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        send_with_id(&self.shared, id, &command).await
    }

    async fn send_command_await_response(
        &self,
        command: ClientCommand,
    ) -> Result<Value, SessionError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.inner.lock().await.pending.insert(id, tx);

        if let Err(err) = send_with_id(&self.shared, id, &command).await {
            self.shared.inner.lock().await.pending.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::ConnectionLost),
        }
    }

    async fn subscribe(
        &self,
        request: ClientCommand,
    ) -> Result<mpsc::UnboundedReceiver<Value>, SessionError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().await;
            inner.pending.insert(id, ack_tx);
            inner.subscriptions.insert(
                id,
                Subscription {
                    request: request.clone(),
                    tx,
                },
            );
        }

        let err = match send_with_id(&self.shared, id, &request).await {
            Ok(()) => match ack_rx.await {
                Ok(Ok(_)) => return Ok(rx),
                Ok(Err(err)) => err,
                Err(_) => SessionError::ConnectionLost,
            },
            Err(err) => err,
        };

        // A concurrent redial may have re-keyed the entry to a fresh id, so
        // removal by `id` could miss and leave it resubscribing forever.
        // Identify the entry by its channel instead: with `rx` dropped, ours
        // is the one whose sender is closed.
        drop(rx);
        let mut inner = self.shared.inner.lock().await;
        inner.pending.remove(&id);
        inner
            .subscriptions
            .retain(|_, subscription| !subscription.tx.is_closed());
        Err(err)
    }

    async fn ping(&self) -> Result<(), SessionError> {
        let probe = self.send_command_await_response(ClientCommand::Ping);
        match tokio::time::timeout(PING_TIMEOUT, probe).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                warn!(%err, "liveness probe failed, dropping socket");
                self.teardown_socket().await;
                Err(err)
            }
            Err(_) => {
                warn!("liveness probe timed out, dropping socket");
                self.teardown_socket().await;
                Err(SessionError::Timeout(PING_TIMEOUT))
            }
        }
    }

    async fn suspend(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            if matches!(inner.lifecycle, Lifecycle::Closed) {
                return;
            }
            if inner.resume_gate.is_none() {
                warn!("suspending without a resume gate installed");
            }
            inner.lifecycle = Lifecycle::Suspended;
        }
        info!("suspending session");
        self.teardown_socket().await;
    }

    async fn resume_after(&self, gate: oneshot::Receiver<()>) {
        self.shared.inner.lock().await.resume_gate = Some(gate);
    }

    async fn close(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            if matches!(inner.lifecycle, Lifecycle::Closed) {
                return;
            }
            inner.lifecycle = Lifecycle::Closed;
            for (_, tx) in inner.pending.drain() {
                let _ = tx.send(Err(SessionError::Closed));
            }
            inner.subscriptions.clear();
        }
        self.shared.closed.notify_waiters();
        self.teardown_socket().await;
        info!("session closed");
    }
}

async fn teardown_socket(shared: &SessionShared) {
    let writer = { shared.inner.lock().await.writer.take() };
    if let Some(mut writer) = writer {
        let _ = writer.close().await;
    }
    shared.interrupt.notify_waiters();
}

async fn send_with_id(
    shared: &SessionShared,
    id: u64,
    command: &ClientCommand,
) -> Result<(), SessionError> {
    let mut value =
        serde_json::to_value(command).map_err(|err| SessionError::Protocol(err.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert("id".to_string(), Value::from(id));
    }
    let text = value.to_string();

    let mut inner = shared.inner.lock().await;
    if matches!(inner.lifecycle, Lifecycle::Closed) {
        return Err(SessionError::Closed);
    }
    let Some(writer) = inner.writer.as_mut() else {
        return Err(SessionError::NotConnected);
    };
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| SessionError::Transport(err.to_string()))
}

async fn dial(ws_url: &str, access_token: &str) -> Result<(WsWriter, WsReader), SessionError> {
    let (stream, _) = connect_async(ws_url)
        .await
        .map_err(|err| SessionError::Transport(err.to_string()))?;
    let (mut writer, mut reader) = stream.split();

    loop {
        match next_server_message(&mut reader).await? {
            ServerMessage::AuthRequired { .. } => {
                let auth = serde_json::to_string(&AuthMessage::new(access_token))
                    .map_err(|err| SessionError::Protocol(err.to_string()))?;
                writer
                    .send(Message::Text(auth))
                    .await
                    .map_err(|err| SessionError::Transport(err.to_string()))?;
            }
            ServerMessage::AuthOk { ha_version } => {
                info!(?ha_version, "authenticated");
                return Ok((writer, reader));
            }
            ServerMessage::AuthInvalid { message } => {
                return Err(SessionError::AuthRejected(message));
            }
            other => debug!(?other, "ignoring frame during handshake"),
        }
    }
}

async fn next_server_message(reader: &mut WsReader) -> Result<ServerMessage, SessionError> {
    while let Some(frame) = reader.next().await {
        match frame.map_err(|err| SessionError::Transport(err.to_string()))? {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|err| SessionError::Protocol(err.to_string()))
            }
            Message::Close(_) => return Err(SessionError::ConnectionLost),
            _ => continue,
        }
    }
    Err(SessionError::ConnectionLost)
}

enum GateOutcome {
    Proceed,
    Closed,
}

enum RedialOutcome {
    Connected(WsReader),
    Suspended,
    Failed,
    Closed,
}

/// Owns the read side of the socket for the session's whole lifetime:
/// dispatches inbound frames, and after a disconnect either parks on the
/// resume gate (suspended) or redials with backoff and re-issues every
/// stored subscription.
async fn supervise(shared: Arc<SessionShared>, mut reader: WsReader) {
    'session: loop {
        read_loop(&shared, &mut reader).await;

        {
            let mut inner = shared.inner.lock().await;
            inner.writer = None;
            for (_, tx) in inner.pending.drain() {
                let _ = tx.send(Err(SessionError::ConnectionLost));
            }
            match inner.lifecycle {
                Lifecycle::Closed => return,
                Lifecycle::Suspended => {}
                _ => inner.lifecycle = Lifecycle::Connecting,
            }
        }

        loop {
            match wait_if_suspended(&shared).await {
                GateOutcome::Closed => return,
                GateOutcome::Proceed => {}
            }
            match redial_once(&shared).await {
                RedialOutcome::Closed => return,
                RedialOutcome::Suspended => continue,
                RedialOutcome::Connected(new_reader) => {
                    reader = new_reader;
                    continue 'session;
                }
                RedialOutcome::Failed => {
                    tokio::select! {
                        _ = tokio::time::sleep(shared.reconnect_backoff) => {}
                        _ = shared.closed.notified() => return,
                    }
                }
            }
        }
    }
}

async fn wait_if_suspended(shared: &Arc<SessionShared>) -> GateOutcome {
    let gate = {
        let mut inner = shared.inner.lock().await;
        match inner.lifecycle {
            Lifecycle::Closed => return GateOutcome::Closed,
            Lifecycle::Suspended => inner.resume_gate.take(),
            _ => return GateOutcome::Proceed,
        }
    };
    let Some(gate) = gate else {
        // Suspended with no gate; nothing to wait on, reconnect.
        return GateOutcome::Proceed;
    };

    info!("session suspended, waiting for resume");
    tokio::select! {
        _ = gate => {}
        _ = shared.closed.notified() => return GateOutcome::Closed,
    }

    let mut inner = shared.inner.lock().await;
    match inner.lifecycle {
        Lifecycle::Closed => GateOutcome::Closed,
        _ => {
            inner.lifecycle = Lifecycle::Connecting;
            GateOutcome::Proceed
        }
    }
}

async fn redial_once(shared: &Arc<SessionShared>) -> RedialOutcome {
    {
        let inner = shared.inner.lock().await;
        match inner.lifecycle {
            Lifecycle::Closed => return RedialOutcome::Closed,
            Lifecycle::Suspended => return RedialOutcome::Suspended,
            _ => {}
        }
    }

    let dialed = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        dial(&shared.ws_url, &shared.access_token),
    )
    .await;
    let (writer, reader) = match dialed {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            warn!(%err, "reconnect attempt failed");
            return RedialOutcome::Failed;
        }
        Err(_) => {
            warn!("reconnect attempt timed out");
            return RedialOutcome::Failed;
        }
    };

    let resubscribe = {
        let mut inner = shared.inner.lock().await;
        match inner.lifecycle {
            Lifecycle::Closed => return RedialOutcome::Closed,
            Lifecycle::Suspended => return RedialOutcome::Suspended,
            _ => {}
        }
        inner.writer = Some(writer);
        inner.lifecycle = Lifecycle::Connected;

        // Re-issue every stored subscription under a fresh id; receivers
        // held by subscribers keep working across the reconnect.
        let old_ids: Vec<u64> = inner.subscriptions.keys().copied().collect();
        let mut resubscribe = Vec::with_capacity(old_ids.len());
        for old_id in old_ids {
            if let Some(subscription) = inner.subscriptions.remove(&old_id) {
                let new_id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                resubscribe.push((new_id, subscription.request.clone()));
                inner.subscriptions.insert(new_id, subscription);
            }
        }
        resubscribe
    };

    for (id, request) in resubscribe {
        if let Err(err) = send_with_id(shared, id, &request).await {
            warn!(%err, id, "failed to re-issue subscription");
        }
    }

    info!("session reconnected");
    RedialOutcome::Connected(reader)
}

async fn read_loop(shared: &Arc<SessionShared>, reader: &mut WsReader) {
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = shared.interrupt.notified() => return,
            _ = shared.closed.notified() => return,
        };
        let Some(frame) = frame else { return };

        let message = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "dropping malformed frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => return,
            Ok(_) => continue,
            Err(err) => {
                warn!(%err, "websocket receive failed");
                return;
            }
        };
        dispatch(shared, message).await;
    }
}

async fn dispatch(shared: &Arc<SessionShared>, message: ServerMessage) {
    match message {
        ServerMessage::Result {
            id,
            success,
            result,
            error,
        } => {
            let tx = shared.inner.lock().await.pending.remove(&id);
            let Some(tx) = tx else {
                debug!(id, "result frame for unknown command id");
                return;
            };
            let outcome = if success {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(SessionError::CommandFailed(error.unwrap_or(CommandError {
                    code: "unknown".to_string(),
                    message: "command failed without error detail".to_string(),
                })))
            };
            let _ = tx.send(outcome);
        }
        ServerMessage::Event { id, event } => {
            let inner = shared.inner.lock().await;
            match inner.subscriptions.get(&id) {
                Some(subscription) => {
                    let _ = subscription.tx.send(event);
                }
                None => debug!(id, "event frame for unknown subscription"),
            }
        }
        ServerMessage::Pong { id } => {
            let tx = shared.inner.lock().await.pending.remove(&id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(Ok(Value::Null));
                }
                None => debug!(id, "pong frame for unknown command id"),
            }
        }
        ServerMessage::AuthRequired { .. }
        | ServerMessage::AuthOk { .. }
        | ServerMessage::AuthInvalid { .. } => {
            debug!("ignoring stray auth frame");
        }
        ServerMessage::Unknown => debug!("ignoring unrecognized frame"),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
