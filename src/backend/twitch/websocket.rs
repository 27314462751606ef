use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::dedup::MessageDeduplicator;
use super::dispatch::guarded;
use super::error::{Result, TwitchError};
use super::messages::{InboundMessage, MessageType, Notification, Session, Subscription};

pub const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

pub const DEFAULT_WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF_EXPONENT: u32 = 6;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// How `reconnect` sequences the old and the new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectOrder {
    /// Stop the old read loop before dialing the new URL
    #[default]
    TearDownFirst,
    /// Keep the old loop delivering until the new welcome arrives
    DialFirst,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    /// Bound on the wait for the welcome frame
    pub welcome_timeout: Duration,
    /// Added to the server keepalive interval to form the read deadline
    pub keepalive_margin: Duration,
    /// Keepalive interval to request from the server (10..=600 seconds)
    pub keepalive_timeout: Option<u64>,
    pub reconnect_order: ReconnectOrder,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: EVENTSUB_WS_URL.to_string(),
            welcome_timeout: DEFAULT_WELCOME_TIMEOUT,
            keepalive_margin: DEFAULT_KEEPALIVE_MARGIN,
            keepalive_timeout: None,
            reconnect_order: ReconnectOrder::default(),
        }
    }
}

/// Application callbacks for a WebSocket session.
///
/// Callbacks run on the read loop. A slow callback delays the next read and
/// can cost the connection its keepalive deadline, so hand heavy work off.
pub trait SessionHandler: Send + Sync {
    fn on_keepalive(&self) {}

    fn on_notification(&self, _notification: Notification) {}

    /// The server asked the client to move to `url`. Call
    /// `SessionClient::reconnect` from outside the callback to follow it.
    fn on_reconnect(&self, _url: &str) {}

    fn on_revocation(&self, _subscription: Subscription) {}

    fn on_error(&self, _error: TwitchError) {}
}

/// Events forwarded by the channel-backed handler
#[derive(Debug)]
pub enum SessionEvent {
    Keepalive,
    Notification(Notification),
    Reconnect(String),
    Revocation(Subscription),
    Error(TwitchError),
}

impl SessionHandler for mpsc::UnboundedSender<SessionEvent> {
    fn on_keepalive(&self) {
        let _ = self.send(SessionEvent::Keepalive);
    }

    fn on_notification(&self, notification: Notification) {
        let _ = self.send(SessionEvent::Notification(notification));
    }

    fn on_reconnect(&self, url: &str) {
        let _ = self.send(SessionEvent::Reconnect(url.to_string()));
    }

    fn on_revocation(&self, subscription: Subscription) {
        let _ = self.send(SessionEvent::Revocation(subscription));
    }

    fn on_error(&self, error: TwitchError) {
        let _ = self.send(SessionEvent::Error(error));
    }
}

/// A running read loop and the means to stop it
struct ReadLoop {
    generation: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ReadLoop {
    /// Signal the loop and wait until it has fully exited.
    async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            log::error!("Read loop {} ended abnormally: {}", self.generation, e);
        }
    }
}

/// Shared state for the session
struct SharedState {
    status: ConnectionState,
    session: Option<Session>,
    reconnect_url: Option<String>,
    generation: u64,
    reader: Option<ReadLoop>,
}

/// Puts a pending connect/reconnect back to a settled state if it fails or
/// its future is dropped.
struct PendingGuard<'a> {
    state: &'a RwLock<SharedState>,
    pending: ConnectionState,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(state: &'a RwLock<SharedState>, pending: ConnectionState) -> Self {
        Self {
            state,
            pending,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.write();
        if state.status == self.pending {
            if state.reader.is_some() {
                state.status = ConnectionState::Connected;
            } else {
                state.status = ConnectionState::Disconnected;
                state.session = None;
            }
        }
    }
}

/// One logical EventSub WebSocket session.
///
/// All methods take `&self` and are safe to call concurrently. A second
/// `connect` while one is in flight fails with `AlreadyConnecting`; `connect`
/// on a live session returns its id. `close` and `reconnect` wait for the
/// previous read loop to exit before they return or dial.
pub struct SessionClient {
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    deduplicator: Option<Arc<MessageDeduplicator>>,
    state: Arc<RwLock<SharedState>>,
}

impl SessionClient {
    pub fn new(config: SessionConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            config,
            handler,
            deduplicator: None,
            state: Arc::new(RwLock::new(SharedState {
                status: ConnectionState::Disconnected,
                session: None,
                reconnect_url: None,
                generation: 0,
                reader: None,
            })),
        }
    }

    /// Drop notifications whose message id was already delivered
    pub fn with_deduplicator(mut self, deduplicator: Arc<MessageDeduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    /// Dial the configured URL, complete the welcome handshake and start
    /// the read loop. Returns the session id.
    ///
    /// Dropping the returned future aborts the dial or the handshake wait.
    pub async fn connect(&self) -> Result<String> {
        {
            let mut state = self.state.write();
            match state.status {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(TwitchError::AlreadyConnecting);
                }
                ConnectionState::Connected => {
                    return state
                        .session
                        .as_ref()
                        .map(|session| session.id.clone())
                        .ok_or(TwitchError::NotConnected);
                }
                ConnectionState::Disconnected | ConnectionState::Closed => {}
            }
            state.status = ConnectionState::Connecting;
        }

        let guard = PendingGuard::new(&self.state, ConnectionState::Connecting);
        let url = self.initial_url()?;
        let (ws, session) = self.dial(&url).await?;
        guard.disarm();
        self.install(ws, session).await
    }

    /// `connect`, retrying transport failures with exponential backoff
    /// (1s, 2s, 4s ... 64s). Protocol, config and state errors return at once.
    pub async fn connect_with_backoff(&self, max_retries: u32) -> Result<String> {
        let base_delay = Duration::from_secs(1);
        let mut retries = 0;

        loop {
            match self.connect().await {
                Ok(session_id) => return Ok(session_id),
                Err(e) if !e.is_transport() => return Err(e),
                Err(e) => {
                    retries += 1;
                    if retries > max_retries {
                        log::error!("Giving up after {} connection attempts: {}", retries, e);
                        return Err(e);
                    }
                    let delay = base_delay * 2_u32.pow((retries - 1).min(MAX_BACKOFF_EXPONENT));
                    log::warn!("Connection failed ({}), retrying in {:?}", e, delay);
                    sleep(delay).await;
                }
            }
        }
    }

    /// Move the session to `url`, normally the one announced by a
    /// `session_reconnect` frame. Returns the session id.
    pub async fn reconnect(&self, url: &str) -> Result<String> {
        let previous = {
            let mut state = self.state.write();
            match state.status {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(TwitchError::AlreadyConnecting);
                }
                ConnectionState::Closed => return Err(TwitchError::Closed),
                ConnectionState::Connected | ConnectionState::Disconnected => {}
            }
            state.status = ConnectionState::Reconnecting;
            match self.config.reconnect_order {
                ReconnectOrder::TearDownFirst => {
                    // The old session stops receiving now; nothing may subscribe on it
                    state.session = None;
                    state.reader.take()
                }
                ReconnectOrder::DialFirst => None,
            }
        };

        let guard = PendingGuard::new(&self.state, ConnectionState::Reconnecting);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        log::info!("Reconnecting EventSub session to {}", url);
        let (ws, session) = self.dial(url).await?;
        guard.disarm();
        self.install(ws, session).await
    }

    /// Stop the read loop and wait for it to exit. No callback runs after
    /// this returns. Safe to call any number of times.
    pub async fn close(&self) {
        let reader = {
            let mut state = self.state.write();
            state.status = ConnectionState::Closed;
            state.session = None;
            state.reconnect_url = None;
            state.reader.take()
        };

        if let Some(reader) = reader {
            log::info!("Closing EventSub session");
            reader.shutdown().await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().status
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.read().session.as_ref().map(|s| s.id.clone())
    }

    pub fn session(&self) -> Option<Session> {
        self.state.read().session.clone()
    }

    /// URL from the most recent reconnect frame, if not yet followed
    pub fn pending_reconnect_url(&self) -> Option<String> {
        self.state.read().reconnect_url.clone()
    }

    fn initial_url(&self) -> Result<String> {
        let Some(seconds) = self.config.keepalive_timeout else {
            return Ok(self.config.url.clone());
        };
        if !(10..=600).contains(&seconds) {
            return Err(TwitchError::Config(format!(
                "keepalive timeout must be between 10 and 600 seconds, got {}",
                seconds
            )));
        }
        let separator = if self.config.url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}keepalive_timeout_seconds={}",
            self.config.url, separator, seconds
        ))
    }

    /// Open the socket and wait for the welcome frame
    async fn dial(&self, url: &str) -> Result<(WsStream, Session)> {
        let (mut ws, _) = connect_async(url).await?;

        let outcome = match timeout(self.config.welcome_timeout, await_welcome(&mut ws)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TwitchError::Transport(format!(
                "no welcome message within {:?}",
                self.config.welcome_timeout
            ))),
        };

        match outcome {
            Ok(session) => {
                log::info!(
                    "EventSub session {} established (keepalive {:?}s)",
                    session.id,
                    session.keepalive_timeout_seconds
                );
                Ok((ws, session))
            }
            Err(e) => {
                log::error!("EventSub handshake failed: {}", e);
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    /// Publish a handshaken connection and start its read loop. Any loop it
    /// replaces is stopped and joined before returning.
    async fn install(&self, ws: WsStream, session: Session) -> Result<String> {
        let read_deadline = session.keepalive_timeout().unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT)
            + self.config.keepalive_margin;
        let session_id = session.id.clone();

        let installed = {
            let mut state = self.state.write();
            if state.status == ConnectionState::Closed {
                Err(ws)
            } else {
                state.generation += 1;
                let generation = state.generation;
                let stop = CancellationToken::new();
                let context = LoopContext {
                    generation,
                    stop: stop.clone(),
                    read_deadline,
                    handler: self.handler.clone(),
                    deduplicator: self.deduplicator.clone(),
                    state: self.state.clone(),
                };
                let task = tokio::spawn(read_loop(ws, context));

                state.status = ConnectionState::Connected;
                state.session = Some(session);
                state.reconnect_url = None;
                Ok(state.reader.replace(ReadLoop {
                    generation,
                    stop,
                    task,
                }))
            }
        };

        match installed {
            Ok(previous) => {
                if let Some(previous) = previous {
                    previous.shutdown().await;
                }
                Ok(session_id)
            }
            Err(mut ws) => {
                // close() ran while this connection was being established
                let _ = ws.close(None).await;
                Err(TwitchError::Closed)
            }
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(reader) = self.state.write().reader.take() {
            reader.stop.cancel();
        }
    }
}

async fn await_welcome(ws: &mut WsStream) -> Result<Session> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let message = InboundMessage::from_frame(&text)?;
                return match (message.message_type, message.session) {
                    (MessageType::Welcome, Some(session))
                        if session.keepalive_timeout_seconds.is_some() =>
                    {
                        Ok(session)
                    }
                    (MessageType::Welcome, _) => Err(TwitchError::Protocol(
                        "welcome message without keepalive timeout".to_string(),
                    )),
                    (other, _) => Err(TwitchError::Protocol(format!(
                        "expected session_welcome, got {}",
                        other
                    ))),
                };
            }
            Some(Ok(Message::Ping(payload))) => ws.send(Message::Pong(payload)).await?,
            Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(TwitchError::Transport(
                    "connection closed before welcome".to_string(),
                ))
            }
        }
    }
}

fn close_error(frame: Option<CloseFrame>) -> TwitchError {
    let code: u16 = frame.as_ref().map(|f| f.code.into()).unwrap_or(1005);
    let reason = frame
        .as_ref()
        .map(|f| f.reason.to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| describe_close_code(code).to_string());

    log::warn!("WebSocket closed: code={}, reason={}", code, reason);
    TwitchError::ConnectionClosed { code, reason }
}

/// Meaning of the EventSub-specific close codes
fn describe_close_code(code: u16) -> &'static str {
    match code {
        4000 => "Internal server error",
        4001 => "Client sent inbound traffic",
        4002 => "Client failed ping-pong",
        4003 => "Connection unused",
        4004 => "Reconnect grace time expired",
        4005 => "Network timeout",
        4006 => "Network error",
        4007 => "Invalid reconnect",
        _ => "Unknown",
    }
}

/// Everything a read loop needs, none of it borrowed from the client
struct LoopContext {
    generation: u64,
    stop: CancellationToken,
    read_deadline: Duration,
    handler: Arc<dyn SessionHandler>,
    deduplicator: Option<Arc<MessageDeduplicator>>,
    state: Arc<RwLock<SharedState>>,
}

async fn read_loop(mut ws: WsStream, context: LoopContext) {
    let failure = context.run(&mut ws).await;
    let _ = timeout(Duration::from_secs(1), ws.close(None)).await;
    context.finish(failure);
}

impl LoopContext {
    /// Returns the failure that ended the loop, or `None` when stopped.
    async fn run(&self, ws: &mut WsStream) -> Option<TwitchError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return None,
                next = timeout(self.read_deadline, ws.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    return Some(TwitchError::Transport(format!(
                        "no message within keepalive deadline of {:?}",
                        self.read_deadline
                    )))
                }
                Ok(None) => return Some(TwitchError::Transport("connection closed".to_string())),
                Ok(Some(Err(e))) => return Some(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    if self.stop.is_cancelled() {
                        return None;
                    }
                    self.handle_text(&text);
                }
                Message::Ping(payload) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        return Some(e.into());
                    }
                }
                Message::Close(frame) => return Some(close_error(frame)),
                _ => {}
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let message = match InboundMessage::from_frame(text) {
            Ok(message) => message,
            Err(e) => {
                self.report(e);
                return;
            }
        };

        match message.message_type {
            MessageType::Keepalive => {
                log::trace!("Keepalive {}", message.id);
                self.call("keepalive", |handler| handler.on_keepalive());
            }
            MessageType::Notification => {
                if let Some(dedup) = &self.deduplicator {
                    if dedup.is_duplicate(&message.id) {
                        log::debug!("Skipping duplicate notification {}", message.id);
                        return;
                    }
                }
                let message_id = message.id.clone();
                let delivered = match message.into_notification() {
                    Ok(notification) => {
                        self.call("notification", |handler| handler.on_notification(notification))
                    }
                    Err(e) => {
                        self.report(e);
                        false
                    }
                };
                if !delivered {
                    if let Some(dedup) = &self.deduplicator {
                        dedup.forget(&message_id);
                    }
                }
            }
            MessageType::Reconnect => {
                let url = message.session.and_then(|session| session.reconnect_url);
                let Some(url) = url else {
                    self.report(TwitchError::Protocol(
                        "reconnect message without reconnect_url".to_string(),
                    ));
                    return;
                };
                log::warn!("Server requested reconnect to: {}", url);
                {
                    let mut state = self.state.write();
                    if self.is_current(&state) {
                        state.reconnect_url = Some(url.clone());
                    }
                }
                self.call("reconnect", |handler| handler.on_reconnect(&url));
            }
            MessageType::Revocation => {
                if let Some(subscription) = message.subscription {
                    log::warn!(
                        "Subscription {} ({}) revoked: {}",
                        subscription.id,
                        subscription.subscription_type,
                        subscription.status
                    );
                    self.call("revocation", |handler| handler.on_revocation(subscription));
                }
            }
            other => self.report(TwitchError::Protocol(format!(
                "unexpected {} message mid-session",
                other
            ))),
        }
    }

    /// Returns `false` when the callback panicked.
    fn call(&self, name: &str, f: impl FnOnce(&dyn SessionHandler)) -> bool {
        match guarded(name, || f(self.handler.as_ref())) {
            Ok(()) => true,
            Err(e) => {
                self.report(e);
                false
            }
        }
    }

    fn report(&self, error: TwitchError) {
        log::warn!("EventSub session error: {}", error);
        let _ = guarded("error", || self.handler.on_error(error));
    }

    fn is_current(&self, state: &SharedState) -> bool {
        matches!(&state.reader, Some(reader) if reader.generation == self.generation)
    }

    /// Unpublish this loop if it is still the current one, then surface
    /// the failure unless a stop was requested.
    fn finish(&self, failure: Option<TwitchError>) {
        {
            let mut state = self.state.write();
            if self.is_current(&state) {
                state.reader = None;
                state.session = None;
                if state.status == ConnectionState::Connected {
                    state.status = ConnectionState::Disconnected;
                }
            }
        }

        if let Some(error) = failure {
            if !self.stop.is_cancelled() {
                log::error!("EventSub read loop {} stopped: {}", self.generation, error);
                self.report(error);
            }
        }
    }
}
