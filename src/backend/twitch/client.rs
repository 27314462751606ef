use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::dedup::MessageDeduplicator;
use super::error::{Result, TwitchError};
use super::eventsub::{SubscriptionApi, SubscriptionRequest};
use super::messages::{Condition, Notification, Subscription, Transport};
use super::websocket::{ConnectionState, SessionClient, SessionConfig, SessionHandler};

/// Callback for one subscription type
pub type EventCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// Routes notifications to the per-type callback, everything else to the
/// application's fallback handler.
struct EventRouter {
    handlers: Arc<DashMap<String, EventCallback>>,
    fallback: Arc<dyn SessionHandler>,
    reconnects: Option<mpsc::UnboundedSender<String>>,
}

impl SessionHandler for EventRouter {
    fn on_keepalive(&self) {
        self.fallback.on_keepalive();
    }

    fn on_notification(&self, notification: Notification) {
        // Clone out of the map so no shard lock is held while user code runs
        let callback = self
            .handlers
            .get(&notification.subscription.subscription_type)
            .map(|entry| entry.value().clone());

        match callback {
            Some(callback) => callback(notification),
            None => self.fallback.on_notification(notification),
        }
    }

    fn on_reconnect(&self, url: &str) {
        if let Some(tx) = &self.reconnects {
            let _ = tx.send(url.to_string());
        }
        self.fallback.on_reconnect(url);
    }

    fn on_revocation(&self, subscription: Subscription) {
        self.fallback.on_revocation(subscription);
    }

    fn on_error(&self, error: TwitchError) {
        self.fallback.on_error(error);
    }
}

/// WebSocket session plus remote subscription management.
///
/// `subscribe` registers a local callback for an event type and creates the
/// platform subscription on the current session's transport. Callbacks are
/// keyed by event type: subscribing to a type again replaces its callback,
/// and the callback stays registered until the last subscription of that
/// type is removed.
pub struct EventSubClient {
    api: Arc<dyn SubscriptionApi>,
    config: SessionConfig,
    fallback: Arc<dyn SessionHandler>,
    auto_reconnect: bool,
    deduplicator: Option<Arc<MessageDeduplicator>>,
    handlers: Arc<DashMap<String, EventCallback>>,
    /// Live subscription id -> event type
    subscriptions: DashMap<String, String>,
    session: Mutex<Option<Arc<SessionClient>>>,
}

impl EventSubClient {
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        config: SessionConfig,
        fallback: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            api,
            config,
            fallback,
            auto_reconnect: false,
            deduplicator: None,
            handlers: Arc::new(DashMap::new()),
            subscriptions: DashMap::new(),
            session: Mutex::new(None),
        }
    }

    /// Follow `session_reconnect` frames automatically
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Drop notifications whose message id was already delivered
    pub fn with_deduplicator(mut self, deduplicator: Arc<MessageDeduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    /// Open the session (or return the live one). Returns the session id.
    pub async fn connect(&self) -> Result<String> {
        let client = self.session_client();
        client.connect().await
    }

    pub async fn connect_with_backoff(&self, max_retries: u32) -> Result<String> {
        let client = self.session_client();
        client.connect_with_backoff(max_retries).await
    }

    fn session_client(&self) -> Arc<SessionClient> {
        let mut session = self.session.lock();
        if let Some(client) = session.as_ref() {
            return client.clone();
        }

        let (reconnect_tx, reconnect_rx) = if self.auto_reconnect {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let router = EventRouter {
            handlers: self.handlers.clone(),
            fallback: self.fallback.clone(),
            reconnects: reconnect_tx,
        };
        let mut client = SessionClient::new(self.config.clone(), Arc::new(router));
        if let Some(deduplicator) = &self.deduplicator {
            client = client.with_deduplicator(deduplicator.clone());
        }
        let client = Arc::new(client);

        if let Some(rx) = reconnect_rx {
            tokio::spawn(follow_reconnects(Arc::downgrade(&client), rx));
        }

        *session = Some(client.clone());
        client
    }

    /// Register `handler` for `subscription_type` and create the remote
    /// subscription on this session.
    pub async fn subscribe<F>(
        &self,
        subscription_type: &str,
        version: &str,
        condition: Condition,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let session_id = self.session_id().ok_or(TwitchError::NotConnected)?;

        let previous = self
            .handlers
            .insert(subscription_type.to_string(), Arc::new(handler));

        let request = SubscriptionRequest {
            subscription_type: subscription_type.to_string(),
            version: version.to_string(),
            condition,
            transport: Transport::websocket(session_id),
        };

        match self.api.create_subscription(request).await {
            Ok(subscription) => {
                self.subscriptions
                    .insert(subscription.id.clone(), subscription_type.to_string());
                Ok(subscription)
            }
            Err(e) => {
                log::error!("Failed to subscribe to {}: {}", subscription_type, e);
                match previous {
                    Some(previous) => {
                        self.handlers.insert(subscription_type.to_string(), previous);
                    }
                    None => {
                        self.handlers.remove(subscription_type);
                    }
                }
                Err(e)
            }
        }
    }

    /// Delete the remote subscription. The handler for its type is dropped
    /// once no other subscription of that type remains.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.api.delete_subscription(&subscription.id).await?;
        self.subscriptions.remove(&subscription.id);

        let type_still_used = self
            .subscriptions
            .iter()
            .any(|entry| entry.value() == &subscription.subscription_type);
        if !type_still_used {
            self.handlers.remove(&subscription.subscription_type);
        }
        Ok(())
    }

    /// Close the session. No callback runs after this returns.
    pub async fn close(&self) {
        let client = self.session.lock().clone();
        if let Some(client) = client {
            client.close().await;
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().and_then(|client| client.session_id())
    }

    pub fn state(&self) -> ConnectionState {
        self.session
            .lock()
            .as_ref()
            .map(|client| client.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn has_handler(&self, subscription_type: &str) -> bool {
        self.handlers.contains_key(subscription_type)
    }
}

/// Supervisor: moves the session whenever the server asks for it.
/// Ends once the session client is dropped.
async fn follow_reconnects(client: Weak<SessionClient>, mut urls: mpsc::UnboundedReceiver<String>) {
    while let Some(url) = urls.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        if let Err(e) = client.reconnect(&url).await {
            log::error!("Automatic reconnect to {} failed: {}", url, e);
        }
    }
}
