/// Twitch EventSub delivery
///
/// Turns raw platform input from either transport into typed notifications:
/// - Webhook deliveries: signature check, freshness window, challenge handling
/// - WebSocket sessions: welcome handshake, keepalive deadline, reconnects
/// - Optional duplicate suppression by message id
/// - A facade that creates subscriptions on the session's transport
///
/// # Example Usage
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use eventsub_relay::backend::twitch::{
///     Condition, EventSubClient, SessionConfig, SessionEvent, SubscriptionApi,
/// };
/// use tokio::sync::mpsc;
///
/// // `api` is the application's REST client for eventsub/subscriptions
/// async fn run(api: Arc<dyn SubscriptionApi>) -> eventsub_relay::Result<()> {
///     let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
///     let client = EventSubClient::new(api, SessionConfig::default(), Arc::new(tx))
///         .with_auto_reconnect(true);
///
///     client.connect().await?;
///
///     let condition = Condition::from([
///         ("broadcaster_user_id".to_string(), "1234".to_string()),
///         ("moderator_user_id".to_string(), "1234".to_string()),
///     ]);
///     client
///         .subscribe("channel.follow", "2", condition, |notification| {
///             println!("follow: {}", notification.raw_event());
///         })
///         .await?;
///
///     // Events without a registered handler, revocations and errors
///     while let Some(event) = rx.recv().await {
///         println!("{:?}", event);
///     }
///     Ok(())
/// }
/// ```

mod client;
pub mod dedup;
mod dispatch;
mod error;
mod eventsub;
mod messages;
pub mod signature;
pub mod webhook;
pub mod websocket;

// Re-export public types
pub use client::{EventCallback, EventSubClient};
pub use dedup::MessageDeduplicator;
pub use error::{Result, TwitchError};
pub use eventsub::{SubscriptionApi, SubscriptionRequest};
pub use messages::{
    Condition, InboundMessage, MessageType, Metadata, Notification, RevocationReason, Session,
    Subscription, Transport,
};
pub use webhook::{
    start_webhook_server, Clock, WebhookConfig, WebhookHandler, WebhookReceiver, WebhookResponse,
    HEADER_MESSAGE_ID, HEADER_MESSAGE_SIGNATURE, HEADER_MESSAGE_TIMESTAMP, HEADER_MESSAGE_TYPE,
    HEADER_SUBSCRIPTION_TYPE, HEADER_SUBSCRIPTION_VERSION,
};
pub use websocket::{
    ConnectionState, ReconnectOrder, SessionClient, SessionConfig, SessionEvent, SessionHandler,
    EVENTSUB_WS_URL,
};
