pub mod backend;

pub use backend::config::{load_config, AppConfig};
pub use backend::twitch::{
    EventSubClient, MessageDeduplicator, Notification, Result, SessionClient,
    SessionConfig, SessionHandler, Subscription, TwitchError, WebhookConfig, WebhookHandler,
    WebhookReceiver,
};
