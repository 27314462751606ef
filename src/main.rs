use eventsub_relay::backend::config::{load_config, AppConfig};
use eventsub_relay::backend::twitch::{
    start_webhook_server, EventSubClient, Notification, SessionConfig, SessionEvent,
    Subscription, TwitchError, WebhookConfig, WebhookHandler, WebhookReceiver,
};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use helix::HelixClient;

mod helix;

const CONNECT_RETRIES: u32 = 5;

/// Logs every webhook delivery
struct LoggingHandler;

impl WebhookHandler for LoggingHandler {
    fn on_verification(&self, subscription: &Subscription, _challenge: &str) -> bool {
        info!(
            "Verifying webhook subscription {} ({} v{})",
            subscription.id, subscription.subscription_type, subscription.version
        );
        true
    }

    fn on_notification(&self, notification: Notification) {
        log_notification("webhook", &notification);
    }

    fn on_revocation(&self, subscription: Subscription) {
        warn!(
            "Webhook subscription {} ({}) revoked: {:?}",
            subscription.id,
            subscription.subscription_type,
            subscription.revocation_reason()
        );
    }
}

fn log_notification(source: &str, notification: &Notification) {
    info!(
        "[{}] {} {}: {}",
        source,
        notification.subscription.subscription_type,
        notification.message_id,
        notification.raw_event()
    );
}

async fn run_webhook(config: &AppConfig) -> Result<(), TwitchError> {
    let addr: SocketAddr = config
        .webhook
        .bind
        .parse()
        .map_err(|e| TwitchError::Config(format!("webhook.bind {:?}: {}", config.webhook.bind, e)))?;

    if config.webhook.secret.is_none() {
        warn!("webhook.secret is not set; signatures will not be checked");
    }

    let mut receiver =
        WebhookReceiver::new(WebhookConfig::from(&config.webhook), Arc::new(LoggingHandler));
    if config.webhook.dedup {
        receiver = receiver.with_deduplicator(Arc::new(config.dedup.build()));
    }

    start_webhook_server(addr, &config.webhook.path, receiver).await
}

async fn run_session(config: &AppConfig) -> Result<EventSubClient, TwitchError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();

    // Everything without a registered handler lands here
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::Keepalive => log::debug!("Keepalive"),
                SessionEvent::Notification(notification) => {
                    log_notification("websocket", &notification)
                }
                SessionEvent::Reconnect(url) => info!("Server requested reconnect to {}", url),
                SessionEvent::Revocation(subscription) => warn!(
                    "Subscription {} ({}) revoked: {:?}",
                    subscription.id,
                    subscription.subscription_type,
                    subscription.revocation_reason()
                ),
                SessionEvent::Error(e) => error!("Session error: {}", e),
            }
        }
    });

    let api = match &config.helix.base_url {
        Some(base_url) => HelixClient::with_base_url(
            base_url.as_str(),
            config.helix.client_id.as_str(),
            config.helix.access_token.as_str(),
        ),
        None => HelixClient::new(
            config.helix.client_id.as_str(),
            config.helix.access_token.as_str(),
        ),
    };

    let mut client = EventSubClient::new(
        Arc::new(api),
        SessionConfig::from(&config.websocket),
        Arc::new(event_tx),
    )
    .with_auto_reconnect(config.websocket.auto_reconnect);
    if config.websocket.dedup {
        client = client.with_deduplicator(Arc::new(config.dedup.build()));
    }

    let session_id = client.connect_with_backoff(CONNECT_RETRIES).await?;
    info!("EventSub session {} established", session_id);

    for entry in &config.subscriptions {
        let result = client
            .subscribe(
                &entry.subscription_type,
                &entry.version,
                entry.condition.clone(),
                |notification| log_notification("websocket", &notification),
            )
            .await;
        match result {
            Ok(subscription) => info!(
                "Subscription {} for {} is {}",
                subscription.id, subscription.subscription_type, subscription.status
            ),
            Err(e) => error!("Could not subscribe to {}: {}", entry.subscription_type, e),
        }
    }

    Ok(client)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if !config.webhook.enabled && !config.websocket.enabled {
        warn!("Neither [webhook] nor [websocket] is enabled; nothing to do");
        return;
    }

    let webhook_config = config.clone();
    let webhook_task = config.webhook.enabled.then(|| {
        tokio::spawn(async move {
            if let Err(e) = run_webhook(&webhook_config).await {
                error!("Webhook server stopped: {}", e);
            }
        })
    });

    let session = if config.websocket.enabled {
        match run_session(&config).await {
            Ok(client) => Some(client),
            Err(e) => {
                error!("Failed to open EventSub session: {}", e);
                None
            }
        }
    } else {
        None
    };

    if webhook_task.is_none() && session.is_none() {
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    if let Some(client) = session {
        client.close().await;
    }
    if let Some(task) = webhook_task {
        task.abort();
    }
}
