use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::twitch::{
    dedup, webhook, websocket, Condition, MessageDeduplicator, ReconnectOrder, Result,
    SessionConfig, TwitchError, WebhookConfig, EVENTSUB_WS_URL,
};

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub webhook: WebhookSection,
    pub websocket: WebsocketSection,
    pub helix: HelixSection,
    pub dedup: DedupConfig,
    pub subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebhookSection {
    pub enabled: bool,
    pub bind: String,
    pub path: String,
    pub secret: Option<String>,
    pub max_body_bytes: usize,
    pub max_message_age_secs: u64,
    pub dedup: bool,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
            path: "/eventsub".to_string(),
            secret: None,
            max_body_bytes: webhook::DEFAULT_MAX_BODY_BYTES,
            max_message_age_secs: webhook::DEFAULT_MAX_MESSAGE_AGE.as_secs(),
            dedup: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebsocketSection {
    pub enabled: bool,
    pub url: String,
    pub welcome_timeout_secs: u64,
    pub keepalive_margin_secs: u64,
    pub keepalive_timeout_secs: Option<u64>,
    pub reconnect_order: ReconnectOrder,
    pub auto_reconnect: bool,
    pub dedup: bool,
}

impl Default for WebsocketSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: EVENTSUB_WS_URL.to_string(),
            welcome_timeout_secs: websocket::DEFAULT_WELCOME_TIMEOUT.as_secs(),
            keepalive_margin_secs: websocket::DEFAULT_KEEPALIVE_MARGIN.as_secs(),
            keepalive_timeout_secs: None,
            reconnect_order: ReconnectOrder::default(),
            auto_reconnect: true,
            dedup: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HelixSection {
    pub client_id: String,
    pub access_token: String,
    pub base_url: Option<String>,
}

/// Bounds for the message-id deduplicator
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
    pub max_age_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: dedup::DEFAULT_CAPACITY,
            max_age_secs: dedup::DEFAULT_MAX_AGE.as_secs(),
        }
    }
}

impl DedupConfig {
    pub fn build(&self) -> MessageDeduplicator {
        MessageDeduplicator::new(self.capacity, Duration::from_secs(self.max_age_secs))
    }
}

/// One `[[subscriptions]]` entry
#[derive(Deserialize, Debug, Clone)]
pub struct SubscriptionEntry {
    #[serde(rename = "type")]
    pub subscription_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub condition: Condition,
}

fn default_version() -> String {
    "1".to_string()
}

impl From<&WebhookSection> for WebhookConfig {
    fn from(section: &WebhookSection) -> Self {
        WebhookConfig {
            secret: section.secret.clone(),
            max_body_bytes: section.max_body_bytes,
            max_message_age: Duration::from_secs(section.max_message_age_secs),
        }
    }
}

impl From<&WebsocketSection> for SessionConfig {
    fn from(section: &WebsocketSection) -> Self {
        SessionConfig {
            url: section.url.clone(),
            welcome_timeout: Duration::from_secs(section.welcome_timeout_secs),
            keepalive_margin: Duration::from_secs(section.keepalive_margin_secs),
            keepalive_timeout: section.keepalive_timeout_secs,
            reconnect_order: section.reconnect_order,
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| TwitchError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).map_err(|e| TwitchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.webhook.enabled && !self.webhook.path.starts_with('/') {
            return Err(TwitchError::Config(format!(
                "webhook.path must start with '/', got {:?}",
                self.webhook.path
            )));
        }
        if let Some(secs) = self.websocket.keepalive_timeout_secs {
            if !(10..=600).contains(&secs) {
                return Err(TwitchError::Config(format!(
                    "websocket.keepalive_timeout_secs must be within 10..=600, got {}",
                    secs
                )));
            }
        }
        if self.websocket.enabled && !self.subscriptions.is_empty() {
            if self.helix.client_id.is_empty() || self.helix.access_token.is_empty() {
                return Err(TwitchError::Config(
                    "helix.client_id and helix.access_token are required to create subscriptions"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load `path`, or `config.toml` at the project root when no path is given
pub fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config_path = match path {
        Some(path) => path,
        None => project_root::get_project_root()
            .map_err(|e| TwitchError::Config(format!("project root not found: {}", e)))?
            .join("config.toml"),
    };
    log::info!("Loading config from {}", config_path.display());
    AppConfig::from_file(config_path)
}
