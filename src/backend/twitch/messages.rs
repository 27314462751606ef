use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::error::{Result, TwitchError};

/// Opaque key/value filter attached to a subscription (e.g. `broadcaster_user_id`).
pub type Condition = HashMap<String, String>;

/// Delivery target of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Transport {
    Webhook {
        #[serde(rename = "callback")]
        callback_url: String,
        /// Only sent when creating the subscription, never echoed back
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Websocket {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connected_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        disconnected_at: Option<DateTime<Utc>>,
    },
    Conduit {
        conduit_id: String,
    },
}

impl Transport {
    /// Transport for subscriptions delivered over a WebSocket session
    pub fn websocket(session_id: impl Into<String>) -> Self {
        Transport::Websocket {
            session_id: session_id.into(),
            connected_at: None,
            disconnected_at: None,
        }
    }

    /// Transport for subscriptions delivered by webhook
    pub fn webhook(callback_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Transport::Webhook {
            callback_url: callback_url.into(),
            secret: Some(secret.into()),
        }
    }
}

/// Subscription metadata as mirrored from the platform
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Subscription {
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cost: u32,
    #[serde(default)]
    pub condition: Condition,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

impl Subscription {
    /// Why the platform revoked this subscription. Only meaningful on revocations.
    pub fn revocation_reason(&self) -> RevocationReason {
        RevocationReason::from(self.status.as_str())
    }
}

/// Reasons carried in the status field of a revoked subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationReason {
    AuthorizationRevoked,
    UserRemoved,
    NotificationFailuresExceeded,
    VersionRemoved,
    Other(String),
}

impl From<&str> for RevocationReason {
    fn from(status: &str) -> Self {
        match status {
            "authorization_revoked" => RevocationReason::AuthorizationRevoked,
            "user_removed" => RevocationReason::UserRemoved,
            "notification_failures_exceeded" => RevocationReason::NotificationFailuresExceeded,
            "version_removed" => RevocationReason::VersionRemoved,
            other => RevocationReason::Other(other.to_string()),
        }
    }
}

/// WebSocket session info from welcome and reconnect frames
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        self.keepalive_timeout_seconds.map(Duration::from_secs)
    }
}

/// Kind of an inbound message, shared by both transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Notification,
    VerificationChallenge,
    Revocation,
    Keepalive,
    Reconnect,
    Welcome,
}

impl MessageType {
    /// Parse a wire message type. Unknown types yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "notification" => Some(MessageType::Notification),
            "webhook_callback_verification" => Some(MessageType::VerificationChallenge),
            "revocation" => Some(MessageType::Revocation),
            "session_keepalive" => Some(MessageType::Keepalive),
            "session_reconnect" => Some(MessageType::Reconnect),
            "session_welcome" => Some(MessageType::Welcome),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Notification => "notification",
            MessageType::VerificationChallenge => "webhook_callback_verification",
            MessageType::Revocation => "revocation",
            MessageType::Keepalive => "session_keepalive",
            MessageType::Reconnect => "session_reconnect",
            MessageType::Welcome => "session_welcome",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata block of a WebSocket frame
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    pub message_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_version: Option<String>,
}

#[derive(Deserialize)]
struct Frame {
    metadata: Metadata,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
struct SessionPayload {
    session: Session,
}

/// Body of a webhook request, and the payload of notification/revocation frames
#[derive(Deserialize)]
struct EventPayload {
    #[serde(default)]
    subscription: Option<Subscription>,
    #[serde(default)]
    event: Option<Box<RawValue>>,
    #[serde(default)]
    challenge: Option<String>,
}

/// Normalized envelope produced by both the webhook and the WebSocket path
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub subscription: Option<Subscription>,
    pub event: Option<Box<RawValue>>,
    pub challenge: Option<String>,
    pub session: Option<Session>,
}

impl InboundMessage {
    /// Parse a WebSocket text frame. Failures are protocol violations.
    pub fn from_frame(text: &str) -> Result<Self> {
        let frame: Frame = serde_json::from_str(text)?;
        let message_type = MessageType::parse(&frame.metadata.message_type).ok_or_else(|| {
            TwitchError::Protocol(format!(
                "unknown message type '{}'",
                frame.metadata.message_type
            ))
        })?;

        let mut message = InboundMessage {
            id: frame.metadata.message_id,
            message_type,
            timestamp: frame.metadata.message_timestamp,
            subscription: None,
            event: None,
            challenge: None,
            session: None,
        };

        let payload = frame.payload.as_deref().map(RawValue::get).unwrap_or("{}");
        match message_type {
            MessageType::Welcome | MessageType::Reconnect => {
                let parsed: SessionPayload = serde_json::from_str(payload)?;
                message.session = Some(parsed.session);
            }
            MessageType::Notification | MessageType::Revocation => {
                let parsed: EventPayload = serde_json::from_str(payload)?;
                message.subscription = parsed.subscription;
                message.event = parsed.event;
            }
            MessageType::Keepalive => {}
            MessageType::VerificationChallenge => {
                return Err(TwitchError::Protocol(
                    "verification challenge is not valid on a WebSocket".to_string(),
                ));
            }
        }

        message.check_required_fields().map_err(TwitchError::Protocol)?;
        Ok(message)
    }

    /// Build a message from webhook headers and raw body. Failures are validation errors.
    pub fn from_webhook(
        message_id: &str,
        message_type: &str,
        timestamp: &str,
        body: &[u8],
    ) -> Result<Self> {
        let message_type = match MessageType::parse(message_type) {
            Some(
                t @ (MessageType::Notification
                | MessageType::VerificationChallenge
                | MessageType::Revocation),
            ) => t,
            _ => {
                return Err(TwitchError::Validation(format!(
                    "unknown message type '{}'",
                    message_type
                )))
            }
        };

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| TwitchError::Validation(format!("invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        let payload: EventPayload = serde_json::from_slice(body)
            .map_err(|e| TwitchError::Validation(format!("malformed body: {}", e)))?;

        let message = InboundMessage {
            id: message_id.to_string(),
            message_type,
            timestamp,
            subscription: payload.subscription,
            event: payload.event,
            challenge: payload.challenge,
            session: None,
        };

        message.check_required_fields().map_err(TwitchError::Validation)?;
        Ok(message)
    }

    fn check_required_fields(&self) -> std::result::Result<(), String> {
        let missing = match self.message_type {
            MessageType::Notification if self.subscription.is_none() => Some("subscription"),
            MessageType::Notification if self.event.is_none() => Some("event"),
            MessageType::Revocation if self.subscription.is_none() => Some("subscription"),
            MessageType::VerificationChallenge if self.subscription.is_none() => {
                Some("subscription")
            }
            MessageType::VerificationChallenge if self.challenge.is_none() => Some("challenge"),
            MessageType::Welcome | MessageType::Reconnect if self.session.is_none() => {
                Some("session")
            }
            _ => None,
        };

        match missing {
            Some(field) => Err(format!("{} message is missing '{}'", self.message_type, field)),
            None => Ok(()),
        }
    }

    /// Split a notification into the subscription and its raw event.
    pub fn into_notification(self) -> Result<Notification> {
        match (self.message_type, self.subscription, self.event) {
            (MessageType::Notification, Some(subscription), Some(event)) => Ok(Notification {
                message_id: self.id,
                timestamp: self.timestamp,
                subscription,
                event,
            }),
            (message_type, _, _) => Err(TwitchError::Protocol(format!(
                "{} message is not a complete notification",
                message_type
            ))),
        }
    }
}

/// A delivered event: subscription metadata plus the undecoded event payload
#[derive(Debug, Clone)]
pub struct Notification {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub subscription: Subscription,
    event: Box<RawValue>,
}

impl Notification {
    pub fn new(
        message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        subscription: Subscription,
        event: Box<RawValue>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp,
            subscription,
            event,
        }
    }

    /// The event JSON exactly as it arrived
    pub fn raw_event(&self) -> &str {
        self.event.get()
    }

    /// Decode the event into the caller's schema.
    ///
    /// Returns `TwitchError::Decode` when the payload does not match `T`; the
    /// notification itself stays usable, so a caller can retry with another type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.event.get()).map_err(|e| {
            TwitchError::Decode(format!(
                "{} v{}: {}",
                self.subscription.subscription_type, self.subscription.version, e
            ))
        })
    }
}
