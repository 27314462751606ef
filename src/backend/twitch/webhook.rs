use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;

use super::dedup::MessageDeduplicator;
use super::dispatch::guarded;
use super::error::{Result, TwitchError};
use super::messages::{InboundMessage, MessageType, Notification, Subscription};
use super::signature;

pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";
pub const HEADER_SUBSCRIPTION_TYPE: &str = "Twitch-Eventsub-Subscription-Type";
pub const HEADER_SUBSCRIPTION_VERSION: &str = "Twitch-Eventsub-Subscription-Version";

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(600);

/// Source of "now" for freshness checks
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Application callbacks for webhook deliveries.
///
/// Callbacks run on the request task and should return quickly.
pub trait WebhookHandler: Send + Sync {
    /// Decide whether to confirm a new subscription. Accepts by default.
    fn on_verification(&self, _subscription: &Subscription, _challenge: &str) -> bool {
        true
    }

    fn on_notification(&self, _notification: Notification) {}

    /// The subscription's status holds the revocation reason.
    fn on_revocation(&self, _subscription: Subscription) {}
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared secret; signatures are only checked when set
    pub secret: Option<String>,
    pub max_body_bytes: usize,
    pub max_message_age: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_message_age: DEFAULT_MAX_MESSAGE_AGE,
        }
    }
}

/// Successful outcome of a webhook request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
    /// Verification accepted; the body is the literal challenge
    Challenge(String),
    /// Notification or revocation handled
    Accepted,
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        match self {
            WebhookResponse::Challenge(challenge) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response(),
            WebhookResponse::Accepted => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

impl IntoResponse for TwitchError {
    fn into_response(self) -> Response {
        self.status_code().into_response()
    }
}

/// Request pipeline for EventSub webhook deliveries.
///
/// Each request is independent: body limit, signature, envelope parsing,
/// freshness, then dispatch. The first failing stage ends the request.
pub struct WebhookReceiver {
    config: WebhookConfig,
    handler: Arc<dyn WebhookHandler>,
    deduplicator: Option<Arc<MessageDeduplicator>>,
    clock: Clock,
}

impl WebhookReceiver {
    pub fn new(config: WebhookConfig, handler: Arc<dyn WebhookHandler>) -> Self {
        Self {
            config,
            handler,
            deduplicator: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Drop notifications whose message id was already delivered.
    /// Duplicates are still acknowledged so the platform stops retrying.
    pub fn with_deduplicator(mut self, deduplicator: Arc<MessageDeduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run one request through the pipeline.
    pub fn process(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookResponse> {
        if body.len() > self.config.max_body_bytes {
            return Err(TwitchError::PayloadTooLarge {
                limit: self.config.max_body_bytes,
            });
        }

        self.authenticate(headers, body)?;

        let message = InboundMessage::from_webhook(
            required_header(headers, HEADER_MESSAGE_ID)?,
            required_header(headers, HEADER_MESSAGE_TYPE)?,
            required_header(headers, HEADER_MESSAGE_TIMESTAMP)?,
            body,
        )?;

        self.check_freshness(&message)?;
        self.dispatch(message)
    }

    fn authenticate(&self, headers: &HeaderMap, body: &[u8]) -> Result<()> {
        let Some(secret) = self.config.secret.as_deref() else {
            return Ok(());
        };

        let header = |name: &str| {
            optional_header(headers, name)
                .ok_or_else(|| TwitchError::Authentication(format!("missing header {}", name)))
        };
        let message_id = header(HEADER_MESSAGE_ID)?;
        let timestamp = header(HEADER_MESSAGE_TIMESTAMP)?;
        let provided = header(HEADER_MESSAGE_SIGNATURE)?;

        if signature::verify(secret.as_bytes(), message_id, timestamp, body, provided) {
            Ok(())
        } else {
            Err(TwitchError::Authentication(format!(
                "signature mismatch for message {}",
                message_id
            )))
        }
    }

    fn check_freshness(&self, message: &InboundMessage) -> Result<()> {
        let now = (self.clock)();
        let age_ms = now
            .signed_duration_since(message.timestamp)
            .num_milliseconds()
            .unsigned_abs();
        let max_ms = u64::try_from(self.config.max_message_age.as_millis()).unwrap_or(u64::MAX);

        if age_ms > max_ms {
            return Err(TwitchError::Validation(format!(
                "message {} timestamp {} is outside the {}s window",
                message.id,
                message.timestamp.to_rfc3339(),
                self.config.max_message_age.as_secs()
            )));
        }
        Ok(())
    }

    fn dispatch(&self, message: InboundMessage) -> Result<WebhookResponse> {
        match message.message_type {
            MessageType::VerificationChallenge => {
                let (Some(subscription), Some(challenge)) = (message.subscription, message.challenge)
                else {
                    return Err(TwitchError::Validation(
                        "incomplete verification request".to_string(),
                    ));
                };

                let accepted = guarded("verification", || {
                    self.handler.on_verification(&subscription, &challenge)
                })?;
                if accepted {
                    log::info!(
                        "Confirmed subscription {} ({} v{})",
                        subscription.id,
                        subscription.subscription_type,
                        subscription.version
                    );
                    Ok(WebhookResponse::Challenge(challenge))
                } else {
                    Err(TwitchError::Validation(format!(
                        "verification of subscription {} rejected by handler",
                        subscription.id
                    )))
                }
            }
            MessageType::Notification => {
                if let Some(dedup) = &self.deduplicator {
                    if dedup.is_duplicate(&message.id) {
                        log::debug!("Skipping duplicate notification {}", message.id);
                        return Ok(WebhookResponse::Accepted);
                    }
                }

                let message_id = message.id.clone();
                let delivered = self.deliver_notification(message);
                if delivered.is_err() {
                    // Not delivered: the platform's retry must reach the handler
                    if let Some(dedup) = &self.deduplicator {
                        dedup.forget(&message_id);
                    }
                }
                delivered
            }
            MessageType::Revocation => {
                let subscription = message.subscription.ok_or_else(|| {
                    TwitchError::Validation("revocation without subscription".to_string())
                })?;
                log::warn!(
                    "Subscription {} ({}) revoked: {}",
                    subscription.id,
                    subscription.subscription_type,
                    subscription.status
                );
                guarded("revocation", || self.handler.on_revocation(subscription))?;
                Ok(WebhookResponse::Accepted)
            }
            other => Err(TwitchError::Validation(format!(
                "unsupported message type {}",
                other
            ))),
        }
    }

    fn deliver_notification(&self, message: InboundMessage) -> Result<WebhookResponse> {
        let notification = message
            .into_notification()
            .map_err(|e| TwitchError::Validation(e.to_string()))?;
        log::debug!(
            "Notification {} for {}",
            notification.message_id,
            notification.subscription.subscription_type
        );
        guarded("notification", || self.handler.on_notification(notification))?;
        Ok(WebhookResponse::Accepted)
    }

    /// Build the axum router: `POST path` for deliveries plus `/health`.
    pub fn router(self, path: &str) -> Router {
        let max_body_bytes = self.config.max_body_bytes;
        Router::new()
            .route(path, post(handle_webhook))
            .route("/health", get(health_check))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(max_body_bytes))
            .with_state(Arc::new(self))
    }
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    optional_header(headers, name)
        .ok_or_else(|| TwitchError::Validation(format!("missing header {}", name)))
}

async fn handle_webhook(
    State(receiver): State<Arc<WebhookReceiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match receiver.process(&headers, &body) {
        Ok(response) => response.into_response(),
        Err(e) => {
            log::warn!(
                "Rejected webhook message {}: {}",
                optional_header(&headers, HEADER_MESSAGE_ID).unwrap_or("<none>"),
                e
            );
            e.into_response()
        }
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "EventSub webhook receiver is running")
}

/// Serve the webhook endpoint until the listener fails
pub async fn start_webhook_server(
    addr: SocketAddr,
    path: &str,
    receiver: WebhookReceiver,
) -> Result<()> {
    let app = receiver.router(path);

    log::info!("Starting EventSub webhook server on http://{}{}", addr, path);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TwitchError::Transport(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TwitchError::Transport(format!("webhook server failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use parking_lot::Mutex;

    const SECRET: &str = "s3cr3t";
    const NOW: &str = "2024-01-01T00:05:00Z";
    const SENT_AT: &str = "2024-01-01T00:00:00Z";

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<Notification>>,
        revocations: Mutex<Vec<Subscription>>,
        reject_verification: bool,
    }

    impl WebhookHandler for Recorder {
        fn on_verification(&self, _subscription: &Subscription, _challenge: &str) -> bool {
            !self.reject_verification
        }

        fn on_notification(&self, notification: Notification) {
            self.notifications.lock().push(notification);
        }

        fn on_revocation(&self, subscription: Subscription) {
            self.revocations.lock().push(subscription);
        }
    }

    fn fixed_clock(at: &str) -> Clock {
        let now = DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc);
        Arc::new(move || now)
    }

    fn receiver(handler: Arc<Recorder>) -> WebhookReceiver {
        let config = WebhookConfig {
            secret: Some(SECRET.to_string()),
            ..WebhookConfig::default()
        };
        WebhookReceiver::new(config, handler).with_clock(fixed_clock(NOW))
    }

    fn body(message_type: &str) -> String {
        let subscription = r#"{"id": "sub-1", "type": "channel.follow", "version": "2",
            "status": "enabled", "cost": 0, "condition": {"broadcaster_user_id": "1337"},
            "transport": {"method": "webhook", "callback": "https://example.com/webhooks/callback"},
            "created_at": "2023-12-31T23:00:00Z"}"#;
        match message_type {
            "webhook_callback_verification" => format!(
                r#"{{"challenge": "pogchamp-kappa-360noscope-vohiyo", "subscription": {}}}"#,
                subscription
            ),
            "notification" => format!(
                r#"{{"subscription": {}, "event": {{"user_id": "1234", "user_login": "cool_user"}}}}"#,
                subscription
            ),
            _ => format!(r#"{{"subscription": {}}}"#, subscription.replace("enabled", "authorization_revoked")),
        }
    }

    fn headers(message_id: &str, message_type: &str, timestamp: &str, body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let signature = signature::sign(SECRET.as_bytes(), message_id, timestamp, body.as_bytes());
        headers.insert(HEADER_MESSAGE_ID, HeaderValue::from_str(message_id).unwrap());
        headers.insert(HEADER_MESSAGE_TIMESTAMP, HeaderValue::from_str(timestamp).unwrap());
        headers.insert(HEADER_MESSAGE_SIGNATURE, HeaderValue::from_str(&signature).unwrap());
        headers.insert(HEADER_MESSAGE_TYPE, HeaderValue::from_str(message_type).unwrap());
        headers.insert(HEADER_SUBSCRIPTION_TYPE, HeaderValue::from_static("channel.follow"));
        headers.insert(HEADER_SUBSCRIPTION_VERSION, HeaderValue::from_static("2"));
        headers
    }

    #[test]
    fn test_verification_returns_challenge() {
        let receiver = receiver(Arc::new(Recorder::default()));
        let body = body("webhook_callback_verification");
        let headers = headers("m1", "webhook_callback_verification", SENT_AT, &body);

        let response = receiver.process(&headers, body.as_bytes()).unwrap();
        assert_eq!(
            response,
            WebhookResponse::Challenge("pogchamp-kappa-360noscope-vohiyo".to_string())
        );
    }

    #[test]
    fn test_rejected_verification_is_validation_failure() {
        let handler = Arc::new(Recorder {
            reject_verification: true,
            ..Recorder::default()
        });
        let receiver = receiver(handler);
        let body = body("webhook_callback_verification");
        let headers = headers("m1", "webhook_callback_verification", SENT_AT, &body);

        let err = receiver.process(&headers, body.as_bytes()).unwrap_err();
        assert!(matches!(err, TwitchError::Validation(_)));
    }

    #[test]
    fn test_notification_dispatches_subscription_and_event() {
        let handler = Arc::new(Recorder::default());
        let receiver = receiver(handler.clone());
        let body = body("notification");
        let headers = headers("m2", "notification", SENT_AT, &body);

        assert_eq!(
            receiver.process(&headers, body.as_bytes()).unwrap(),
            WebhookResponse::Accepted
        );
        let notifications = handler.notifications.lock();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].message_id, "m2");
        assert_eq!(notifications[0].subscription.id, "sub-1");
        assert!(notifications[0].raw_event().contains("cool_user"));
    }

    #[test]
    fn test_revocation_dispatches_subscription() {
        let handler = Arc::new(Recorder::default());
        let receiver = receiver(handler.clone());
        let body = body("revocation");
        let headers = headers("m3", "revocation", SENT_AT, &body);

        assert_eq!(
            receiver.process(&headers, body.as_bytes()).unwrap(),
            WebhookResponse::Accepted
        );
        let revocations = handler.revocations.lock();
        assert_eq!(revocations[0].status, "authorization_revoked");
    }

    #[test]
    fn test_stale_message_with_valid_signature_is_rejected() {
        let handler = Arc::new(Recorder::default());
        let receiver = receiver(handler.clone());
        let body = body("notification");
        let stale = "2023-12-31T23:54:59Z";
        let headers = headers("m4", "notification", stale, &body);

        let err = receiver.process(&headers, body.as_bytes()).unwrap_err();
        assert!(matches!(err, TwitchError::Validation(msg) if msg.contains("window")));
        assert!(handler.notifications.lock().is_empty());
    }

    #[test]
    fn test_tampered_body_is_authentication_failure() {
        let handler = Arc::new(Recorder::default());
        let receiver = receiver(handler.clone());
        let body = body("notification");
        let headers = headers("m5", "notification", SENT_AT, &body);
        let tampered = body.replace("cool_user", "evil_user");

        let err = receiver.process(&headers, tampered.as_bytes()).unwrap_err();
        assert!(matches!(err, TwitchError::Authentication(_)));
        assert!(handler.notifications.lock().is_empty());
    }

    #[test]
    fn test_missing_signature_header_is_authentication_failure() {
        let receiver = receiver(Arc::new(Recorder::default()));
        let body = body("notification");
        let mut headers = headers("m6", "notification", SENT_AT, &body);
        headers.remove(HEADER_MESSAGE_SIGNATURE);

        let err = receiver.process(&headers, body.as_bytes()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_unknown_message_type_is_validation_failure() {
        let receiver = receiver(Arc::new(Recorder::default()));
        let body = body("notification");
        let headers = headers("m7", "mystery", SENT_AT, &body);

        let err = receiver.process(&headers, body.as_bytes()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_oversized_body_is_rejected_before_verification() {
        let config = WebhookConfig {
            secret: Some(SECRET.to_string()),
            max_body_bytes: 16,
            ..WebhookConfig::default()
        };
        let receiver = WebhookReceiver::new(config, Arc::new(Recorder::default()));
        let body = body("notification");

        let err = receiver.process(&HeaderMap::new(), body.as_bytes()).unwrap_err();
        assert!(matches!(err, TwitchError::PayloadTooLarge { limit: 16 }));
    }

    #[test]
    fn test_without_secret_signature_is_not_required() {
        let handler = Arc::new(Recorder::default());
        let receiver = WebhookReceiver::new(WebhookConfig::default(), handler.clone())
            .with_clock(fixed_clock(NOW));
        let body = body("notification");
        let mut headers = headers("m8", "notification", SENT_AT, &body);
        headers.remove(HEADER_MESSAGE_SIGNATURE);

        assert!(receiver.process(&headers, body.as_bytes()).is_ok());
        assert_eq!(handler.notifications.lock().len(), 1);
    }

    #[test]
    fn test_deduplicator_suppresses_redelivery() {
        let handler = Arc::new(Recorder::default());
        let receiver = receiver(handler.clone())
            .with_deduplicator(Arc::new(MessageDeduplicator::default()));
        let body = body("notification");
        let headers = headers("m9", "notification", SENT_AT, &body);

        for _ in 0..3 {
            assert_eq!(
                receiver.process(&headers, body.as_bytes()).unwrap(),
                WebhookResponse::Accepted
            );
        }
        assert_eq!(handler.notifications.lock().len(), 1);
    }

    #[test]
    fn test_handler_panic_becomes_server_error() {
        struct Panicking;
        impl WebhookHandler for Panicking {
            fn on_notification(&self, _notification: Notification) {
                panic!("handler bug");
            }
        }

        let config = WebhookConfig {
            secret: Some(SECRET.to_string()),
            ..WebhookConfig::default()
        };
        let receiver =
            WebhookReceiver::new(config, Arc::new(Panicking)).with_clock(fixed_clock(NOW));
        let body = body("notification");
        let headers = headers("m10", "notification", SENT_AT, &body);

        let err = receiver.process(&headers, body.as_bytes()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_retry_after_handler_panic_reaches_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct FailsOnce {
            calls: AtomicUsize,
        }
        impl WebhookHandler for FailsOnce {
            fn on_notification(&self, _notification: Notification) {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("transient handler failure");
                }
            }
        }

        let handler = Arc::new(FailsOnce::default());
        let config = WebhookConfig {
            secret: Some(SECRET.to_string()),
            ..WebhookConfig::default()
        };
        let dedup = Arc::new(MessageDeduplicator::default());
        let receiver = WebhookReceiver::new(config, handler.clone())
            .with_clock(fixed_clock(NOW))
            .with_deduplicator(dedup.clone());
        let body = body("notification");
        let headers = headers("m11", "notification", SENT_AT, &body);

        let err = receiver.process(&headers, body.as_bytes()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(dedup.is_empty());

        // The platform retries the same message after the 500
        assert_eq!(
            receiver.process(&headers, body.as_bytes()).unwrap(),
            WebhookResponse::Accepted
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        // Delivered now, so a third copy is suppressed
        assert_eq!(
            receiver.process(&headers, body.as_bytes()).unwrap(),
            WebhookResponse::Accepted
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
