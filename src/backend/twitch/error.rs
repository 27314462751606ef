use axum::http::StatusCode;
use thiserror::Error;

/// Errors that can occur while receiving or managing EventSub deliveries
#[derive(Debug, Error)]
pub enum TwitchError {
    /// Bad or missing webhook signature
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Malformed body, missing header, stale timestamp, rejected verification
    #[error("Validation error: {0}")]
    Validation(String),

    /// Webhook body exceeded the configured limit
    #[error("Payload too large: body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Dial error, handshake timeout, read or write error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unexpected frame type or unparseable payload
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Connection closed by the server
    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// A connect or reconnect is already in flight
    #[error("Already connecting")]
    AlreadyConnecting,

    /// Operation requires an active session
    #[error("Not connected")]
    NotConnected,

    /// The session was closed while the operation was in flight
    #[error("Session closed")]
    Closed,

    /// An application handler panicked during dispatch
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Event payload did not match the requested schema
    #[error("Decode error: {0}")]
    Decode(String),

    /// The subscription REST collaborator failed to complete a request
    #[error("HTTP error: {0}")]
    Http(String),

    /// EventSub subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TwitchError {
    /// HTTP status used when this error terminates a webhook request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TwitchError::Authentication(_) => StatusCode::FORBIDDEN,
            TwitchError::Validation(_) | TwitchError::Protocol(_) | TwitchError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            TwitchError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures that end a WebSocket connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TwitchError::Transport(_) | TwitchError::ConnectionClosed { .. }
        )
    }
}

impl From<serde_json::Error> for TwitchError {
    fn from(err: serde_json::Error) -> Self {
        TwitchError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TwitchError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TwitchError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TwitchError>;
