use async_trait::async_trait;
use serde::Serialize;

use super::error::Result;
use super::messages::{Condition, Subscription, Transport};

/// EventSub subscription request
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: Condition,
    pub transport: Transport,
}

/// Remote subscription management.
///
/// Implemented by the application's REST client; the facade only calls it.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create_subscription(&self, request: SubscriptionRequest) -> Result<Subscription>;

    async fn delete_subscription(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_websocket_transport() {
        let request = SubscriptionRequest {
            subscription_type: "channel.follow".to_string(),
            version: "2".to_string(),
            condition: Condition::from([("broadcaster_user_id".to_string(), "1234".to_string())]),
            transport: Transport::websocket("AQoQexAWVYKSTIu4ec_2VAxyuhAB"),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "channel.follow",
                "version": "2",
                "condition": {"broadcaster_user_id": "1234"},
                "transport": {"method": "websocket", "session_id": "AQoQexAWVYKSTIu4ec_2VAxyuhAB"}
            })
        );
    }
}
