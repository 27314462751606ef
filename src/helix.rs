use async_trait::async_trait;
use eventsub_relay::backend::twitch::{
    Result, Subscription, SubscriptionApi, SubscriptionRequest, TwitchError,
};
use serde::Deserialize;

pub const HELIX_URL: &str = "https://api.twitch.tv/helix";

/// EventSub subscription response
#[derive(Debug, Clone, Deserialize)]
struct SubscriptionResponse {
    data: Vec<Subscription>,
    #[serde(default)]
    total_cost: u32,
    #[serde(default)]
    max_total_cost: u32,
}

/// `SubscriptionApi` backed by the Helix `eventsub/subscriptions` endpoint.
///
/// Uses a fixed app or user access token; obtaining and refreshing that token
/// is left to whoever writes the config.
pub struct HelixClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    access_token: String,
}

impl HelixClient {
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::with_base_url(HELIX_URL, client_id, access_token)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            access_token: access_token.into(),
        }
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/eventsub/subscriptions", self.base_url)
    }

    async fn error_from(response: reqwest::Response) -> TwitchError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status == reqwest::StatusCode::UNAUTHORIZED {
            TwitchError::Authentication(format!("HTTP {}: {}", status, error_text))
        } else {
            TwitchError::Subscription(format!("HTTP {}: {}", status, error_text))
        }
    }
}

fn http_error(err: reqwest::Error) -> TwitchError {
    TwitchError::Http(err.to_string())
}

#[async_trait]
impl SubscriptionApi for HelixClient {
    async fn create_subscription(&self, request: SubscriptionRequest) -> Result<Subscription> {
        let response = self
            .client
            .post(self.subscriptions_url())
            .bearer_auth(&self.access_token)
            .header("Client-Id", &self.client_id)
            .json(&request)
            .send()
            .await
            .map_err(http_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let subscription_response = response
            .json::<SubscriptionResponse>()
            .await
            .map_err(http_error)?;
        log::info!(
            "Subscribed to {} v{} (cost {}/{})",
            request.subscription_type,
            request.version,
            subscription_response.total_cost,
            subscription_response.max_total_cost
        );
        subscription_response.data.into_iter().next().ok_or_else(|| {
            TwitchError::Subscription(format!(
                "no subscription returned for {}",
                request.subscription_type
            ))
        })
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        let url = format!("{}?id={}", self.subscriptions_url(), urlencoding::encode(id));
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.access_token)
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(http_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        log::info!("Deleted subscription {}", id);
        Ok(())
    }
}
