//! REST metadata client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use tracing::debug;

use tether_core::{ApiError, ApiResult, ConnectionMetadata, MetadataApi};

/// Default request timeout for metadata fetches.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// REST implementation of [`MetadataApi`].
///
/// Performs an authorized GET against the service's bootstrap endpoint and
/// decodes the response into [`ConnectionMetadata`].
pub struct RestClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl RestClient {
    /// Creates a client for the given bootstrap endpoint.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT)
    }

    /// Creates a client with a custom request timeout.
    pub fn with_timeout(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl MetadataApi for RestClient {
    async fn fetch_connection_metadata(&self) -> ApiResult<ConnectionMetadata> {
        debug!(endpoint = %self.endpoint, "Fetching connection metadata");

        let resp = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<ConnectionMetadata>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}
