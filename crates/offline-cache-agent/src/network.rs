//! Live network access

use crate::error::{AgentError, Result};
use crate::types::{FetchRequest, StoredResponse};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("offline-cache-agent/", env!("CARGO_PKG_VERSION"));

/// Performs requests against the live network.
///
/// Any HTTP status counts as success. Only failing to obtain a response at
/// all (offline, DNS, connection reset, timeout) is an error.
pub trait Network: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> impl Future<Output = Result<StoredResponse>> + Send;
}

/// HTTP client backed network
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }
}

impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse> {
        let method = reqwest::Method::from_bytes(request.key.method.as_bytes())
            .map_err(|e| AgentError::Network(format!("invalid method: {}", e)))?;

        let mut builder = self.client.request(method, &request.key.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        debug!(request = %request.key, "Fetching from network");
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        debug!(request = %request.key, status, size = body.len(), "Network response");

        Ok(StoredResponse {
            url,
            status,
            headers,
            body,
        })
    }
}
