//! Request and response types shared by the agent, storage and network layers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a request inside a cache bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    /// A GET request for `url`
    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An outgoing request as seen by the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: RequestKey,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchRequest {
    pub fn get(url: &str) -> Self {
        Self::from(RequestKey::get(url))
    }
}

impl From<RequestKey> for FetchRequest {
    fn from(key: RequestKey) -> Self {
        Self {
            key,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// A response as returned by the network or stored in a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.to_string(),
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup, first match wins
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Where a response handed back to the caller came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Network,
    Cache,
}

/// Result of an intercepted fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub response: StoredResponse,
    pub source: FetchSource,
}

/// Statistics about cache storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub buckets: usize,
    pub entries: usize,
    pub total_size: u64,
}
