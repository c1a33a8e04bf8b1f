use crate::error::{ProxyError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Proxy configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    /// Application origin that intercepted paths and relative manifest entries resolve against
    pub origin: Url,
    pub cache_dir: PathBuf,
    pub fetch_timeout: Duration,
}

impl ProxyConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(3005);

        let origin_raw =
            lookup("ORIGIN_URL").unwrap_or_else(|| "http://localhost:5000".to_string());
        let origin = Url::parse(&origin_raw)
            .map_err(|e| ProxyError::Config(format!("invalid ORIGIN_URL {}: {}", origin_raw, e)))?;
        if origin.cannot_be_a_base() {
            return Err(ProxyError::Config(format!(
                "ORIGIN_URL {} cannot be used as a base URL",
                origin_raw
            )));
        }

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./cache/offline"));

        let fetch_timeout = lookup("FETCH_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            port,
            origin,
            cache_dir,
            fetch_timeout,
        })
    }
}
