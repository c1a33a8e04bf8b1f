//! Offline Cache Proxy
//!
//! Serves an application origin through the offline cache agent: the asset
//! manifest is cached at start-up and requests fall back to the cache
//! whenever the origin cannot be reached.

mod config;
mod error;
mod server;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::server::{start_server, ServerState, SharedState};
use offline_cache_agent::{
    AgentError, AgentHost, AssetManifest, CacheAgent, FileStorage, HttpNetwork, Startup,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("offline_cache_proxy=info".parse()?)
        .add_directive("offline_cache_agent=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting offline cache proxy...");

    let config = ProxyConfig::from_env()?;
    info!("Port: {}", config.port);
    info!("Origin: {}", config.origin);
    info!("Cache dir: {:?}", config.cache_dir);

    let storage = Arc::new(FileStorage::new(config.cache_dir));
    storage.init().await?;
    let network = Arc::new(HttpNetwork::new(config.fetch_timeout)?);

    // Install and activate the agent before serving anything. An offline
    // origin falls back to the bucket left by the previous run.
    let host = AgentHost::new(Arc::clone(&network));
    let agent = CacheAgent::with_defaults(&config.origin, Arc::clone(&storage), network)?;
    match host.start(agent).await {
        Ok(Startup::Installed { deleted }) => {
            info!(stale_buckets = deleted.len(), "Agent ready")
        }
        Ok(Startup::Restored) => info!("Agent ready from previous run's cache"),
        Err(AgentError::Activation(e)) => warn!(error = %e, "Agent active but stale caches remain"),
        Err(e) => return Err(e.into()),
    }

    let state = ServerState::new(host, storage, config.origin)
        .with_manifest_origins(&AssetManifest::compiled())?;
    let state: SharedState = Arc::new(state);

    // Start HTTP server (blocking)
    start_server(state, config.port)
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
