//! The cache agent and its three lifecycle handlers

use crate::error::{AgentError, Result};
use crate::manifest::{AssetManifest, CACHE_NAME};
use crate::network::Network;
use crate::storage::CacheStorage;
use crate::types::{FetchOutcome, FetchRequest, FetchSource, RequestKey, StoredResponse};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Signals raised by the host runtime
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(FetchRequest),
}

/// What a handled [`LifecycleEvent`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Installed,
    Activated { deleted: Vec<String> },
    Responded(FetchOutcome),
}

/// Owns one named cache bucket and applies the network-first policy
pub struct CacheAgent<S, N> {
    storage: Arc<S>,
    network: Arc<N>,
    cache_name: String,
    assets: Vec<RequestKey>,
}

impl<S: CacheStorage, N: Network> CacheAgent<S, N> {
    pub fn new(
        cache_name: impl Into<String>,
        assets: Vec<RequestKey>,
        storage: Arc<S>,
        network: Arc<N>,
    ) -> Self {
        Self {
            storage,
            network,
            cache_name: cache_name.into(),
            assets,
        }
    }

    /// Agent using the compiled-in cache name and manifest, resolved against `origin`
    pub fn with_defaults(origin: &Url, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
        let assets = AssetManifest::compiled().resolve(origin)?;
        Ok(Self::new(CACHE_NAME, assets, storage, network))
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn assets(&self) -> &[RequestKey] {
        &self.assets
    }

    /// Whether the bucket already holds every manifest asset, e.g. from an earlier run
    pub async fn is_populated(&self) -> Result<bool> {
        let stored = self.storage.entries(&self.cache_name).await?;
        Ok(self.assets.iter().all(|key| stored.contains(key)))
    }

    /// Populate the bucket with every manifest asset.
    ///
    /// All assets are fetched together and stored in one atomic call. A
    /// network failure or non-2xx status for any asset fails the install and
    /// nothing is stored.
    pub async fn on_install(&self) -> Result<()> {
        self.storage
            .open(&self.cache_name)
            .await
            .map_err(AgentError::into_install)?;
        info!(
            cache = %self.cache_name,
            assets = self.assets.len(),
            "Opened cache, storing assets"
        );

        let entries = try_join_all(self.assets.iter().map(|key| self.fetch_asset(key)))
            .await
            .map_err(AgentError::into_install)?;

        self.storage
            .put_all(&self.cache_name, entries)
            .await
            .map_err(AgentError::into_install)
    }

    async fn fetch_asset(&self, key: &RequestKey) -> Result<(RequestKey, StoredResponse)> {
        let response = self.network.fetch(&FetchRequest::from(key.clone())).await?;
        if !response.is_success() {
            return Err(AgentError::Network(format!(
                "{} returned status {}",
                key.url, response.status
            )));
        }
        Ok((key.clone(), response))
    }

    /// Delete every bucket other than the agent's own. Returns the deleted names.
    ///
    /// Deletions run concurrently and all of them are awaited before the first
    /// failure, if any, is returned.
    pub async fn on_activate(&self) -> Result<Vec<String>> {
        let names = self
            .storage
            .keys()
            .await
            .map_err(AgentError::into_activation)?;

        let storage = &self.storage;
        let deletions = names
            .into_iter()
            .filter(|name| *name != self.cache_name)
            .map(|name| async move {
                info!(cache = %name, "Deleting stale cache");
                storage.delete(&name).await.map(|_| name)
            });

        join_all(deletions)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .map_err(AgentError::into_activation)
    }

    /// Network first, falling back to the bucket only when the network fails outright.
    ///
    /// Network responses are returned as-is whatever their status and are
    /// never written to the bucket.
    pub async fn on_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let err = match self.network.fetch(request).await {
            Ok(response) => {
                return Ok(FetchOutcome {
                    response,
                    source: FetchSource::Network,
                })
            }
            Err(err) => err,
        };

        debug!(request = %request.key, error = %err, "Network failed, trying cache");
        match self
            .storage
            .match_request(&self.cache_name, &request.key)
            .await?
        {
            Some(response) => Ok(FetchOutcome {
                response,
                source: FetchSource::Cache,
            }),
            None => Err(AgentError::FetchFallthrough(format!(
                "{} ({})",
                request.key, err
            ))),
        }
    }

    /// Dispatch a lifecycle event to its handler
    pub async fn handle(&self, event: LifecycleEvent) -> Result<EventOutcome> {
        match event {
            LifecycleEvent::Install => self.on_install().await.map(|()| EventOutcome::Installed),
            LifecycleEvent::Activate => self
                .on_activate()
                .await
                .map(|deleted| EventOutcome::Activated { deleted }),
            LifecycleEvent::Fetch(request) => {
                self.on_fetch(&request).await.map(EventOutcome::Responded)
            }
        }
    }
}
