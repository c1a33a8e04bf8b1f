//! Compiled-in cache name and asset manifest

use crate::error::{AgentError, Result};
use crate::types::RequestKey;
use url::Url;

/// Name of the cache bucket. Bump the version suffix to invalidate caches on the next deploy.
pub const CACHE_NAME: &str = "busetas-cr-cache-v1";

/// Assets that must be cached before the agent counts as installed
pub const ASSET_MANIFEST: &[&str] = &[
    "/",
    "/static/manifest.json",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/js/bootstrap.bundle.min.js",
    "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css",
];

/// Ordered list of resource identifiers, relative or absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
    entries: Vec<String>,
}

impl AssetManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// The manifest compiled into the agent
    pub fn compiled() -> Self {
        Self::new(ASSET_MANIFEST.iter().copied())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every entry against the application origin, keeping manifest order.
    ///
    /// Absolute entries pass through unchanged.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<RequestKey>> {
        self.entries
            .iter()
            .map(|entry| {
                let url = origin.join(entry).map_err(|e| {
                    AgentError::Config(format!("invalid manifest entry {:?}: {}", entry, e))
                })?;
                Ok(RequestKey::get(url.as_str()))
            })
            .collect()
    }
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self::compiled()
    }
}

/// Version tag carried by a bucket name, e.g. `1` for `busetas-cr-cache-v1`
pub fn cache_version(name: &str) -> Option<u32> {
    let (_, tag) = name.rsplit_once("-v")?;
    tag.parse().ok()
}
