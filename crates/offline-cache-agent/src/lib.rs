//! Offline Cache Agent
//!
//! Network-first request handling with a versioned cache bucket as the
//! fallback when the network is unreachable. The agent pre-caches a fixed
//! asset manifest at install, deletes buckets from older versions at
//! activation, and serves cached responses only when a live fetch fails
//! outright.

pub mod agent;
pub mod error;
pub mod file_storage;
pub mod lifecycle;
pub mod manifest;
pub mod network;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use agent::{CacheAgent, EventOutcome, LifecycleEvent};
pub use error::{AgentError, Result};
pub use file_storage::FileStorage;
pub use lifecycle::{AgentHost, AgentState, IncarnationStatus, Startup};
pub use manifest::{cache_version, AssetManifest, ASSET_MANIFEST, CACHE_NAME};
pub use network::{HttpNetwork, Network};
pub use storage::{CacheStorage, MemoryStorage};
pub use types::{CacheStats, FetchOutcome, FetchRequest, FetchSource, RequestKey, StoredResponse};
