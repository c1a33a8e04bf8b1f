//! Host side of the agent lifecycle
//!
//! [`AgentHost`] plays the part of the runtime: it installs new agent
//! incarnations, promotes a waiting one on activation, retires the one it
//! replaces, and routes intercepted requests to whichever is active.

use crate::agent::CacheAgent;
use crate::error::{AgentError, Result};
use crate::network::Network;
use crate::storage::CacheStorage;
use crate::types::{FetchOutcome, FetchRequest, FetchSource};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lifecycle state of one agent incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Unregistered,
    Installing,
    /// Installed and waiting to be activated
    Installed,
    Activating,
    Active,
    Redundant,
}

impl AgentState {
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Unregistered, Installing)
                | (Installing, Installed)
                | (Installing, Redundant)
                | (Installed, Activating)
                | (Installed, Redundant)
                | (Activating, Active)
                | (Active, Redundant)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Unregistered => "unregistered",
            AgentState::Installing => "installing",
            AgentState::Installed => "installed",
            AgentState::Activating => "activating",
            AgentState::Active => "active",
            AgentState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// How [`AgentHost::start`] brought its agent up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// Freshly installed and activated; `deleted` lists removed stale buckets
    Installed { deleted: Vec<String> },
    /// Install failed and the bucket from an earlier run is served
    Restored,
}

/// Snapshot of an incarnation for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncarnationStatus {
    pub id: u64,
    pub cache_name: String,
    pub state: AgentState,
}

struct Incarnation<S, N> {
    id: u64,
    agent: Arc<CacheAgent<S, N>>,
    state: AgentState,
}

impl<S: CacheStorage, N: Network> Incarnation<S, N> {
    fn transition(&mut self, next: AgentState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AgentError::Lifecycle(format!(
                "incarnation {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        debug!(id = self.id, from = %self.state, to = %next, "Agent state change");
        self.state = next;
        Ok(())
    }

    fn status(&self) -> IncarnationStatus {
        IncarnationStatus {
            id: self.id,
            cache_name: self.agent.cache_name().to_string(),
            state: self.state,
        }
    }
}

struct Slots<S, N> {
    active: Option<Incarnation<S, N>>,
    waiting: Option<Incarnation<S, N>>,
    retired: Vec<IncarnationStatus>,
}

impl<S: CacheStorage, N: Network> Slots<S, N> {
    fn retire(&mut self, mut incarnation: Incarnation<S, N>) -> Result<()> {
        incarnation.transition(AgentState::Redundant)?;
        info!(
            id = incarnation.id,
            cache = %incarnation.agent.cache_name(),
            "Agent is redundant"
        );
        self.retired.push(incarnation.status());
        Ok(())
    }
}

/// Drives agent incarnations through install and activation and routes fetches
pub struct AgentHost<S, N> {
    network: Arc<N>,
    slots: RwLock<Slots<S, N>>,
    next_id: AtomicU64,
}

impl<S: CacheStorage, N: Network> AgentHost<S, N> {
    /// `network` serves requests while no incarnation is active
    pub fn new(network: Arc<N>) -> Self {
        Self {
            network,
            slots: RwLock::new(Slots {
                active: None,
                waiting: None,
                retired: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install a new incarnation. On success it waits for [`AgentHost::activate`].
    ///
    /// A failed install leaves the incarnation redundant and any active one in place.
    pub async fn register(&self, agent: CacheAgent<S, N>) -> Result<u64> {
        self.install(Arc::new(agent)).await
    }

    async fn install(&self, agent: Arc<CacheAgent<S, N>>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut incarnation = Incarnation {
            id,
            agent,
            state: AgentState::Unregistered,
        };

        incarnation.transition(AgentState::Installing)?;
        let installed = incarnation.agent.on_install().await;

        let mut slots = self.slots.write().await;
        match installed {
            Ok(()) => {
                incarnation.transition(AgentState::Installed)?;
                info!(id, cache = %incarnation.agent.cache_name(), "Agent installed");
                if let Some(previous) = slots.waiting.replace(incarnation) {
                    slots.retire(previous)?;
                }
                Ok(id)
            }
            Err(e) => {
                warn!(id, error = %e, "Agent install failed");
                slots.retire(incarnation)?;
                Err(e)
            }
        }
    }

    /// Activate the waiting incarnation and retire the one it replaces.
    ///
    /// Fetches are held back until activation finishes. If stale buckets
    /// could not be deleted the incarnation still becomes active and the
    /// activation error is returned.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut slots = self.slots.write().await;
        let mut incarnation = slots
            .waiting
            .take()
            .ok_or_else(|| AgentError::Lifecycle("no installed agent is waiting".to_string()))?;

        incarnation.transition(AgentState::Activating)?;
        let activated = incarnation.agent.on_activate().await;
        incarnation.transition(AgentState::Active)?;
        info!(
            id = incarnation.id,
            cache = %incarnation.agent.cache_name(),
            "Agent active"
        );

        if let Some(previous) = slots.active.replace(incarnation) {
            slots.retire(previous)?;
        }

        activated.map_err(|e| {
            warn!(error = %e, "Agent activated with errors");
            e
        })
    }

    /// Bring up `agent` when the host starts.
    ///
    /// The agent is installed and activated. If the install fails but the
    /// agent's bucket still holds every asset from an earlier run, that
    /// bucket is adopted as the active incarnation instead. The install error
    /// is returned only when there is nothing to fall back to.
    pub async fn start(&self, agent: CacheAgent<S, N>) -> Result<Startup> {
        let agent = Arc::new(agent);
        match self.install(Arc::clone(&agent)).await {
            Ok(_) => self
                .activate()
                .await
                .map(|deleted| Startup::Installed { deleted }),
            Err(e) => {
                if !agent.is_populated().await? {
                    return Err(e);
                }
                warn!(
                    cache = %agent.cache_name(),
                    error = %e,
                    "Install failed, serving cache from previous run"
                );
                self.adopt(agent).await?;
                Ok(Startup::Restored)
            }
        }
    }

    /// Make an already installed and activated bucket the active incarnation.
    /// The handlers are not run again.
    async fn adopt(&self, agent: Arc<CacheAgent<S, N>>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut incarnation = Incarnation {
            id,
            agent,
            state: AgentState::Unregistered,
        };
        for state in [
            AgentState::Installing,
            AgentState::Installed,
            AgentState::Activating,
            AgentState::Active,
        ] {
            incarnation.transition(state)?;
        }
        info!(id, cache = %incarnation.agent.cache_name(), "Agent restored");

        let mut slots = self.slots.write().await;
        if let Some(previous) = slots.active.replace(incarnation) {
            slots.retire(previous)?;
        }
        Ok(id)
    }

    /// Route a request through the active incarnation, or straight to the network if none is active
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let agent = {
            let slots = self.slots.read().await;
            slots.active.as_ref().map(|i| Arc::clone(&i.agent))
        };

        match agent {
            Some(agent) => agent.on_fetch(request).await,
            None => {
                let response = self.network.fetch(request).await?;
                Ok(FetchOutcome {
                    response,
                    source: FetchSource::Network,
                })
            }
        }
    }

    /// Cache name of the active incarnation
    pub async fn active_cache_name(&self) -> Option<String> {
        let slots = self.slots.read().await;
        slots
            .active
            .as_ref()
            .map(|i| i.agent.cache_name().to_string())
    }

    /// Every incarnation the host has seen, retired ones first
    pub async fn statuses(&self) -> Vec<IncarnationStatus> {
        let slots = self.slots.read().await;
        let mut statuses = slots.retired.clone();
        statuses.extend(slots.active.as_ref().map(Incarnation::status));
        statuses.extend(slots.waiting.as_ref().map(Incarnation::status));
        statuses
    }
}
