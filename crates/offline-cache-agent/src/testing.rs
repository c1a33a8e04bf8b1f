//! Scripted network for tests

use crate::error::{AgentError, Result};
use crate::network::Network;
use crate::types::{FetchRequest, StoredResponse};
use std::collections::HashMap;
use std::sync::Mutex;

/// Network that answers from a table of canned responses.
///
/// URLs without a canned response fail as if offline.
#[derive(Default)]
pub struct ScriptedNetwork {
    responses: Mutex<HashMap<String, StoredResponse>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), StoredResponse::new(url, status, body));
    }

    /// Make every request fail
    pub fn go_offline(&self) {
        self.responses.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse> {
        self.requests.lock().unwrap().push(request.key.url.clone());
        let reply = self.responses.lock().unwrap().get(&request.key.url).cloned();
        reply.ok_or_else(|| AgentError::Network(format!("offline: {}", request.key.url)))
    }
}
