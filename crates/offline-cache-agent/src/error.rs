//! Error types for the offline cache agent

use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    /// A manifest asset could not be fetched or stored during install
    Install(String),
    /// A stale bucket could not be deleted during activation
    Activation(String),
    /// The network failed and the bucket held no entry for the request
    FetchFallthrough(String),
    Network(String),
    Storage(String),
    Io(Box<std::io::Error>),
    Json(String),
    Config(String),
    Lifecycle(String),
}

impl AgentError {
    /// Wrap an error as an install failure, keeping existing install failures as they are
    pub(crate) fn into_install(self) -> Self {
        match self {
            AgentError::Install(_) => self,
            other => AgentError::Install(other.to_string()),
        }
    }

    /// Wrap an error as an activation failure, keeping existing activation failures as they are
    pub(crate) fn into_activation(self) -> Self {
        match self {
            AgentError::Activation(_) => self,
            other => AgentError::Activation(other.to_string()),
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Install(msg) => write!(f, "Install failed: {}", msg),
            AgentError::Activation(msg) => write!(f, "Activation failed: {}", msg),
            AgentError::FetchFallthrough(msg) => {
                write!(f, "Network unavailable and no cached response: {}", msg)
            }
            AgentError::Network(msg) => write!(f, "Network error: {}", msg),
            AgentError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AgentError::Io(err) => write!(f, "IO error: {}", err),
            AgentError::Json(msg) => write!(f, "JSON error: {}", msg),
            AgentError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AgentError::Lifecycle(msg) => write!(f, "Lifecycle error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(Box::new(err))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Json(err.to_string())
    }
}

impl From<url::ParseError> for AgentError {
    fn from(err: url::ParseError) -> Self {
        AgentError::Config(format!("invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
