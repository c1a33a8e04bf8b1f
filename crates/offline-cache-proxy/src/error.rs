//! Error types for the offline cache proxy

use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    Agent(offline_cache_agent::AgentError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Agent(err) => write!(f, "Agent error: {}", err),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Agent(err) => Some(err),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<offline_cache_agent::AgentError> for ProxyError {
    fn from(err: offline_cache_agent::AgentError) -> Self {
        ProxyError::Agent(err)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let err = ProxyError::Agent(offline_cache_agent::AgentError::Install(
            "http://localhost:5000/ returned status 503".to_string(),
        ));
        assert_eq!(
            format!("{}", err),
            "Agent error: Install failed: http://localhost:5000/ returned status 503"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::Config("invalid ORIGIN_URL".to_string());
        assert_eq!(format!("{}", err), "Configuration error: invalid ORIGIN_URL");
    }

    #[test]
    fn test_error_is_debug() {
        let err = ProxyError::Config("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Config"));
    }
}
