use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the Garm engine
#[derive(Debug, Clone, Error)]
pub enum GarmError {
    // IO errors
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Configuration errors
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),
    #[error("Invalid upstream resolver: {0}")]
    InvalidUpstream(String),
    #[error("Invalid host source: {0}")]
    InvalidHostSource(String),
    #[error("Invalid app inclusion: {0}")]
    InvalidAppInclusion(String),

    // Tunnel errors
    #[error("Tunnel device error: {0}")]
    Tunnel(String),
    #[error("Tunnel device unavailable")]
    TunnelUnavailable,

    // Upstream errors
    #[error("Upstream socket error: {0}")]
    UpstreamSocket(String),
    #[error("No upstream resolver available")]
    NoResolver,

    // Engine state errors
    #[error("Control queue full, command dropped")]
    ControlQueueFull,
    #[error("Engine is shutting down")]
    Shutdown,

    // Persistence errors
    #[error("Block log persistence error: {0}")]
    BlockLog(String),
}

impl From<std::io::Error> for GarmError {
    fn from(err: std::io::Error) -> Self {
        GarmError::IoError(Arc::new(err))
    }
}

impl From<serde_json::Error> for GarmError {
    fn from(err: serde_json::Error) -> Self {
        GarmError::ConfigParse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GarmError>;
