//! Error types for the adapter and its transports

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Pending request {0} was dropped before it resolved")]
    RequestDropped(String),
}

pub type Result<T> = std::result::Result<T, Error>;
