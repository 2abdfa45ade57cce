//! Error Module
//!
//! Defines error and result types used throughout the caching proxy.

use thiserror::Error;

/// Main error type for the caching proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("object data is empty")]
    DataNil,

    #[error("cache miss")]
    CacheMiss,

    #[error("initializer is missing")]
    InitializerNil,

    #[error("initializer failed: {0}")]
    InitializerFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("request parse error: {0}")]
    ParseRequest(String),

    #[error("origin dial failed: {0}")]
    DialOrigin(String),

    #[error("hook attach failed: {0}")]
    AttachHook(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

/// Result type alias for the caching proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
