//! Error types for capability plugins and plugin resolution.

use thiserror::Error;

/// Result type alias for capability calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by capability plugin calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("node creation failed: {0}")]
    CreateNode(String),

    #[error("configuration apply failed: {0}")]
    ApplyConfiguration(String),

    #[error("remote command failed: {0}")]
    Command(String),

    #[error("remote command gave up after {attempts} attempts: {reason}")]
    CommandExhausted { attempts: u32, reason: String },

    #[error("teardown failed: {0}")]
    Kill(String),

    #[error("load balancer error: {0}")]
    Balancer(String),

    #[error("dns error: {0}")]
    Dns(String),
}

/// A named plugin was not registered.
#[derive(Debug, Error)]
#[error("no {kind} plugin registered under {name:?}")]
pub struct RegistryError {
    pub kind: &'static str,
    pub name: String,
}
