//! Error types for the cache manager.
//!
//! A cache miss is never an error: lookups return `Option`. Network failures
//! are recoverable and drive the strategy fallbacks; only a request with no
//! network, no cached copy and no offline placeholder surfaces as
//! [`CacheError::Exhausted`].

use thiserror::Error;

use crate::control::ChannelError;

/// Failure to obtain a response from the network.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch of {url} timed out after {after_ms} ms")]
    Timeout { url: String, after_ms: u64 },

    #[error("fetch of {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("cannot fetch {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Errors surfaced by [`CacheManager`](crate::CacheManager) operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Network(#[from] FetchError),

    #[error("no network, cached copy, or offline placeholder for {key}")]
    Exhausted { key: String },

    #[error("install failed while precaching {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("operation not allowed while {state}")]
    InvalidState { state: &'static str },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Returns `true` when the failure came from the network rather than
    /// from the manager itself.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Exhausted { .. })
    }
}
