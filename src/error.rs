//! Error types for haproxy-sync.

use thiserror::Error;

/// Errors that can occur while synchronizing proxy state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Coordination store error
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    /// DNS provider error
    #[error("DNS provider error: {0}")]
    Provider(#[from] ProviderError),

    /// HTTP client error (from client initialization)
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Configuration source could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Rendered artifacts could not be installed
    #[error("Failed to install {path}: {source}")]
    Install {
        /// Path that was being written.
        path: String,
        /// Underlying IO failure.
        source: std::io::Error,
    },

    /// Proxy reload signal failed
    #[error("Proxy reload failed: {0}")]
    Reload(String),
}

/// Errors returned by a coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key does not exist
    #[error("key not found: {0}")]
    NotFound(String),

    /// Conditional create found an existing key
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// Request did not complete within its deadline
    #[error("request timed out")]
    Timeout,

    /// Transport failure talking to the store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Store returned an error document
    #[error("store error {code}: {message}")]
    Api {
        /// Store specific error code.
        code: u64,
        /// Human readable message.
        message: String,
    },

    /// Response could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),

    /// Watch channel closed
    #[error("watch closed")]
    Closed,
}

/// Errors returned by a DNS provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport failure talking to the provider
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider rejected the request
    #[error("provider returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or message.
        message: String,
    },

    /// Record id is unknown to the provider
    #[error("record {0} not found")]
    NotFound(u64),

    /// Request did not complete within its deadline
    #[error("request timed out")]
    Timeout,
}

impl StoreError {
    /// Whether this error means the key is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
