// src/error.rs

//! Unified error handling for the engine.
//!
//! `AppError` covers everything that can stop an operation. `FetchError` and
//! `SinkError` are the error types of the external collaborators; the
//! scheduler converts them into failed outcomes and never lets them escape a
//! cycle.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid source or strategy binding. Fatal at startup only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Snapshot read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A fetch adapter failed
    #[error("Fetch error for {domain}: {source}")]
    Fetch {
        domain: String,
        #[source]
        source: FetchError,
    },

    /// The sink rejected a batch
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Failure of a coalesced load, shared by every waiting caller
    #[error("{0}")]
    Shared(Arc<AppError>),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a persistence error.
    pub fn persistence(message: impl fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }

    /// Create a fetch error with the domain it happened on.
    pub fn fetch(domain: impl Into<String>, source: FetchError) -> Self {
        Self::Fetch {
            domain: domain.into(),
            source,
        }
    }

    /// True for errors that only invalidate configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Validation(_) | Self::Toml(_))
    }

    /// Recover the adapter-level error, looking through shared loads.
    pub fn to_fetch_error(&self) -> FetchError {
        match self {
            Self::Fetch { source, .. } => source.clone(),
            Self::Shared(inner) => inner.to_fetch_error(),
            Self::Json(e) => FetchError::parse(e),
            other => FetchError::network(other),
        }
    }
}

/// Errors produced by fetch adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS or TLS failure
    #[error("network failure: {0}")]
    Network(String),

    /// Non-success HTTP status; 403 and 429 usually mean the site blocks us
    #[error("HTTP status {status}")]
    Status { status: u16 },

    /// The payload could not be turned into items
    #[error("parse failure: {0}")]
    Parse(String),

    /// The scheduler's per-fetch timeout elapsed
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The adapter task panicked
    #[error("adapter panicked: {0}")]
    Panicked(String),

    /// No adapter is registered for the source
    #[error("no adapter registered")]
    NoAdapter,
}

impl FetchError {
    /// Create a network error.
    pub fn network(message: impl fmt::Display) -> Self {
        Self::Network(message.to_string())
    }

    /// Create a parse error.
    pub fn parse(message: impl fmt::Display) -> Self {
        Self::Parse(message.to_string())
    }

    /// Whether the failure looks like the site is refusing us.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Status { status: 403 | 429 })
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Errors produced by sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The message channel could not be reached
    #[error("transport failure: {0}")]
    Transport(String),

    /// The channel refused the batch
    #[error("batch rejected: {0}")]
    Rejected(String),
}
