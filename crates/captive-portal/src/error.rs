//! Error types for the captive portal engine

use crate::models::DeviceId;
use thiserror::Error;

/// Captive portal error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed identity passed to a constructor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No path between two attachment points
    #[error("No path found from {from} to {to}")]
    NoPathFound {
        /// Device the path should start at
        from: DeviceId,
        /// Device the path should end at
        to: DeviceId,
    },

    /// Zero or several matches for an identity expected to be unique
    #[error("Ambiguous resolution: {0}")]
    AmbiguousResolution(String),

    /// Duplicate ids reported by the service catalog
    #[error("Catalog conflict: {0}")]
    CatalogConflict(String),

    /// Service catalog transport or protocol error
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Rule backend refused a rule
    #[error("Rule backend error: {0}")]
    Backend(String),

    /// Packet could not be parsed or rewritten
    #[error("Packet error: {0}")]
    Packet(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport or status error talking to the catalog
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an ambiguous resolution error
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::AmbiguousResolution(message.into())
    }

    /// Create a catalog error
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }

    /// Create a rule backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a packet error
    pub fn packet(message: impl Into<String>) -> Self {
        Self::Packet(message.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
