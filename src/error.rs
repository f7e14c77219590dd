//! Error types for the synchronization agent

use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Declaration failed schema validation or structural checks
    #[error("validation error: {0}")]
    Validation(String),

    /// Template declares a partition the agent manages itself
    #[error("reserved partition error: {0}")]
    ReservedPartition(String),

    /// A fragment update arrived from a source the agent is not bound to
    #[error("not configured for this source: {0}")]
    NotConfigured(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// HTTP transport or client construction error
    #[error("http error: {0}")]
    Http(String),

    /// Device preflight found an incompatible AS3 service version
    #[error("unsupported AS3 version: {0}")]
    UnsupportedVersion(String),

    /// The mailbox to the delivery worker is closed
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a reserved-partition error with the given message
    pub fn reserved_partition(msg: impl Into<String>) -> Self {
        Self::ReservedPartition(msg.into())
    }

    /// Create a not-configured error with the given message
    pub fn not_configured(msg: impl Into<String>) -> Self {
        Self::NotConfigured(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an HTTP error with the given message
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an unsupported-version error with the given message
    pub fn unsupported_version(msg: impl Into<String>) -> Self {
        Self::UnsupportedVersion(msg.into())
    }
}
