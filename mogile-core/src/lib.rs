//! Mogile Core - MogileFS tracker client and big-file support
//!
//! This crate provides the building blocks for talking to a MogileFS
//! installation: the tracker line protocol, connection failover, the
//! logical directory operations, HTTP transfer to storage nodes, and the
//! chunked big-file layer that splits oversized payloads across many keys.

pub mod bigfile;
pub mod client;
pub mod config;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tracing_setup;
pub mod tracker;
pub mod transfer;

// Re-export main types for convenient access
pub use bigfile::{BigFileCodec, BigFileManifest, ChunkChecksum, ChunkDescriptor};
pub use client::MogileClient;
pub use config::{HostEndpoint, MogileConfig};
pub use tracker::{ObjectDirectory, TrackerConnection, TrackerResponse};
pub use transfer::{ObjectTransfer, ReproxyTarget, ReproxyUrls};

/// Errors surfaced by every layer of the client.
///
/// Variants map one-to-one onto the failure classes callers need to tell
/// apart: a timed out read may be retried, a refused request or corrupted
/// chunk may not.
#[derive(Debug, thiserror::Error)]
pub enum MogileError {
    #[error("Unable to connect to tracker: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Tracker read timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Error writing command: {reason}")]
    Write { reason: String },

    #[error("Error reading response: {reason}")]
    Read { reason: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("mogilefs: {message}")]
    Remote { message: String },

    #[error("Transfer to {url} failed: {reason}")]
    Transfer { url: String, reason: String },

    #[error("Unable to open any of {attempted} paths")]
    Unavailable { attempted: usize },

    #[error("Chunk {index} failed verification: {reason}")]
    Integrity { index: u32, reason: String },

    #[error("Chunk {index} did not replicate, waited {waited_secs} seconds")]
    ReplicationTimeout { index: u32, waited_secs: u64 },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MogileError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            MogileError::ConnectionFailed { .. } => "No tracker is reachable".to_string(),
            MogileError::Timeout { .. } => "Tracker did not answer in time".to_string(),
            MogileError::Remote { message } => format!("Tracker refused the request: {message}"),
            MogileError::Unavailable { .. } => "No replica of the file could be read".to_string(),
            MogileError::Integrity { index, .. } => {
                format!("Chunk {index} is corrupted, refusing to reassemble")
            }
            MogileError::ReplicationTimeout { index, .. } => {
                format!("Chunk {index} never reached enough replicas")
            }
            MogileError::Configuration { reason } => format!("Invalid settings: {reason}"),
            MogileError::Cancelled => "Operation cancelled".to_string(),
            MogileError::Io(_) => "File system error occurred".to_string(),
            _ => "Tracker communication error occurred".to_string(),
        }
    }

    /// Checks if the failed request may succeed when issued again.
    ///
    /// Only read timeouts qualify; a closed or desynchronized connection
    /// has to be reconnected by the caller first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MogileError::Timeout { .. })
    }

    /// Checks if this error is due to invalid caller-supplied settings.
    pub fn is_user_error(&self) -> bool {
        matches!(self, MogileError::Configuration { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        MogileError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        MogileError::Configuration {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MogileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(MogileError::Timeout { timeout_ms: 1000 }.is_retryable());
        assert!(
            !MogileError::Read {
                reason: "connection closed".to_string()
            }
            .is_retryable()
        );
        assert!(!MogileError::protocol("bad line").is_retryable());
    }

    #[test]
    fn test_remote_error_passes_message_through() {
        let error = MogileError::Remote {
            message: "ERR unknown_key unknown_key".to_string(),
        };
        assert_eq!(error.to_string(), "mogilefs: ERR unknown_key unknown_key");
    }

    #[test]
    fn test_configuration_is_user_error() {
        assert!(MogileError::configuration("chunk too large").is_user_error());
        assert!(!MogileError::Cancelled.is_user_error());
    }
}
