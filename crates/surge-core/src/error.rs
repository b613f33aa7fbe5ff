//! Error types for Surge operations
//!
//! Every failure the framework can report belongs to one of a closed set of
//! [`ErrorKind`]s. Load-time and control-plane failures travel as
//! [`SurgeError`]; operation-level failures are folded into result records
//! and never surface as `Err` from a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for Surge operations
pub type Result<T> = std::result::Result<T, SurgeError>;

/// Closed set of error classes reported in results and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing predecessor, cycle, unknown persona
    InvalidWorkflow,
    /// Name resolution failed
    Dns,
    /// TCP/TLS/QUIC dial failed
    Connect,
    /// Per-phase or total timeout elapsed
    Timeout,
    /// Malformed response, H2 framing error, HPACK error
    Protocol,
    /// Run-level cancellation
    Cancelled,
    /// Local rate limiter rejected the operation
    RateLimited,
    /// Sink connect/submit failed
    SinkUnavailable,
    /// Replication call with no known leader
    ClusterNoLeader,
    /// Append/vote carried a term older than the receiver's
    ClusterStaleTerm,
}

impl ErrorKind {
    /// Stable name used in reports and error histograms
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidWorkflow => "ErrInvalidWorkflow",
            Self::Dns => "ErrDNS",
            Self::Connect => "ErrConnect",
            Self::Timeout => "ErrTimeout",
            Self::Protocol => "ErrProtocol",
            Self::Cancelled => "ErrCancelled",
            Self::RateLimited => "ErrRateLimited",
            Self::SinkUnavailable => "ErrSinkUnavailable",
            Self::ClusterNoLeader => "ErrClusterNoLeader",
            Self::ClusterStaleTerm => "ErrClusterStaleTerm",
        }
    }

    /// Kinds a step may re-execute on (fresh connection, same request)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by Surge outside of individual operations
#[derive(Error, Debug, Clone)]
pub enum SurgeError {
    // === Workflow Loading ===
    /// A step names a predecessor that is not declared
    #[error("Step `{step}` depends on unknown step `{predecessor}`")]
    MissingPredecessor { step: String, predecessor: String },

    /// Two steps share a name
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    /// The dependency graph is not acyclic
    #[error("Workflow contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// Persona name not recognized
    #[error("Unknown persona: {0}")]
    UnknownPersona(String),

    /// Malformed option value
    #[error("Invalid option `{option}`: {reason}")]
    InvalidOption { option: String, reason: String },

    /// URL could not be parsed
    #[error("Invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    // === Operations ===
    /// Resolution failed
    #[error("DNS lookup for {host} failed: {reason}")]
    Dns { host: String, reason: String },

    /// Dial failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Deadline elapsed
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Peer violated the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Run cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Limiter rejected
    #[error("Rate limit exceeded for step {0}")]
    RateLimited(String),

    // === Sinks ===
    /// Sink failure
    #[error("Sink `{sink}` unavailable: {reason}")]
    SinkUnavailable { sink: String, reason: String },

    // === Cluster ===
    /// No leader known or reachable
    #[error("No cluster leader available")]
    NoLeader,

    /// Request carried an outdated term
    #[error("Stale term {term}, current term is {current}")]
    StaleTerm { term: u64, current: u64 },

    // === General ===
    /// I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SurgeError {
    /// Closed-set classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingPredecessor { .. }
            | Self::DuplicateStep(_)
            | Self::Cycle(_)
            | Self::UnknownPersona(_)
            | Self::InvalidOption { .. }
            | Self::InvalidUrl { .. } => ErrorKind::InvalidWorkflow,
            Self::Dns { .. } => ErrorKind::Dns,
            Self::Connect(_) => ErrorKind::Connect,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::SinkUnavailable { .. } => ErrorKind::SinkUnavailable,
            Self::NoLeader => ErrorKind::ClusterNoLeader,
            Self::StaleTerm { .. } => ErrorKind::ClusterStaleTerm,
            Self::Protocol(_) | Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Protocol
            }
        }
    }

    /// Numeric code for machine-readable output
    pub fn code(&self) -> u32 {
        match self.kind() {
            ErrorKind::InvalidWorkflow => 1001,
            ErrorKind::Dns => 2001,
            ErrorKind::Connect => 2002,
            ErrorKind::Timeout => 2003,
            ErrorKind::Protocol => 2004,
            ErrorKind::Cancelled => 2005,
            ErrorKind::RateLimited => 2006,
            ErrorKind::SinkUnavailable => 3001,
            ErrorKind::ClusterNoLeader => 4001,
            ErrorKind::ClusterStaleTerm => 4002,
        }
    }

    /// Whether a caller may retry the failed call
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connect
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::SinkUnavailable
                | ErrorKind::ClusterNoLeader
        )
    }
}

impl From<std::io::Error> for SurgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::Dns.as_str(), "ErrDNS");
        assert_eq!(ErrorKind::ClusterNoLeader.to_string(), "ErrClusterNoLeader");
    }

    #[test]
    fn test_load_errors_are_invalid_workflow() {
        let err = SurgeError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.kind(), ErrorKind::InvalidWorkflow);
        assert_eq!(err.to_string(), "Workflow contains a cycle through: a, b");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_cluster_errors() {
        assert!(SurgeError::NoLeader.is_recoverable());
        let stale = SurgeError::StaleTerm { term: 1, current: 3 };
        assert_eq!(stale.kind(), ErrorKind::ClusterStaleTerm);
        assert_eq!(stale.code(), 4002);
    }
}
