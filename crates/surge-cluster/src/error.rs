//! Cluster error types

use std::time::Duration;
use thiserror::Error;

use surge_core::{ErrorKind, NodeId, SurgeError};

/// Errors raised by the cluster control plane
#[derive(Error, Debug)]
pub enum ClusterError {
    // === Wire ===
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Frame could not be authenticated")]
    Decrypt,

    #[error("Invalid cluster key: {0}")]
    InvalidKey(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    // === Peers ===
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Unknown member {0}")]
    UnknownMember(NodeId),

    // === Replication ===
    #[error("No cluster leader available")]
    NoLeader,

    #[error("Stale term {term}, current term is {current}")]
    StaleTerm { term: u64, current: u64 },

    #[error("Rejected by leader: {0}")]
    Rejected(String),

    // === Snapshots ===
    #[error("Corrupt snapshot: {0}")]
    Snapshot(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoLeader => ErrorKind::ClusterNoLeader,
            Self::StaleTerm { .. } => ErrorKind::ClusterStaleTerm,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unreachable(_) | Self::Closed => ErrorKind::Connect,
            _ => ErrorKind::Protocol,
        }
    }

    /// Worth another attempt after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoLeader | Self::Timeout(_) | Self::Unreachable(_) | Self::Closed
        )
    }
}

impl From<ClusterError> for SurgeError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NoLeader => SurgeError::NoLeader,
            ClusterError::StaleTerm { term, current } => SurgeError::StaleTerm { term, current },
            ClusterError::Timeout(after) => SurgeError::Timeout(after),
            ClusterError::Unreachable(peer) => SurgeError::Connect(peer),
            ClusterError::Io(e) => SurgeError::Io(e.to_string()),
            ClusterError::Encode(e) => SurgeError::Serialization(e.to_string()),
            other => SurgeError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ClusterError::NoLeader.kind(), ErrorKind::ClusterNoLeader);
        let stale = ClusterError::StaleTerm { term: 1, current: 3 };
        assert_eq!(stale.kind(), ErrorKind::ClusterStaleTerm);
        assert_eq!(ClusterError::Decrypt.kind(), ErrorKind::Protocol);
        assert!(ClusterError::NoLeader.is_transient());
        assert!(!ClusterError::Decrypt.is_transient());
    }

    #[test]
    fn test_into_surge_error() {
        let err: SurgeError = ClusterError::StaleTerm { term: 2, current: 5 }.into();
        assert_eq!(err.kind(), ErrorKind::ClusterStaleTerm);
        let err: SurgeError = ClusterError::NoLeader.into();
        assert_eq!(err.code(), 4001);
    }
}
