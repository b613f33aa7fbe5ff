//! # Surge Cluster
//!
//! Distributed mode: generator nodes agree on which workflows to run through a
//! replicated log.
//!
//! ```text
//!   ClusterNode
//!     ├── Membership   SWIM probes, suspicion, gossip piggyback
//!     ├── Replicator   Raft terms, votes, AppendEntries, quorum commit
//!     │       └── Log  in-memory entries, pruning, snapshots
//!     └── Engine       runs committed Start entries locally
//!            ▲
//!   Transport (TCP + HELLO, zstd, AES-256-GCM | in-memory for tests)
//! ```
//!
//! - [`membership`] - alive/suspect/dead/left table with incarnations
//! - [`replication`] - elections and log replication over the live set
//! - [`codec`] - length-prefixed frames, compression and sealing
//! - [`transport`] - request/reply RPC and the in-memory test network
//! - [`node`] - composition and the entry applier

pub mod codec;
pub mod error;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
pub mod replication;
pub mod snapshot;
pub mod transport;

pub use codec::{ClusterKey, FrameCodec, FramedStream, WireConfig, MAX_FRAME};
pub use error::{ClusterError, Result};
pub use log::Log;
pub use membership::{Membership, MembershipConfig};
pub use message::{Command, LogEntry, Member, MemberState, Message, PROTOCOL_VERSION};
pub use node::{ClusterConfig, ClusterNode, NodeReport, NodeState};
pub use replication::{ElectionStatus, ReplicationConfig, ReplicationStatus, Replicator, Role};
pub use transport::{Handler, MemoryNetwork, MemoryTransport, TcpTransport, Transport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{ClusterError, Result};
    pub use crate::message::{Command, MemberState};
    pub use crate::node::{ClusterConfig, ClusterNode};
    pub use crate::replication::{ElectionStatus, Role};
}
