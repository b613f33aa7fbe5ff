//! # Cluster Messages
//!
//! Every RPC is one request frame answered by one reply frame.
//!
//! ```text
//!   Probe ─────────────► Ack | Nack        (membership, piggybacked deltas)
//!   IndirectProbe ─────► Ack | Nack        (relay probes the target)
//!   JoinRequest ───────► JoinReply         (full member list)
//!   LeaveNotice ───────► Ack
//!   VoteRequest ───────► VoteReply         (replication)
//!   AppendEntries ─────► AppendReply
//!   Forward ───────────► ForwardReply      (follower to leader push)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use surge_core::{EntryId, NodeId};

/// Wire format revision carried in HELLO
pub const PROTOCOL_VERSION: u16 = 1;

/// SWIM member state; `Dead` and `Left` are absorbing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberState {
    /// Alive or suspected, i.e. still counted toward quorums
    pub fn is_live(self) -> bool {
        matches!(self, Self::Alive | Self::Suspect)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Dead | Self::Left)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Alive => "alive",
            Self::Suspect => "suspect",
            Self::Dead => "dead",
            Self::Left => "left",
        })
    }
}

/// One member as described by some node; also the gossip delta format
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub addr: String,
    pub state: MemberState,
    pub incarnation: u64,
}

/// Replicated control command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Written by every new leader
    Noop,
    /// Select a registered workflow and its option overrides
    Workflow {
        name: String,
        overrides: Vec<(String, String)>,
    },
    Start { workflow: String },
    Stop { workflow: String },
}

/// One replication log slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub id: EntryId,
    /// Unix milliseconds when the leader accepted the entry
    pub created_ms: u64,
    pub command: Command,
}

/// Why a forwarded push was refused
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refusal {
    NoLeader,
    Timeout { millis: u64 },
    Failed(String),
}

/// Connection preamble, exchanged unencrypted and uncompressed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u16,
    pub compress: bool,
    pub encrypt: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // === Membership ===
    Probe {
        src: NodeId,
        seq: u64,
        updates: Vec<Member>,
    },
    Ack {
        src: NodeId,
        seq: u64,
        updates: Vec<Member>,
    },
    Nack {
        src: NodeId,
        seq: u64,
    },
    IndirectProbe {
        target: NodeId,
        src: NodeId,
        seq: u64,
    },
    JoinRequest {
        src: NodeId,
        addr: String,
    },
    JoinReply {
        members: Vec<Member>,
    },
    LeaveNotice {
        src: NodeId,
        incarnation: u64,
    },

    // === Replication ===
    VoteRequest {
        term: u64,
        candidate: NodeId,
        last_index: u64,
        last_term: u64,
    },
    VoteReply {
        term: u64,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        leader: NodeId,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_idx: u64,
        /// `prev_index` is the leader's pruned base; a follower behind it
        /// restarts its log there
        rebase: bool,
    },
    AppendReply {
        term: u64,
        success: bool,
        last_index: u64,
    },
    Forward {
        commands: Vec<Command>,
    },
    ForwardReply {
        result: Result<Vec<EntryId>, Refusal>,
    },
}

impl Message {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Probe { .. } => "probe",
            Self::Ack { .. } => "ack",
            Self::Nack { .. } => "nack",
            Self::IndirectProbe { .. } => "indirect-probe",
            Self::JoinRequest { .. } => "join-request",
            Self::JoinReply { .. } => "join-reply",
            Self::LeaveNotice { .. } => "leave-notice",
            Self::VoteRequest { .. } => "vote-request",
            Self::VoteReply { .. } => "vote-reply",
            Self::AppendEntries { .. } => "append-entries",
            Self::AppendReply { .. } => "append-reply",
            Self::Forward { .. } => "forward",
            Self::ForwardReply { .. } => "forward-reply",
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            Self::Probe { .. }
                | Self::IndirectProbe { .. }
                | Self::JoinRequest { .. }
                | Self::LeaveNotice { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_state_classes() {
        assert!(MemberState::Suspect.is_live());
        assert!(!MemberState::Dead.is_live());
        assert!(MemberState::Left.is_terminal());
        assert_eq!(MemberState::Suspect.to_string(), "suspect");
    }

    #[test]
    fn test_bincode_append_entries() {
        let msg = Message::AppendEntries {
            term: 4,
            leader: NodeId(2),
            prev_index: 9,
            prev_term: 3,
            entries: vec![LogEntry {
                index: 10,
                term: 4,
                id: EntryId::compose(1_000, 2, 0),
                created_ms: 1_700_000_000_000,
                command: Command::Workflow {
                    name: "checkout".into(),
                    overrides: vec![("vus".into(), "10".into())],
                },
            }],
            commit_idx: 9,
            rebase: false,
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.name(), "append-entries");
        assert!(!back.is_membership());
    }

    #[test]
    fn test_forward_reply_carries_refusal() {
        let msg = Message::ForwardReply {
            result: Err(Refusal::NoLeader),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
