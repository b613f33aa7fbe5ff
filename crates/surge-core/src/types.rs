//! Basic types shared across Surge crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SurgeError;

/// Position of a step inside its workflow's step arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepIndex(pub usize);

impl StepIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for StepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identity of a cluster node
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Low 10 bits, used as the node field of entry ids
    pub fn worker_bits(self) -> u16 {
        (self.0 & 0x3ff) as u16
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Wire protocol a step speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Http1,
    Http2,
    Http3,
    Grpc,
    Graphql,
    Websocket,
    Udp,
    Browser,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 8] = [
        Self::Http1,
        Self::Http2,
        Self::Http3,
        Self::Grpc,
        Self::Graphql,
        Self::Websocket,
        Self::Udp,
        Self::Browser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http1 => "http1",
            Self::Http2 => "http2",
            Self::Http3 => "http3",
            Self::Grpc => "grpc",
            Self::Graphql => "graphql",
            Self::Websocket => "websocket",
            Self::Udp => "udp",
            Self::Browser => "browser",
        }
    }

    /// Whether the protocol rides on a stream socket
    pub fn is_stream(&self) -> bool {
        !matches!(self, Self::Udp | Self::Http3)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = SurgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SurgeError::InvalidOption {
                option: "protocol".into(),
                reason: format!("unknown protocol `{s}`"),
            })
    }
}

/// What a task step is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Setup,
    Condition,
    Event,
    Transform,
    Metric,
    Teardown,
}

/// Whether a step issues a network operation or runs local code only
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    Action,
    Task(TaskKind),
}

impl HookKind {
    pub fn is_action(&self) -> bool {
        matches!(self, Self::Action)
    }
}
