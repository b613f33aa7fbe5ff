//! Snowflake entry ids for ordering replicated log entries
//!
//! ```text
//!  63        22 21      12 11        0
//!  ┌──────────┬──────────┬──────────┐
//!  │ ms (41)  │ node(10) │ seq (12) │
//!  └──────────┴──────────┴──────────┘
//! ```
//!
//! Ids from one generator are strictly increasing, even when the wall clock
//! stalls or steps backwards: the generator never reuses a (ms, seq) pair
//! and borrows from the next millisecond when the sequence overflows.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::NodeId;

/// 2024-01-01T00:00:00Z in milliseconds since the Unix epoch
pub const SURGE_EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const MAX_SEQ: u64 = (1 << SEQ_BITS) - 1;
const MAX_NODE: u64 = (1 << NODE_BITS) - 1;

/// A Snowflake-format 64-bit identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    pub fn compose(ms: u64, node: u16, seq: u16) -> Self {
        Self(
            (ms << (NODE_BITS + SEQ_BITS))
                | ((node as u64 & MAX_NODE) << SEQ_BITS)
                | (seq as u64 & MAX_SEQ),
        )
    }

    /// Milliseconds since [`SURGE_EPOCH_MS`]
    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> (NODE_BITS + SEQ_BITS)
    }

    pub fn node(&self) -> u16 {
        ((self.0 >> SEQ_BITS) & MAX_NODE) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & MAX_SEQ) as u16
    }

    /// Wall-clock time the id was minted, in Unix milliseconds
    pub fn unix_ms(&self) -> u64 {
        self.timestamp_ms() + SURGE_EPOCH_MS
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Strictly increasing id source for one node
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node: u16,
    /// (ms, seq) of the last id handed out or observed
    last: Mutex<(u64, u64)>,
}

impl SnowflakeGenerator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node: node.worker_bits(),
            last: Mutex::new((0, 0)),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(SURGE_EPOCH_MS)
            .saturating_sub(SURGE_EPOCH_MS)
    }

    /// Mint the next id
    pub fn next_id(&self) -> EntryId {
        let now = Self::now_ms();
        let mut last = self.last.lock();
        let (ms, seq) = *last;
        *last = if now > ms {
            (now, 0)
        } else if seq < MAX_SEQ {
            (ms, seq + 1)
        } else {
            (ms + 1, 0)
        };
        EntryId::compose(last.0, self.node, last.1 as u16)
    }

    /// Move past an id seen from another node, so later ids sort after it
    pub fn observe(&self, id: EntryId) {
        let mut last = self.last.lock();
        if id.timestamp_ms() >= last.0 {
            *last = (id.timestamp_ms(), MAX_SEQ);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_decode() {
        let id = EntryId::compose(123_456, 7, 42);
        assert_eq!(id.timestamp_ms(), 123_456);
        assert_eq!(id.node(), 7);
        assert_eq!(id.sequence(), 42);
    }

    #[test]
    fn test_strictly_increasing_burst() {
        let gen = SnowflakeGenerator::new(NodeId(3));
        let mut prev = gen.next_id();
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > prev);
            assert_eq!(id.node(), 3);
            prev = id;
        }
    }

    #[test]
    fn test_observe_orders_after_remote() {
        let gen = SnowflakeGenerator::new(NodeId(1));
        let remote = EntryId::compose(SnowflakeGenerator::now_ms() + 60_000, 900, 5);
        gen.observe(remote);
        let id = gen.next_id();
        assert!(id > remote);
        assert_eq!(id.node(), 1);
    }
}
