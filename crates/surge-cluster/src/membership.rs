//! # Membership
//!
//! SWIM-style failure detection with piggybacked dissemination.
//!
//! ```text
//!   every probe_interval:
//!     pick random live peer P ── Probe ──► P
//!         ack within probe_timeout?  yes ─► done, health improves
//!         no ─► k random live peers ── IndirectProbe(P) ──► relay ── Probe ──► P
//!               any ack?             yes ─► done
//!               no  ─► P is suspect (timer = suspect_timeout × health)
//!     suspects past their timer ─► dead, announced
//!
//!   alive ──► suspect ──► dead        left: voluntary, announced
//! ```
//!
//! Every Probe and Ack carries up to `max_piggyback` recent member deltas.
//! A node that hears itself suspected bumps its incarnation and gossips an
//! `alive` statement, which supersedes the suspicion everywhere.
//!
//! The health multiplier rises by one on each failed probe round and falls
//! by one on each successful round, within `[1, MAX_HEALTH]`.

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use surge_core::{duration_str, NodeId};

use crate::error::{ClusterError, Result};
use crate::message::{Member, MemberState, Message};
use crate::transport::Transport;

/// Ceiling of the suspicion health multiplier
pub const MAX_HEALTH: u32 = 8;

/// Membership settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_probe_interval", with = "duration_str")]
    pub probe_interval: Duration,

    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub probe_timeout: Duration,

    /// Relays asked when a direct probe fails
    #[serde(default = "default_indirect_probes")]
    pub indirect_probes: usize,

    /// Base suspicion timeout, scaled by the health multiplier
    #[serde(default = "default_suspect_timeout", with = "duration_str")]
    pub suspect_timeout: Duration,

    /// Deltas carried per Probe/Ack
    #[serde(default = "default_max_piggyback")]
    pub max_piggyback: usize,

    /// Each delta is piggybacked `retransmit_mult × ⌈log2(n + 1)⌉` times
    #[serde(default = "default_retransmit_mult")]
    pub retransmit_mult: u32,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_indirect_probes() -> usize {
    3
}

fn default_suspect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_piggyback() -> usize {
    8
}

fn default_retransmit_mult() -> u32 {
    3
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            indirect_probes: default_indirect_probes(),
            suspect_timeout: default_suspect_timeout(),
            max_piggyback: default_max_piggyback(),
            retransmit_mult: default_retransmit_mult(),
        }
    }
}

struct Entry {
    member: Member,
    suspected_at: Option<Instant>,
}

struct Broadcast {
    update: Member,
    remaining: u32,
}

pub struct Membership {
    id: NodeId,
    addr: String,
    config: MembershipConfig,
    transport: Arc<dyn Transport>,
    incarnation: AtomicU64,
    left: AtomicBool,
    table: RwLock<HashMap<NodeId, Entry>>,
    broadcasts: Mutex<VecDeque<Broadcast>>,
    health: Mutex<u32>,
    seq: AtomicU64,
}

impl Membership {
    pub fn new(
        id: NodeId,
        addr: impl Into<String>,
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            addr: addr.into(),
            config,
            transport,
            incarnation: AtomicU64::new(0),
            left: AtomicBool::new(false),
            table: RwLock::new(HashMap::new()),
            broadcasts: Mutex::new(VecDeque::new()),
            health: Mutex::new(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Current suspicion multiplier, in `[1, MAX_HEALTH]`
    pub fn health(&self) -> u32 {
        *self.health.lock()
    }

    /// This node as peers should see it
    pub fn local(&self) -> Member {
        Member {
            id: self.id,
            addr: self.addr.clone(),
            state: if self.left.load(Ordering::SeqCst) {
                MemberState::Left
            } else {
                MemberState::Alive
            },
            incarnation: self.incarnation(),
        }
    }

    /// Snapshot of every known member, local node included, sorted by id
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .table
            .read()
            .values()
            .map(|e| e.member.clone())
            .collect();
        members.push(self.local());
        members.sort_by_key(|m| m.id);
        members
    }

    /// Alive and suspect peers, local node excluded
    pub fn live_peers(&self) -> Vec<Member> {
        let mut peers: Vec<Member> = self
            .table
            .read()
            .values()
            .filter(|e| e.member.state.is_live())
            .map(|e| e.member.clone())
            .collect();
        peers.sort_by_key(|m| m.id);
        peers
    }

    /// Size of the live set, local node included
    pub fn live_count(&self) -> usize {
        self.live_peers().len() + 1
    }

    pub fn state_of(&self, id: NodeId) -> Option<MemberState> {
        if id == self.id {
            return Some(self.local().state);
        }
        self.table.read().get(&id).map(|e| e.member.state)
    }

    pub fn addr_of(&self, id: NodeId) -> Option<String> {
        if id == self.id {
            return Some(self.addr.clone());
        }
        self.table.read().get(&id).map(|e| e.member.addr.clone())
    }

    // === Joining and leaving ===

    /// Contact seeds until one answers; returns the number of members learned
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut last_err = None;
        for seed in seeds.iter().filter(|s| **s != self.addr) {
            let request = Message::JoinRequest {
                src: self.id,
                addr: self.addr.clone(),
            };
            match self.transport.call(seed, request, self.config.probe_timeout * 2).await {
                Ok(Message::JoinReply { members }) => {
                    let learned = members.len();
                    self.merge(members);
                    tracing::info!(node = %self.id, %seed, learned, "joined cluster");
                    return Ok(learned);
                }
                Ok(other) => {
                    last_err = Some(ClusterError::UnexpectedReply(other.name().into()));
                }
                Err(e) => {
                    tracing::debug!(%seed, error = %e, "seed did not answer");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    /// Announce departure to every live peer
    pub async fn leave(&self) {
        self.left.store(true, Ordering::SeqCst);
        let notice = Message::LeaveNotice {
            src: self.id,
            incarnation: self.incarnation(),
        };
        let calls = self.live_peers().into_iter().map(|peer| {
            let notice = notice.clone();
            async move {
                let _ = self
                    .transport
                    .call(&peer.addr, notice, self.config.probe_timeout)
                    .await;
            }
        });
        futures::future::join_all(calls).await;
        tracing::info!(node = %self.id, "left cluster");
    }

    // === Incoming ===

    /// Answer a membership request
    pub async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::Probe { seq, updates, .. } => {
                self.merge(updates);
                Some(Message::Ack {
                    src: self.id,
                    seq,
                    updates: self.piggyback(),
                })
            }
            Message::IndirectProbe { target, seq, .. } => {
                let Some(addr) = self.addr_of(target) else {
                    return Some(Message::Nack { src: self.id, seq });
                };
                let acked = self.ping(target, &addr).await;
                Some(if acked {
                    Message::Ack {
                        src: target,
                        seq,
                        updates: self.piggyback(),
                    }
                } else {
                    Message::Nack { src: self.id, seq }
                })
            }
            Message::JoinRequest { src, addr } => {
                self.merge(vec![Member {
                    id: src,
                    addr,
                    state: MemberState::Alive,
                    incarnation: 0,
                }]);
                Some(Message::JoinReply {
                    members: self.members(),
                })
            }
            Message::LeaveNotice { src, incarnation } => {
                let addr = self.addr_of(src).unwrap_or_default();
                self.merge(vec![Member {
                    id: src,
                    addr,
                    state: MemberState::Left,
                    incarnation,
                }]);
                Some(Message::Ack {
                    src: self.id,
                    seq: 0,
                    updates: Vec::new(),
                })
            }
            _ => None,
        }
    }

    // === Probing ===

    /// Direct probe; merges the piggybacked deltas of the ack
    async fn ping(&self, target: NodeId, addr: &str) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let probe = Message::Probe {
            src: self.id,
            seq,
            updates: self.piggyback(),
        };
        match self.transport.call(addr, probe, self.config.probe_timeout).await {
            Ok(Message::Ack {
                src,
                seq: acked,
                updates,
            }) if src == target && acked == seq => {
                self.merge(updates);
                true
            }
            _ => false,
        }
    }

    async fn ping_indirect(&self, target: &Member) -> bool {
        let relays: Vec<Member> = {
            let mut relays: Vec<Member> = self
                .live_peers()
                .into_iter()
                .filter(|m| m.id != target.id)
                .collect();
            relays.shuffle(&mut rand::thread_rng());
            relays.truncate(self.config.indirect_probes);
            relays
        };
        if relays.is_empty() {
            return false;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // Relays spend up to one probe timeout on their own ping.
        let budget = self.config.probe_timeout * 2;
        let asks = relays.into_iter().map(|relay| {
            let request = Message::IndirectProbe {
                target: target.id,
                src: self.id,
                seq,
            };
            Box::pin(async move {
                match self.transport.call(&relay.addr, request, budget).await {
                    Ok(Message::Ack { updates, .. }) => {
                        self.merge(updates);
                        Ok(())
                    }
                    _ => Err(()),
                }
            })
        });
        futures::future::select_ok(asks).await.is_ok()
    }

    /// One SWIM protocol period: probe one random live peer
    pub async fn probe_round(&self) {
        let target = {
            let peers = self.live_peers();
            peers.choose(&mut rand::thread_rng()).cloned()
        };
        let Some(target) = target else {
            return;
        };

        let acked =
            self.ping(target.id, &target.addr).await || self.ping_indirect(&target).await;
        if acked {
            self.adjust_health(false);
            return;
        }
        self.adjust_health(true);
        tracing::debug!(node = %self.id, peer = %target.id, "probe failed");
        let incarnation = self
            .table
            .read()
            .get(&target.id)
            .map(|e| e.member.incarnation)
            .unwrap_or(target.incarnation);
        self.merge(vec![Member {
            state: MemberState::Suspect,
            incarnation,
            ..target
        }]);
    }

    /// Declare suspects whose timer ran out dead; returns how many
    pub fn expire_suspects(&self) -> usize {
        let timeout = self.config.suspect_timeout * self.health();
        let now = Instant::now();
        let expired: Vec<Member> = self
            .table
            .read()
            .values()
            .filter(|e| {
                e.member.state == MemberState::Suspect
                    && e.suspected_at.is_some_and(|at| now.duration_since(at) >= timeout)
            })
            .map(|e| Member {
                state: MemberState::Dead,
                ..e.member.clone()
            })
            .collect();
        let count = expired.len();
        self.merge(expired);
        count
    }

    fn adjust_health(&self, failed: bool) {
        let mut health = self.health.lock();
        *health = if failed {
            (*health + 1).min(MAX_HEALTH)
        } else {
            health.saturating_sub(1).max(1)
        };
    }

    /// Probe and expire until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_round().await;
                    self.expire_suspects();
                }
            }
        }
    }

    // === Dissemination ===

    /// Apply deltas; every delta that changed the table is queued for gossip
    pub fn merge(&self, updates: Vec<Member>) {
        for update in updates {
            if update.id == self.id {
                self.refute(&update);
                continue;
            }
            if let Some(applied) = self.apply(update) {
                self.enqueue(applied);
            }
        }
    }

    fn apply(&self, update: Member) -> Option<Member> {
        let mut table = self.table.write();
        let Some(entry) = table.get_mut(&update.id) else {
            let suspected_at = (update.state == MemberState::Suspect).then(Instant::now);
            tracing::info!(
                node = %self.id,
                peer = %update.id,
                state = %update.state,
                "member discovered"
            );
            table.insert(
                update.id,
                Entry {
                    member: update.clone(),
                    suspected_at,
                },
            );
            return Some(update);
        };

        let current = &entry.member;
        let supersedes = match (current.state, update.state) {
            (from, _) if from.is_terminal() => false,
            (_, MemberState::Dead | MemberState::Left) => true,
            (MemberState::Alive, MemberState::Suspect) => update.incarnation >= current.incarnation,
            (_, _) => update.incarnation > current.incarnation,
        };
        if !supersedes {
            return None;
        }

        if update.state != current.state {
            tracing::info!(
                node = %self.id,
                peer = %update.id,
                from = %current.state,
                to = %update.state,
                incarnation = update.incarnation,
                "member state changed"
            );
        }
        entry.suspected_at = match update.state {
            MemberState::Suspect => entry.suspected_at.or_else(|| Some(Instant::now())),
            _ => None,
        };
        let addr = if update.addr.is_empty() {
            entry.member.addr.clone()
        } else {
            update.addr.clone()
        };
        entry.member = Member { addr, ..update };
        Some(entry.member.clone())
    }

    /// Someone claims this node is suspect or dead: outvote it
    fn refute(&self, claim: &Member) {
        if self.left.load(Ordering::SeqCst) || claim.state == MemberState::Alive {
            return;
        }
        let current = self.incarnation();
        if claim.incarnation < current {
            return;
        }
        let next = claim.incarnation + 1;
        self.incarnation.store(next, Ordering::SeqCst);
        tracing::info!(node = %self.id, incarnation = next, claim = %claim.state, "refuting");
        self.enqueue(self.local());
    }

    fn enqueue(&self, update: Member) {
        let n = self.table.read().len() as u32 + 2;
        let log2 = u32::BITS - (n - 1).leading_zeros();
        let mut queue = self.broadcasts.lock();
        queue.retain(|b| b.update.id != update.id);
        queue.push_back(Broadcast {
            update,
            remaining: self.config.retransmit_mult.max(1) * log2,
        });
    }

    /// Deltas to attach to an outgoing Probe or Ack
    fn piggyback(&self) -> Vec<Member> {
        let mut queue = self.broadcasts.lock();
        let mut out = Vec::new();
        for b in queue.iter_mut().take(self.config.max_piggyback) {
            out.push(b.update.clone());
            b.remaining = b.remaining.saturating_sub(1);
        }
        queue.retain(|b| b.remaining > 0);
        out
    }

    /// Deltas not yet fully disseminated
    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Handler, MemoryNetwork};
    use async_trait::async_trait;

    struct Node(Arc<Membership>);

    #[async_trait]
    impl Handler for Node {
        async fn handle(&self, msg: Message) -> Option<Message> {
            self.0.handle(msg).await
        }
    }

    fn fast() -> MembershipConfig {
        MembershipConfig {
            probe_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(20),
            suspect_timeout: Duration::from_millis(60),
            ..MembershipConfig::default()
        }
    }

    fn cluster(n: u64) -> (Arc<MemoryNetwork>, Vec<Arc<Membership>>) {
        let net = MemoryNetwork::new();
        let nodes: Vec<Arc<Membership>> = (0..n)
            .map(|i| {
                let addr = format!("n{i}");
                let m = Arc::new(Membership::new(
                    NodeId(i),
                    addr.clone(),
                    fast(),
                    net.transport(addr.clone()),
                ));
                net.register(addr, Arc::new(Node(m.clone())));
                m
            })
            .collect();
        (net, nodes)
    }

    fn member(id: u64, state: MemberState, incarnation: u64) -> Member {
        Member {
            id: NodeId(id),
            addr: format!("n{id}"),
            state,
            incarnation,
        }
    }

    #[tokio::test]
    async fn test_join_learns_members() {
        let (_net, nodes) = cluster(3);
        nodes[1].join(&["n0".into()]).await.unwrap();
        nodes[2].join(&["n0".into()]).await.unwrap();
        assert_eq!(nodes[0].live_count(), 3);
        assert_eq!(nodes[2].live_count(), 3);
        assert_eq!(nodes[2].members().len(), 3);
        assert_eq!(nodes[1].state_of(NodeId(0)), Some(MemberState::Alive));
    }

    #[tokio::test]
    async fn test_join_without_seeds() {
        let (_net, nodes) = cluster(1);
        assert_eq!(nodes[0].join(&["n0".into()]).await.unwrap(), 0);
        assert!(nodes[0].join(&["nowhere".into()]).await.is_err());
    }

    #[test]
    fn test_merge_precedence() {
        let net = MemoryNetwork::new();
        let m = Membership::new(NodeId(0), "n0", fast(), net.transport("n0"));

        m.merge(vec![member(1, MemberState::Alive, 0)]);
        m.merge(vec![member(1, MemberState::Suspect, 0)]);
        assert_eq!(m.state_of(NodeId(1)), Some(MemberState::Suspect));

        // Same-incarnation alive does not clear a suspicion.
        m.merge(vec![member(1, MemberState::Alive, 0)]);
        assert_eq!(m.state_of(NodeId(1)), Some(MemberState::Suspect));
        m.merge(vec![member(1, MemberState::Alive, 1)]);
        assert_eq!(m.state_of(NodeId(1)), Some(MemberState::Alive));

        m.merge(vec![member(1, MemberState::Dead, 0)]);
        assert_eq!(m.state_of(NodeId(1)), Some(MemberState::Dead));
        m.merge(vec![member(1, MemberState::Alive, 9)]);
        assert_eq!(m.state_of(NodeId(1)), Some(MemberState::Dead));
        assert_eq!(m.live_count(), 1);
    }

    #[test]
    fn test_refutation_bumps_incarnation() {
        let net = MemoryNetwork::new();
        let m = Membership::new(NodeId(0), "n0", fast(), net.transport("n0"));
        m.merge(vec![member(0, MemberState::Suspect, 0)]);
        assert_eq!(m.incarnation(), 1);
        let gossip = m.piggyback();
        assert!(gossip
            .iter()
            .any(|u| u.id == NodeId(0) && u.state == MemberState::Alive && u.incarnation == 1));

        // Old news is ignored.
        m.merge(vec![member(0, MemberState::Suspect, 0)]);
        assert_eq!(m.incarnation(), 1);
    }

    #[test]
    fn test_piggyback_retransmits_then_drops() {
        let net = MemoryNetwork::new();
        let config = MembershipConfig {
            retransmit_mult: 1,
            ..fast()
        };
        let m = Membership::new(NodeId(0), "n0", config, net.transport("n0"));
        m.merge(vec![member(1, MemberState::Alive, 0)]);
        // Two known members: ⌈log2(3)⌉ = 2 transmissions.
        assert_eq!(m.piggyback().len(), 1);
        assert_eq!(m.piggyback().len(), 1);
        assert!(m.piggyback().is_empty());
        assert_eq!(m.pending_broadcasts(), 0);
    }

    #[tokio::test]
    async fn test_failed_probes_raise_health_within_bounds() {
        let (net, nodes) = cluster(2);
        nodes[1].join(&["n0".into()]).await.unwrap();
        net.kill("n0");
        for _ in 0..12 {
            nodes[1].probe_round().await;
        }
        assert_eq!(nodes[1].health(), MAX_HEALTH);
        assert_eq!(nodes[1].state_of(NodeId(0)), Some(MemberState::Suspect));

        net.revive("n0");
        nodes[1].probe_round().await;
        assert_eq!(nodes[1].health(), MAX_HEALTH - 1);
    }

    #[tokio::test]
    async fn test_indirect_probe_keeps_peer_alive() {
        let (net, nodes) = cluster(3);
        nodes[1].join(&["n0".into()]).await.unwrap();
        nodes[2].join(&["n0".into()]).await.unwrap();
        nodes[1].join(&["n0".into()]).await.unwrap();
        net.partition("n1", "n2");

        let target = nodes[1]
            .live_peers()
            .into_iter()
            .find(|m| m.id == NodeId(2))
            .unwrap();
        assert!(!nodes[1].ping(target.id, &target.addr).await);
        assert!(nodes[1].ping_indirect(&target).await);
    }

    #[tokio::test]
    async fn test_dead_member_detected_and_gossiped() {
        let (net, nodes) = cluster(3);
        for node in &nodes[1..] {
            node.join(&["n0".into()]).await.unwrap();
        }
        nodes[1].join(&["n0".into()]).await.unwrap();

        let cancel = CancellationToken::new();
        for node in &nodes {
            tokio::spawn(node.clone().run(cancel.clone()));
        }
        net.kill("n2");

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let gone = nodes[..2]
                .iter()
                .all(|n| n.state_of(NodeId(2)) == Some(MemberState::Dead));
            if gone {
                break;
            }
            assert!(Instant::now() < deadline, "n2 was never declared dead");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(nodes[0].live_count(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_leave_is_absorbing() {
        let (_net, nodes) = cluster(2);
        nodes[1].join(&["n0".into()]).await.unwrap();
        nodes[1].leave().await;
        assert_eq!(nodes[0].state_of(NodeId(1)), Some(MemberState::Left));
        nodes[0].merge(vec![member(1, MemberState::Alive, 5)]);
        assert_eq!(nodes[0].state_of(NodeId(1)), Some(MemberState::Left));
    }
}
