//! # Replication
//!
//! Raft elections and log replication over the membership monitor's live
//! set. Quorums are majorities of the nodes currently alive or suspect, local
//! node included, so a cluster keeps making progress while dead members are
//! still in the table.
//!
//! ```text
//!              election timeout or leader suspected
//!   Follower ────────────────────────────────────► Candidate
//!      ▲  ▲                                          │   │
//!      │  └──── higher term seen ───────────────────┘   │ majority of live votes
//!      │                                                 ▼
//!      └──────────── higher term seen ──────────────── Leader ── appends Noop
//! ```
//!
//! Entries are appended only at `last_index + 1`; AppendEntries carries
//! `prev_index`/`prev_term` and followers truncate conflicting suffixes above
//! their commit index. A leader commits an entry of its own term once a
//! majority of the live set holds it; earlier entries commit with it.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use surge_core::{duration_str, EntryId, NodeId, SnowflakeGenerator};

use crate::error::{ClusterError, Result};
use crate::log::{Accept, Log};
use crate::membership::Membership;
use crate::message::{Command, LogEntry, MemberState, Message, Refusal};
use crate::transport::Transport;

/// Replication settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Upper bound of the randomized election timeout; the lower bound is half
    #[serde(default = "default_election_timeout", with = "duration_str")]
    pub election_timeout: Duration,

    #[serde(default = "default_heartbeat_interval", with = "duration_str")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_rpc_timeout", with = "duration_str")]
    pub rpc_timeout: Duration,

    /// Entries per AppendEntries
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// How long a push waits for its entries to commit
    #[serde(default = "default_push_timeout", with = "duration_str")]
    pub push_timeout: Duration,

    /// Extra attempts after `ErrClusterNoLeader`
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,

    /// First retry delay, doubled per attempt
    #[serde(default = "default_push_backoff", with = "duration_str")]
    pub push_backoff: Duration,

    #[serde(default = "default_prune_interval", with = "duration_str")]
    pub prune_interval: Duration,

    #[serde(default = "default_prune_max_age", with = "duration_str")]
    pub prune_max_age: Duration,

    /// Entries dropped per prune sweep at most
    #[serde(default = "default_prune_max_count")]
    pub prune_max_count: usize,
}

fn default_election_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(150)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_max_batch() -> usize {
    256
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_push_retries() -> u32 {
    5
}

fn default_push_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_prune_max_age() -> Duration {
    Duration::from_secs(600)
}

fn default_prune_max_count() -> usize {
    1000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            election_timeout: default_election_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            rpc_timeout: default_rpc_timeout(),
            max_batch: default_max_batch(),
            push_timeout: default_push_timeout(),
            push_retries: default_push_retries(),
            push_backoff: default_push_backoff(),
            prune_interval: default_prune_interval(),
            prune_max_age: default_prune_max_age(),
            prune_max_count: default_prune_max_count(),
        }
    }
}

impl ReplicationConfig {
    pub fn min_election_timeout(&self) -> Duration {
        self.election_timeout / 2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        })
    }
}

/// Whether the cluster currently has a usable leader
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionStatus {
    /// A leader is known
    Ready,
    /// This node is campaigning
    Active,
    /// No leader known yet
    Pending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub id: NodeId,
    pub term: u64,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub election: ElectionStatus,
    pub last_index: u64,
    pub commit_index: u64,
}

struct State {
    term: u64,
    voted_for: Option<NodeId>,
    role: Role,
    leader: Option<NodeId>,
    log: Log,
    election_deadline: Instant,
    last_heartbeat: Instant,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
}

impl State {
    fn step_down(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        if self.role != Role::Follower {
            self.leader = None;
        }
        self.role = Role::Follower;
    }
}

enum Route {
    Local,
    Forward(NodeId),
    Nowhere,
}

pub struct Replicator {
    id: NodeId,
    config: ReplicationConfig,
    membership: Arc<Membership>,
    transport: Arc<dyn Transport>,
    ids: SnowflakeGenerator,
    state: Mutex<State>,
    commits: watch::Sender<u64>,
    applied_tx: mpsc::UnboundedSender<LogEntry>,
    applied_rx: Mutex<Option<mpsc::UnboundedReceiver<LogEntry>>>,
}

fn quorum(live: usize) -> usize {
    live / 2 + 1
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl Replicator {
    pub fn new(
        config: ReplicationConfig,
        membership: Arc<Membership>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let id = membership.id();
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let state = State {
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader: None,
            log: Log::new(),
            election_deadline: now + random_timeout(&config),
            last_heartbeat: now,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        Self {
            id,
            config,
            membership,
            transport,
            ids: SnowflakeGenerator::new(id),
            state: Mutex::new(state),
            commits: watch::channel(0).0,
            applied_tx,
            applied_rx: Mutex::new(Some(applied_rx)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Committed entries in log order; can be taken once
    pub fn take_applied(&self) -> Option<mpsc::UnboundedReceiver<LogEntry>> {
        self.applied_rx.lock().take()
    }

    pub fn status(&self) -> ReplicationStatus {
        let s = self.state.lock();
        let election = match (s.role, s.leader) {
            (Role::Candidate, _) => ElectionStatus::Active,
            (_, Some(_)) => ElectionStatus::Ready,
            (_, None) => ElectionStatus::Pending,
        };
        ReplicationStatus {
            id: self.id,
            term: s.term,
            role: s.role,
            leader: s.leader,
            election,
            last_index: s.log.last_index(),
            commit_index: s.log.commit_index(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader
    }

    /// Committed entries still held in memory
    pub fn committed(&self) -> Vec<LogEntry> {
        self.state.lock().log.committed()
    }

    /// Reload a snapshot as already-applied history
    pub fn restore(&self, entries: Vec<LogEntry>) {
        let mut s = self.state.lock();
        if let Some(last) = entries.last() {
            s.term = s.term.max(last.term);
            self.ids.observe(last.id);
        }
        s.log.restore(entries);
        self.commits.send_replace(s.log.commit_index());
    }

    // === Incoming ===

    pub async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::VoteRequest {
                term,
                candidate,
                last_index,
                last_term,
            } => Some(self.handle_vote(term, candidate, last_index, last_term)),
            Message::AppendEntries {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                commit_idx,
                rebase,
            } => Some(self.handle_append(
                term, leader, prev_index, prev_term, entries, commit_idx, rebase,
            )),
            Message::Forward { commands } => {
                let result = self.propose(commands).await.map_err(|e| match e {
                    ClusterError::NoLeader => Refusal::NoLeader,
                    ClusterError::Timeout(after) => Refusal::Timeout {
                        millis: after.as_millis() as u64,
                    },
                    other => Refusal::Failed(other.to_string()),
                });
                Some(Message::ForwardReply { result })
            }
            _ => None,
        }
    }

    fn handle_vote(
        &self,
        term: u64,
        candidate: NodeId,
        last_index: u64,
        last_term: u64,
    ) -> Message {
        let mut s = self.state.lock();
        if term < s.term {
            return Message::VoteReply {
                term: s.term,
                granted: false,
            };
        }
        if term > s.term {
            s.step_down(term);
        }
        let up_to_date = (last_term, last_index) >= (s.log.last_term(), s.log.last_index());
        let free = s.voted_for.map_or(true, |v| v == candidate);
        let granted = up_to_date && free;
        if granted {
            s.voted_for = Some(candidate);
            s.election_deadline = Instant::now() + random_timeout(&self.config);
        }
        tracing::debug!(node = %self.id, %candidate, term, granted, "vote requested");
        Message::VoteReply {
            term: s.term,
            granted,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append(
        &self,
        term: u64,
        leader: NodeId,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_idx: u64,
        rebase: bool,
    ) -> Message {
        let mut s = self.state.lock();
        if term < s.term {
            return Message::AppendReply {
                term: s.term,
                success: false,
                last_index: s.log.last_index(),
            };
        }
        s.step_down(term);
        if s.leader != Some(leader) {
            tracing::info!(node = %self.id, %leader, term, "following leader");
        }
        s.leader = Some(leader);
        s.election_deadline = Instant::now() + random_timeout(&self.config);

        if let Some(last) = entries.last() {
            self.ids.observe(last.id);
        }
        if rebase && s.log.term_at(prev_index) != Some(prev_term) {
            tracing::warn!(node = %self.id, base = prev_index, "log behind leader base, rebasing");
            s.log.rebase(prev_index, prev_term);
        }

        match s.log.accept(prev_index, prev_term, entries) {
            Accept::Matched { last } => {
                if s.log.commit_to(commit_idx.min(last)) {
                    self.publish(&mut s);
                }
                Message::AppendReply {
                    term: s.term,
                    success: true,
                    last_index: last,
                }
            }
            Accept::Mismatch { hint } => Message::AppendReply {
                term: s.term,
                success: false,
                last_index: hint,
            },
        }
    }

    /// Hand newly committed entries to the applier and wake push waiters
    fn publish(&self, s: &mut State) {
        for entry in s.log.take_committed() {
            tracing::debug!(node = %self.id, index = entry.index, id = %entry.id, "committed");
            let _ = self.applied_tx.send(entry);
        }
        self.commits.send_replace(s.log.commit_index());
    }

    // === Elections ===

    /// Drive timers once: heartbeat as leader, campaign when the leader is
    /// silent or suspected
    pub async fn tick(&self) {
        let now = Instant::now();
        let (heartbeat, campaign) = {
            let s = self.state.lock();
            match s.role {
                Role::Leader => (now >= s.last_heartbeat + self.config.heartbeat_interval, false),
                _ => {
                    let suspected = s.leader.is_some_and(|leader| {
                        leader != self.id
                            && self.membership.state_of(leader) != Some(MemberState::Alive)
                    });
                    (false, now >= s.election_deadline || suspected)
                }
            }
        };
        if heartbeat {
            self.replicate().await;
        } else if campaign {
            self.campaign().await;
        }
    }

    /// Stand for election in the next term
    pub async fn campaign(&self) {
        let peers = self.membership.live_peers();
        let needed = quorum(peers.len() + 1);
        let (term, request) = {
            let mut s = self.state.lock();
            s.term += 1;
            s.role = Role::Candidate;
            s.voted_for = Some(self.id);
            s.leader = None;
            s.election_deadline = Instant::now() + random_timeout(&self.config);
            let request = Message::VoteRequest {
                term: s.term,
                candidate: self.id,
                last_index: s.log.last_index(),
                last_term: s.log.last_term(),
            };
            (s.term, request)
        };
        tracing::info!(node = %self.id, term, live = peers.len() + 1, needed, "starting election");

        let mut votes = 1;
        let mut replies: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                self.transport
                    .call(&peer.addr, request.clone(), self.config.rpc_timeout)
            })
            .collect();
        while votes < needed {
            let Some(reply) = replies.next().await else {
                break;
            };
            match reply {
                Ok(Message::VoteReply { term: theirs, .. }) if theirs > term => {
                    self.state.lock().step_down(theirs);
                    return;
                }
                Ok(Message::VoteReply { granted: true, .. }) => votes += 1,
                Ok(_) => {}
                Err(e) => tracing::debug!(node = %self.id, error = %e, "vote request failed"),
            }
        }
        drop(replies);

        if votes >= needed {
            self.assume_leadership(term).await;
        } else {
            tracing::debug!(node = %self.id, term, votes, needed, "election lost");
        }
    }

    async fn assume_leadership(&self, term: u64) {
        {
            let mut s = self.state.lock();
            if s.term != term || s.role != Role::Candidate {
                return;
            }
            s.role = Role::Leader;
            s.leader = Some(self.id);
            s.next_index.clear();
            s.match_index.clear();
            let id = self.ids.next_id();
            s.log.append(term, id, now_ms(), Command::Noop);
        }
        tracing::info!(node = %self.id, term, "elected leader");
        self.replicate().await;
    }

    // === Replication ===

    /// One AppendEntries round to every live peer, then advance the commit
    pub async fn replicate(&self) {
        let peers = self.membership.live_peers();
        let (term, requests) = {
            let mut s = self.state.lock();
            if s.role != Role::Leader {
                return;
            }
            s.last_heartbeat = Instant::now();
            let (base_index, _) = s.log.base();
            let default_next = s.log.last_index() + 1;
            let requests: Vec<_> = peers
                .iter()
                .map(|peer| {
                    let next = s.next_index.get(&peer.id).copied().unwrap_or(default_next);
                    let (prev_index, rebase) = match next.saturating_sub(1) {
                        prev if prev < base_index => (base_index, true),
                        prev => (prev, false),
                    };
                    let request = Message::AppendEntries {
                        term: s.term,
                        leader: self.id,
                        prev_index,
                        prev_term: s.log.term_at(prev_index).unwrap_or(0),
                        entries: s.log.entries_from(prev_index + 1, self.config.max_batch),
                        commit_idx: s.log.commit_index(),
                        rebase,
                    };
                    (peer.clone(), request)
                })
                .collect();
            (s.term, requests)
        };

        let calls = requests.into_iter().map(|(peer, request)| async move {
            let reply = self
                .transport
                .call(&peer.addr, request, self.config.rpc_timeout)
                .await;
            (peer.id, reply)
        });
        let replies = futures::future::join_all(calls).await;

        let mut s = self.state.lock();
        if s.role != Role::Leader || s.term != term {
            return;
        }
        for (peer, reply) in replies {
            match reply {
                Ok(Message::AppendReply { term: theirs, .. }) if theirs > s.term => {
                    tracing::info!(node = %self.id, %peer, term = theirs, "stepping down");
                    s.step_down(theirs);
                    return;
                }
                Ok(Message::AppendReply {
                    success: true,
                    last_index,
                    ..
                }) => {
                    s.match_index.insert(peer, last_index);
                    s.next_index.insert(peer, last_index + 1);
                }
                Ok(Message::AppendReply { last_index, .. }) => {
                    let next = s.next_index.get(&peer).copied().unwrap_or(s.log.last_index() + 1);
                    let retry = (last_index + 1).min(next.saturating_sub(1)).max(1);
                    s.next_index.insert(peer, retry);
                }
                Ok(other) => {
                    tracing::warn!(node = %self.id, %peer, reply = other.name(), "unexpected reply")
                }
                Err(e) => tracing::trace!(node = %self.id, %peer, error = %e, "append failed"),
            }
        }
        self.advance_commit(&mut s, &peers);
    }

    fn advance_commit(&self, s: &mut State, peers: &[crate::message::Member]) {
        let needed = quorum(peers.len() + 1);
        let mut n = s.log.last_index();
        while n > s.log.commit_index() {
            if s.log.term_at(n) == Some(s.term) {
                let holders = 1 + peers
                    .iter()
                    .filter(|p| s.match_index.get(&p.id).is_some_and(|m| *m >= n))
                    .count();
                if holders >= needed {
                    s.log.commit_to(n);
                    self.publish(s);
                    return;
                }
            }
            n -= 1;
        }
    }

    // === Proposals ===

    /// Append on the leader and wait until the entries commit
    async fn propose(&self, commands: Vec<Command>) -> Result<Vec<EntryId>> {
        let (term, last, ids) = {
            let mut s = self.state.lock();
            if s.role != Role::Leader {
                return Err(ClusterError::NoLeader);
            }
            let term = s.term;
            let ids: Vec<EntryId> = commands
                .into_iter()
                .map(|command| {
                    let id = self.ids.next_id();
                    s.log.append(term, id, now_ms(), command);
                    id
                })
                .collect();
            (term, s.log.last_index(), ids)
        };
        self.replicate().await;

        let mut commits = self.commits.subscribe();
        let wait = async {
            while *commits.borrow_and_update() < last {
                if commits.changed().await.is_err() {
                    return Err(ClusterError::NoLeader);
                }
            }
            Ok(())
        };
        tokio::time::timeout(self.config.push_timeout, wait)
            .await
            .map_err(|_| ClusterError::Timeout(self.config.push_timeout))??;

        // A new leader may have replaced the entry before it committed.
        let kept = {
            let s = self.state.lock();
            let (base, _) = s.log.base();
            last <= base || s.log.term_at(last) == Some(term)
        };
        if kept {
            Ok(ids)
        } else {
            Err(ClusterError::NoLeader)
        }
    }

    /// Replicate `commands`, forwarding to the leader when this node is not it
    pub async fn push(&self, commands: Vec<Command>) -> Result<Vec<EntryId>> {
        let route = {
            let s = self.state.lock();
            match (s.role, s.leader) {
                (Role::Leader, _) => Route::Local,
                (_, Some(leader)) => Route::Forward(leader),
                (_, None) => Route::Nowhere,
            }
        };
        let leader = match route {
            Route::Local => return self.propose(commands).await,
            Route::Nowhere => return Err(ClusterError::NoLeader),
            Route::Forward(leader) => leader,
        };
        let addr = self.membership.addr_of(leader).ok_or(ClusterError::NoLeader)?;
        let budget = self.config.push_timeout + self.config.rpc_timeout;
        match self.transport.call(&addr, Message::Forward { commands }, budget).await {
            Ok(Message::ForwardReply { result: Ok(ids) }) => Ok(ids),
            Ok(Message::ForwardReply { result: Err(refusal) }) => Err(match refusal {
                Refusal::NoLeader => ClusterError::NoLeader,
                Refusal::Timeout { millis } => ClusterError::Timeout(Duration::from_millis(millis)),
                Refusal::Failed(reason) => ClusterError::Rejected(reason),
            }),
            Ok(other) => Err(ClusterError::UnexpectedReply(other.name().into())),
            Err(e) => {
                tracing::debug!(node = %self.id, %leader, error = %e, "leader unreachable");
                Err(ClusterError::NoLeader)
            }
        }
    }

    /// [`push`](Self::push), retrying `ErrClusterNoLeader` with doubling
    /// backoff up to `push_retries` times
    pub async fn push_with_retry(&self, commands: Vec<Command>) -> Result<Vec<EntryId>> {
        let mut delay = self.config.push_backoff;
        let mut attempt = 0;
        loop {
            match self.push(commands.clone()).await {
                Err(ClusterError::NoLeader) if attempt < self.config.push_retries => {
                    attempt += 1;
                    tracing::debug!(node = %self.id, attempt, ?delay, "no leader, retrying push");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.election_timeout);
                }
                outcome => return outcome,
            }
        }
    }

    /// Drop old applied entries; returns how many
    pub fn prune(&self) -> usize {
        let max_age = self.config.prune_max_age.as_millis() as u64;
        let cutoff = now_ms().saturating_sub(max_age);
        let removed = self
            .state
            .lock()
            .log
            .prune(cutoff, self.config.prune_max_count);
        if removed > 0 {
            tracing::debug!(node = %self.id, removed, "pruned log");
        }
        removed
    }

    /// Timers and pruning until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = (self.config.heartbeat_interval / 3).max(Duration::from_millis(5));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_prune = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                    if last_prune.elapsed() >= self.config.prune_interval {
                        self.prune();
                        last_prune = Instant::now();
                    }
                }
            }
        }
    }
}

fn random_timeout(config: &ReplicationConfig) -> Duration {
    let max = config.election_timeout;
    let min = config.min_election_timeout();
    if min >= max {
        return max;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipConfig;
    use crate::transport::MemoryNetwork;

    fn fast() -> ReplicationConfig {
        ReplicationConfig {
            election_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            rpc_timeout: Duration::from_millis(50),
            push_timeout: Duration::from_millis(200),
            push_retries: 2,
            push_backoff: Duration::from_millis(5),
            ..ReplicationConfig::default()
        }
    }

    fn solo() -> Replicator {
        let net = MemoryNetwork::new();
        let transport = net.transport("n0");
        let membership = Arc::new(Membership::new(
            NodeId(0),
            "n0",
            MembershipConfig::default(),
            transport.clone(),
        ));
        Replicator::new(fast(), membership, transport)
    }

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            id: EntryId::compose(index, 9, 0),
            created_ms: 0,
            command: Command::Start {
                workflow: format!("w{index}"),
            },
        }
    }

    fn append(
        r: &Replicator,
        term: u64,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        commit: u64,
    ) -> (u64, bool, u64) {
        match r.handle_append(term, NodeId(9), prev.0, prev.1, entries, commit, false) {
            Message::AppendReply {
                term,
                success,
                last_index,
            } => (term, success, last_index),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn granted(reply: Message) -> bool {
        matches!(reply, Message::VoteReply { granted: true, .. })
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn test_random_timeout_bounds() {
        let config = fast();
        for _ in 0..100 {
            let t = random_timeout(&config);
            assert!(t >= config.min_election_timeout() && t <= config.election_timeout);
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let r = solo();
        let mut applied = r.take_applied().unwrap();
        assert!(r.take_applied().is_none());
        assert_eq!(r.status().election, ElectionStatus::Pending);

        r.campaign().await;
        let status = r.status();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.leader, Some(NodeId(0)));
        assert_eq!(status.election, ElectionStatus::Ready);
        assert_eq!(status.term, 1);
        assert_eq!(status.commit_index, 1);
        assert_eq!(applied.recv().await.unwrap().command, Command::Noop);

        let ids = r
            .push(vec![Command::Start {
                workflow: "smoke".into(),
            }])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        let entry = applied.recv().await.unwrap();
        assert_eq!(entry.index, 2);
        assert_eq!(entry.id, ids[0]);
        assert_eq!(r.committed().len(), 2);
    }

    #[test]
    fn test_votes_one_per_term_and_log_freshness() {
        let r = solo();
        assert!(granted(r.handle_vote(1, NodeId(1), 0, 0)));
        assert!(!granted(r.handle_vote(1, NodeId(2), 0, 0)));
        assert!(granted(r.handle_vote(1, NodeId(1), 0, 0)));

        append(&r, 2, (0, 0), vec![entry(1, 2)], 0);
        // Candidate's log is behind ours.
        assert!(!granted(r.handle_vote(3, NodeId(3), 0, 0)));
        assert!(granted(r.handle_vote(4, NodeId(3), 1, 2)));
        assert_eq!(r.status().term, 4);
    }

    #[test]
    fn test_stale_term_rejected() {
        let r = solo();
        append(&r, 5, (0, 0), Vec::new(), 0);
        let (term, success, _) = append(&r, 3, (0, 0), vec![entry(1, 3)], 0);
        assert_eq!(term, 5);
        assert!(!success);
        assert!(matches!(
            r.handle_vote(4, NodeId(1), 10, 10),
            Message::VoteReply {
                term: 5,
                granted: false
            }
        ));
    }

    #[tokio::test]
    async fn test_follower_appends_and_applies_in_order() {
        let r = solo();
        let mut applied = r.take_applied().unwrap();
        let (_, ok, last) = append(&r, 1, (0, 0), vec![entry(1, 1), entry(2, 1)], 0);
        assert!(ok);
        assert_eq!(last, 2);
        assert_eq!(r.leader(), Some(NodeId(9)));
        assert_eq!(r.status().commit_index, 0);

        let (_, ok, _) = append(&r, 1, (2, 1), Vec::new(), 2);
        assert!(ok);
        assert_eq!(applied.recv().await.unwrap().index, 1);
        assert_eq!(applied.recv().await.unwrap().index, 2);

        let (_, ok, hint) = append(&r, 1, (7, 1), vec![entry(8, 1)], 2);
        assert!(!ok);
        assert_eq!(hint, 2);
    }

    #[test]
    fn test_rebase_behind_pruned_base() {
        let r = solo();
        let reply = r.handle_append(2, NodeId(9), 40, 2, vec![entry(41, 2)], 41, true);
        assert!(matches!(
            reply,
            Message::AppendReply {
                success: true,
                last_index: 41,
                ..
            }
        ));
        assert_eq!(r.status().commit_index, 41);
    }

    #[tokio::test]
    async fn test_push_without_leader_fails_after_retries() {
        let r = solo();
        let err = r.push(vec![Command::Noop]).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoLeader));

        let started = Instant::now();
        let err = r.push_with_retry(vec![Command::Noop]).await.unwrap_err();
        assert_eq!(err.kind(), surge_core::ErrorKind::ClusterNoLeader);
        // Two retries: 5ms + 10ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_forward_to_unreachable_leader_is_no_leader() {
        let r = solo();
        r.membership.merge(vec![crate::message::Member {
            id: NodeId(9),
            addr: "n9".into(),
            state: MemberState::Alive,
            incarnation: 0,
        }]);
        append(&r, 1, (0, 0), Vec::new(), 0);
        let err = r.push(vec![Command::Noop]).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoLeader));
    }

    #[tokio::test]
    async fn test_restore_continues_terms() {
        let r = solo();
        r.restore(vec![entry(3, 4), entry(4, 4)]);
        let status = r.status();
        assert_eq!(status.term, 4);
        assert_eq!(status.commit_index, 4);
        r.campaign().await;
        assert_eq!(r.status().term, 5);
        assert_eq!(r.status().last_index, 5);
        assert_eq!(r.prune(), 2);
    }
}
