//! Five-node clusters on the in-memory network
//!
//! Nodes gossip, elect and replicate with shortened timers; the leader is then
//! killed mid-run and the survivors must converge on one history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use surge_cluster::{
    ClusterConfig, ClusterNode, Command, MembershipConfig, MemoryNetwork, ReplicationConfig,
};
use surge_core::{EntryId, ErrorKind, NodeId};
use surge_engine::{Engine, EngineConfig, Registry};

const NODES: u64 = 5;

fn addr(i: u64) -> String {
    format!("n{i}")
}

fn config(i: u64) -> ClusterConfig {
    ClusterConfig {
        node_id: NodeId(i),
        seeds: if i == 0 { Vec::new() } else { vec![addr(0)] },
        membership: MembershipConfig {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(25),
            suspect_timeout: Duration::from_millis(150),
            ..MembershipConfig::default()
        },
        replication: ReplicationConfig {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(30),
            rpc_timeout: Duration::from_millis(50),
            push_timeout: Duration::from_secs(1),
            push_retries: 10,
            push_backoff: Duration::from_millis(20),
            ..ReplicationConfig::default()
        },
        ..ClusterConfig::default()
    }
}

async fn cluster(net: &Arc<MemoryNetwork>) -> Vec<Arc<ClusterNode>> {
    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        Arc::new(Registry::with_builtins()),
    ));
    let mut nodes = Vec::new();
    for i in 0..NODES {
        let node = ClusterNode::new(config(i), addr(i), engine.clone(), net.transport(addr(i)));
        net.register(addr(i), node.router());
        node.start().await.unwrap();
        nodes.push(node);
    }
    eventually("membership convergence", || {
        nodes
            .iter()
            .all(|n| n.membership().live_count() == NODES as usize)
    })
    .await;
    nodes
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Index into `nodes` of the leader every node in `among` follows
fn agreed_leader(nodes: &[Arc<ClusterNode>], among: &[usize]) -> Option<usize> {
    let leader = among
        .iter()
        .copied()
        .find(|&i| nodes[i].replicator().is_leader())?;
    let id = nodes[leader].id();
    among
        .iter()
        .all(|&i| nodes[i].replicator().leader() == Some(id))
        .then_some(leader)
}

async fn wait_leader(nodes: &[Arc<ClusterNode>], among: &[usize]) -> usize {
    let mut found = None;
    eventually("an agreed leader", || {
        found = agreed_leader(nodes, among);
        found.is_some()
    })
    .await;
    found.unwrap()
}

fn holds(node: &ClusterNode, id: EntryId) -> bool {
    node.replicator().committed().iter().any(|e| e.id == id)
}

fn workflow(name: &str) -> Command {
    Command::Workflow {
        name: name.to_string(),
        overrides: vec![("vus".to_string(), "2".to_string())],
    }
}

mod failover_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_push_through_follower_commits_everywhere() {
        let net = MemoryNetwork::new();
        let nodes = cluster(&net).await;
        let all: Vec<usize> = (0..nodes.len()).collect();
        let leader = wait_leader(&nodes, &all).await;

        let follower = (leader + 1) % nodes.len();
        let id = nodes[follower].submit(workflow("smoke")).await.unwrap();
        eventually("commit on every node", || nodes.iter().all(|n| holds(n, id))).await;

        for node in &nodes {
            node.halt().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leader_failover_keeps_one_history() {
        let net = MemoryNetwork::new();
        let nodes = cluster(&net).await;
        let all: Vec<usize> = (0..nodes.len()).collect();
        let old = wait_leader(&nodes, &all).await;
        let old_term = nodes[old].status().term;

        let first = nodes[old].submit(workflow("before")).await.unwrap();
        eventually("first commit", || nodes.iter().all(|n| holds(n, first))).await;

        net.kill(&addr(old as u64));
        nodes[old].halt().await;
        let killed_at = Instant::now();
        let survivors: Vec<usize> = all.iter().copied().filter(|&i| i != old).collect();

        // Submitted while no leader is reachable.
        let gap = nodes[survivors[0]].submit(workflow("gap")).await;

        let new = wait_leader(&nodes, &survivors).await;
        assert_ne!(new, old);
        assert!(nodes[new].status().term > old_term);
        assert!(killed_at.elapsed() < Duration::from_secs(5));

        match gap {
            Ok(id) => {
                eventually("gap commit", || survivors.iter().all(|&i| holds(&nodes[i], id)))
                    .await
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::ClusterNoLeader),
        }

        let after = nodes[survivors[1]].submit(workflow("after")).await.unwrap();
        eventually("commit after failover", || {
            survivors.iter().all(|&i| holds(&nodes[i], after))
        })
        .await;

        // Every committed index names the same entry everywhere, and no entry
        // is committed under two terms.
        let mut by_index: HashMap<u64, (u64, EntryId)> = HashMap::new();
        let mut terms_of: HashMap<EntryId, u64> = HashMap::new();
        for node in &nodes {
            for entry in node.replicator().committed() {
                let seen = *by_index.entry(entry.index).or_insert((entry.term, entry.id));
                assert_eq!(seen, (entry.term, entry.id), "index {} diverged", entry.index);
                let term = *terms_of.entry(entry.id).or_insert(entry.term);
                assert_eq!(term, entry.term, "{} committed under two terms", entry.id);
            }
        }
        assert!(terms_of.contains_key(&first));
        assert!(terms_of.contains_key(&after));

        for &i in &survivors {
            nodes[i].halt().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dead_leader_is_detected_by_membership() {
        let net = MemoryNetwork::new();
        let nodes = cluster(&net).await;
        let all: Vec<usize> = (0..nodes.len()).collect();
        let leader = wait_leader(&nodes, &all).await;
        let leader_id = nodes[leader].id();

        net.kill(&addr(leader as u64));
        nodes[leader].halt().await;
        let survivors: Vec<usize> = all.iter().copied().filter(|&i| i != leader).collect();
        eventually("leader declared dead", || {
            survivors.iter().all(|&i| {
                nodes[i].membership().state_of(leader_id)
                    == Some(surge_cluster::MemberState::Dead)
            })
        })
        .await;
        for &i in &survivors {
            assert_eq!(nodes[i].membership().live_count(), NODES as usize - 1);
        }

        for &i in &survivors {
            nodes[i].halt().await;
        }
    }
}
