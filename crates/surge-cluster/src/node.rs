//! # Cluster Node
//!
//! Composes membership, replication and a local [`Engine`] into one
//! generator node. Committed entries are applied in log order:
//!
//! - `Workflow { name, overrides }` records option overrides for `name`
//! - `Start { workflow }` builds the workflow from the local registry, applies
//!   the recorded overrides and runs it until it ends or is stopped
//! - `Stop { workflow }` cancels that run
//!
//! Reports of finished runs are published on the channel returned by
//! [`ClusterNode::take_reports`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use surge_core::{EntryId, NodeId, SurgeError};
use surge_engine::{Engine, RunReport};

use crate::codec::WireConfig;
use crate::error::{ClusterError, Result};
use crate::membership::{Membership, MembershipConfig};
use crate::message::{Command, LogEntry, Message};
use crate::replication::{ReplicationConfig, ReplicationStatus, Replicator};
use crate::snapshot;
use crate::transport::{self, Handler, TcpTransport, Transport};

/// Node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stable identity; also the worker bits of entry ids
    #[serde(default)]
    pub node_id: NodeId,

    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address peers should use; defaults to the bound listen address
    #[serde(default)]
    pub advertise: Option<String>,

    /// Existing members to join through
    #[serde(default)]
    pub seeds: Vec<String>,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub wire: WireConfig,

    /// Committed log is loaded from and saved to this file
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:7946".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::default(),
            listen: default_listen(),
            advertise: None,
            seeds: Vec::new(),
            membership: MembershipConfig::default(),
            replication: ReplicationConfig::default(),
            wire: WireConfig::default(),
            snapshot: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A workflow run that ended on this node
#[derive(Debug)]
pub struct NodeReport {
    pub workflow: String,
    /// Entry that started the run
    pub entry: EntryId,
    pub outcome: std::result::Result<RunReport, SurgeError>,
}

/// Dispatches membership traffic and replication traffic
struct Router {
    membership: Arc<Membership>,
    replicator: Arc<Replicator>,
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, msg: Message) -> Option<Message> {
        if msg.is_membership() {
            self.membership.handle(msg).await
        } else {
            self.replicator.handle(msg).await
        }
    }
}

struct Run {
    entry: EntryId,
    cancel: CancellationToken,
}

pub struct ClusterNode {
    config: ClusterConfig,
    membership: Arc<Membership>,
    replicator: Arc<Replicator>,
    engine: Arc<Engine>,
    state: RwLock<NodeState>,
    overrides: Mutex<HashMap<String, Vec<(String, String)>>>,
    runs: Arc<Mutex<HashMap<String, Run>>>,
    reports_tx: mpsc::UnboundedSender<NodeReport>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeReport>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ClusterNode {
    /// Assemble a node reachable at `addr` over `transport`. Nothing runs
    /// until [`start`](Self::start).
    pub fn new(
        config: ClusterConfig,
        addr: impl Into<String>,
        engine: Arc<Engine>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let membership = Arc::new(Membership::new(
            config.node_id,
            addr,
            config.membership.clone(),
            transport.clone(),
        ));
        let replicator = Arc::new(Replicator::new(
            config.replication.clone(),
            membership.clone(),
            transport,
        ));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            membership,
            replicator,
            engine,
            state: RwLock::new(NodeState::Starting),
            overrides: Mutex::new(HashMap::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            reports_tx,
            reports_rx: Mutex::new(Some(reports_rx)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Bind the configured listen address, serve cluster RPC over TCP and
    /// start the node
    pub async fn bind(config: ClusterConfig, engine: Arc<Engine>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.listen).await?;
        let local = listener.local_addr()?;
        let addr = config.advertise.clone().unwrap_or_else(|| local.to_string());
        let transport = Arc::new(TcpTransport::new(config.wire.clone())?);
        let wire = config.wire.clone();

        let node = Self::new(config, addr, engine, transport);
        node.tasks.spawn(transport::serve(
            listener,
            wire,
            node.router(),
            node.cancel.clone(),
        ));
        tracing::info!(node = %node.id(), listen = %local, "cluster listener bound");
        node.start().await?;
        Ok(node)
    }

    /// RPC handler to register with a transport's server side
    pub fn router(&self) -> Arc<dyn Handler> {
        Arc::new(Router {
            membership: self.membership.clone(),
            replicator: self.replicator.clone(),
        })
    }

    /// Restore the snapshot, join the seeds and spawn the background loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(path) = &self.config.snapshot {
            let entries = snapshot::read(path).await?;
            if !entries.is_empty() {
                tracing::info!(node = %self.id(), entries = entries.len(), "snapshot restored");
            }
            self.replicator.restore(entries);
        }

        let joined = self.membership.join(&self.config.seeds).await?;
        tracing::info!(node = %self.id(), addr = %self.membership.addr(), joined, "node started");

        self.tasks
            .spawn(self.membership.clone().run(self.cancel.child_token()));
        self.tasks
            .spawn(self.replicator.clone().run(self.cancel.child_token()));
        if let Some(mut applied) = self.replicator.take_applied() {
            let node = self.clone();
            self.tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = node.cancel.cancelled() => break,
                        entry = applied.recv() => match entry {
                            Some(entry) => node.apply(entry),
                            None => break,
                        },
                    }
                }
            });
        }
        *self.state.write() = NodeState::Running;
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn status(&self) -> ReplicationStatus {
        self.replicator.status()
    }

    /// Finished runs; can be taken once
    pub fn take_reports(&self) -> Option<mpsc::UnboundedReceiver<NodeReport>> {
        self.reports_rx.lock().take()
    }

    /// Names of workflows currently running on this node
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replicate one command through the leader, retrying while no leader is
    /// known
    pub async fn submit(&self, command: Command) -> Result<EntryId> {
        let ids = self.replicator.push_with_retry(vec![command]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| ClusterError::Rejected("leader returned no entry id".into()))
    }

    fn apply(&self, entry: LogEntry) {
        tracing::debug!(node = %self.id(), index = entry.index, id = %entry.id, "applying entry");
        match entry.command {
            Command::Noop => {}
            Command::Workflow { name, overrides } => {
                tracing::info!(node = %self.id(), workflow = %name, "workflow options updated");
                self.overrides.lock().insert(name, overrides);
            }
            Command::Start { workflow } => self.start_run(workflow, entry.id),
            Command::Stop { workflow } => match self.runs.lock().remove(&workflow) {
                Some(run) => {
                    tracing::info!(node = %self.id(), %workflow, "stopping workflow");
                    run.cancel.cancel();
                }
                None => tracing::debug!(node = %self.id(), %workflow, "stop for idle workflow"),
            },
        }
    }

    fn start_run(&self, name: String, entry: EntryId) {
        if self.runs.lock().contains_key(&name) {
            tracing::warn!(node = %self.id(), workflow = %name, "already running, start ignored");
            return;
        }
        let overrides = self.overrides.lock().get(&name).cloned().unwrap_or_default();
        let built = self.engine.registry().workflow(&name).and_then(|workflow| {
            workflow.with_overrides(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        });
        let workflow = match built {
            Ok(workflow) => Arc::new(workflow),
            Err(e) => {
                tracing::warn!(node = %self.id(), workflow = %name, error = %e, "cannot start");
                let _ = self.reports_tx.send(NodeReport {
                    workflow: name,
                    entry,
                    outcome: Err(e),
                });
                return;
            }
        };

        let cancel = self.cancel.child_token();
        self.runs.lock().insert(
            name.clone(),
            Run {
                entry,
                cancel: cancel.clone(),
            },
        );
        tracing::info!(node = %self.id(), workflow = %name, %entry, "starting workflow");

        let engine = self.engine.clone();
        let runs = self.runs.clone();
        let reports = self.reports_tx.clone();
        let node = self.id();
        self.tasks.spawn(async move {
            let outcome = engine.run(workflow, cancel).await;
            {
                let mut runs = runs.lock();
                if runs.get(&name).is_some_and(|run| run.entry == entry) {
                    runs.remove(&name);
                }
            }
            match &outcome {
                Ok(report) => tracing::info!(
                    %node,
                    workflow = %name,
                    total = report.total(),
                    failed = report.failed(),
                    "workflow finished"
                ),
                Err(e) => tracing::warn!(%node, workflow = %name, error = %e, "workflow failed"),
            }
            let _ = reports.send(NodeReport {
                workflow: name,
                entry,
                outcome,
            });
        });
    }

    /// Leave the cluster, stop every loop and run, then save the snapshot
    pub async fn shutdown(&self) -> Result<()> {
        *self.state.write() = NodeState::Stopping;
        self.membership.leave().await;
        self.halt().await;
        if let Some(path) = &self.config.snapshot {
            snapshot::write(path, &self.replicator.committed()).await?;
        }
        *self.state.write() = NodeState::Stopped;
        tracing::info!(node = %self.id(), "node stopped");
        Ok(())
    }

    /// Stop without telling anyone, as if the process died
    pub async fn halt(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        *self.state.write() = NodeState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use surge_core::TaskKind;
    use surge_engine::{EngineConfig, Registry, Step, Workflow};

    fn registry() -> Registry {
        let mut registry = Registry::with_builtins();
        registry.register_workflow("idle", || {
            Workflow::builder("idle")
                .step(Step::task("wait", TaskKind::Transform, |_| async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(Default::default())
                }))
                .build()
        });
        registry
    }

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            replication: ReplicationConfig {
                election_timeout: Duration::from_millis(60),
                heartbeat_interval: Duration::from_millis(10),
                ..ReplicationConfig::default()
            },
            ..ClusterConfig::default()
        }
    }

    fn build(net: &Arc<MemoryNetwork>, config: ClusterConfig) -> Arc<ClusterNode> {
        let engine = Arc::new(Engine::new(EngineConfig::default(), Arc::new(registry())));
        let node = ClusterNode::new(config, "solo", engine, net.transport("solo"));
        net.register("solo", node.router());
        node
    }

    async fn until_leader(node: &ClusterNode) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !node.replicator().is_leader() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no leader elected");
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: ClusterConfig = toml::from_str("node_id = 3\nseeds = [\"a:1\"]").unwrap();
        assert_eq!(config.node_id, NodeId(3));
        assert_eq!(config.listen, "127.0.0.1:7946");
        assert_eq!(config.seeds, vec!["a:1".to_string()]);
        assert!(config.snapshot.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop_through_the_log() {
        let net = MemoryNetwork::new();
        let node = build(&net, fast_config());
        let mut reports = node.take_reports().unwrap();
        node.start().await.unwrap();
        assert_eq!(node.state(), NodeState::Running);
        until_leader(&node).await;

        node.submit(Command::Workflow {
            name: "idle".into(),
            overrides: vec![("duration".into(), "30s".into()), ("vus".into(), "1".into())],
        })
        .await
        .unwrap();
        node.submit(Command::Start {
            workflow: "idle".into(),
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while node.running().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        node.submit(Command::Stop {
            workflow: "idle".into(),
        })
        .await
        .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.workflow, "idle");
        assert!(report.outcome.unwrap().cancelled);
        assert!(node.running().is_empty());
        node.halt().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_workflow_is_reported() {
        let net = MemoryNetwork::new();
        let node = build(&net, fast_config());
        let mut reports = node.take_reports().unwrap();
        node.start().await.unwrap();
        until_leader(&node).await;

        node.submit(Command::Start {
            workflow: "missing".into(),
        })
        .await
        .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(report.outcome.is_err());
        node.halt().await;
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let config = ClusterConfig {
            snapshot: Some(dir.path().join("node.snap")),
            ..fast_config()
        };

        let node = build(&net, config.clone());
        node.start().await.unwrap();
        until_leader(&node).await;
        node.submit(Command::Workflow {
            name: "idle".into(),
            overrides: Vec::new(),
        })
        .await
        .unwrap();
        let before = node.replicator().committed();
        assert_eq!(before.len(), 2);
        node.shutdown().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        let again = build(&net, config);
        again.start().await.unwrap();
        let after = again.replicator().committed();
        assert_eq!(after[..before.len()], before[..]);
        assert!(again.status().term >= 1);
        again.halt().await;
    }
}
