//! # Transports
//!
//! Request/reply RPC between cluster nodes, addressed by `host:port`.
//!
//! - [`TcpTransport`] - framed TCP with HELLO negotiation and a small idle
//!   connection cache per peer; [`serve`] is the listening half
//! - [`MemoryNetwork`] - in-process network for tests, with node kills and
//!   partitions

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{FrameCodec, FramedStream, WireConfig};
use crate::error::{ClusterError, Result};
use crate::message::Message;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_PER_PEER: usize = 4;

/// Server side of the RPC: one reply per request, `None` closes the exchange
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// Client side of the RPC
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, to: &str, msg: Message, timeout: Duration) -> Result<Message>;
}

// ============================================================================
// TCP
// ============================================================================

pub struct TcpTransport {
    config: WireConfig,
    idle: Mutex<HashMap<String, Vec<FramedStream<TcpStream>>>>,
}

impl TcpTransport {
    pub fn new(config: WireConfig) -> Result<Self> {
        config.cluster_key()?;
        Ok(Self {
            config,
            idle: Mutex::new(HashMap::new()),
        })
    }

    fn checkout(&self, to: &str) -> Option<FramedStream<TcpStream>> {
        self.idle.lock().get_mut(to).and_then(Vec::pop)
    }

    fn checkin(&self, to: &str, conn: FramedStream<TcpStream>) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(to.to_string()).or_default();
        if conns.len() < IDLE_PER_PEER {
            conns.push(conn);
        }
    }

    async fn dial(&self, to: &str) -> Result<FramedStream<TcpStream>> {
        let stream = TcpStream::connect(to)
            .await
            .map_err(|e| ClusterError::Unreachable(format!("{to}: {e}")))?;
        stream.set_nodelay(true)?;
        FramedStream::connect(stream, &self.config).await
    }

    async fn exchange(&self, to: &str, msg: &Message) -> Result<Message> {
        if let Some(mut conn) = self.checkout(to) {
            match round_trip(&mut conn, msg).await {
                Ok(reply) => {
                    self.checkin(to, conn);
                    return Ok(reply);
                }
                // Cached connection went stale; fall through to a fresh dial.
                Err(ClusterError::Closed | ClusterError::Io(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let mut conn = self.dial(to).await?;
        let reply = round_trip(&mut conn, msg).await?;
        self.checkin(to, conn);
        Ok(reply)
    }
}

async fn round_trip(conn: &mut FramedStream<TcpStream>, msg: &Message) -> Result<Message> {
    conn.send(msg).await?;
    conn.recv().await
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, to: &str, msg: Message, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.exchange(to, &msg)).await {
            Ok(reply) => reply,
            Err(_) => Err(ClusterError::Timeout(timeout)),
        }
    }
}

/// Accept cluster connections until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    config: WireConfig,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "cluster accept failed");
                    continue;
                }
            },
        };
        let handler = handler.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = serve_connection(stream, &config, handler, &cancel).await {
                tracing::debug!(%peer, error = %e, "cluster connection ended");
            }
        });
    }
    tracker.close();
    tracker.wait().await;
}

async fn serve_connection(
    stream: TcpStream,
    config: &WireConfig,
    handler: Arc<dyn Handler>,
    cancel: &CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = tokio::time::timeout(HANDSHAKE_TIMEOUT, FramedStream::accept(stream, config))
        .await
        .map_err(|_| ClusterError::Timeout(HANDSHAKE_TIMEOUT))??;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = conn.recv() => match msg {
                Ok(msg) => msg,
                Err(ClusterError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        match handler.handle(msg).await {
            Some(reply) => conn.send(&reply).await?,
            None => return Ok(()),
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local network of named handlers
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Arc<dyn Handler>>>,
    down: RwLock<HashSet<String>>,
    cuts: RwLock<HashSet<(String, String)>>,
    delivered: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn Handler>) {
        self.nodes.write().insert(addr.into(), handler);
    }

    /// Client bound to `local`; calls fail while `local` is down or cut off
    pub fn transport(self: &Arc<Self>, local: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            local: local.into(),
        })
    }

    /// Stop delivering to and from `addr`
    pub fn kill(&self, addr: &str) {
        self.down.write().insert(addr.to_string());
    }

    pub fn revive(&self, addr: &str) {
        self.down.write().remove(addr);
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn partition(&self, a: &str, b: &str) {
        self.cuts.write().insert(link(a, b));
    }

    pub fn heal(&self) {
        self.cuts.write().clear();
    }

    /// Requests handed to a handler so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        let down = self.down.read();
        !down.contains(from) && !down.contains(to) && !self.cuts.read().contains(&link(from, to))
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: String,
}

impl MemoryTransport {
    pub fn local(&self) -> &str {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, to: &str, msg: Message, timeout: Duration) -> Result<Message> {
        if !self.network.reachable(&self.local, to) {
            return Err(ClusterError::Unreachable(to.to_string()));
        }
        let handler = self
            .network
            .nodes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| ClusterError::Unreachable(to.to_string()))?;

        // Same bytes a TCP peer would see.
        let mut codec = FrameCodec::plain();
        let frame = codec.encode(&msg)?;
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&frame[..4]);
        let msg = codec.decode(prefix, frame[4..].to_vec())?;

        self.network.delivered.fetch_add(1, Ordering::Relaxed);
        let reply = tokio::time::timeout(timeout, handler.handle(msg))
            .await
            .map_err(|_| ClusterError::Timeout(timeout))?;
        if !self.network.reachable(&self.local, to) {
            return Err(ClusterError::Unreachable(to.to_string()));
        }
        reply.ok_or(ClusterError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_core::NodeId;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, msg: Message) -> Option<Message> {
            match msg {
                Message::Probe { src, seq, .. } => Some(Message::Ack {
                    src,
                    seq,
                    updates: Vec::new(),
                }),
                _ => None,
            }
        }
    }

    fn probe(seq: u64) -> Message {
        Message::Probe {
            src: NodeId(1),
            seq,
            updates: Vec::new(),
        }
    }

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_memory_network_delivery_and_faults() {
        let net = MemoryNetwork::new();
        net.register("b", Arc::new(Echo));
        let a = net.transport("a");

        let reply = a.call("b", probe(1), WAIT).await.unwrap();
        assert!(matches!(reply, Message::Ack { seq: 1, .. }));

        net.partition("b", "a");
        assert!(matches!(
            a.call("b", probe(2), WAIT).await,
            Err(ClusterError::Unreachable(_))
        ));
        net.heal();
        assert!(a.call("b", probe(3), WAIT).await.is_ok());

        net.kill("b");
        assert!(a.call("b", probe(4), WAIT).await.is_err());
        net.revive("b");
        assert!(a.call("b", probe(5), WAIT).await.is_ok());

        assert!(matches!(
            a.call("missing", probe(6), WAIT).await,
            Err(ClusterError::Unreachable(_))
        ));
        let vote = Message::VoteReply {
            term: 1,
            granted: true,
        };
        assert!(matches!(a.call("b", vote, WAIT).await, Err(ClusterError::Closed)));
        assert_eq!(net.delivered(), 4);
    }

    #[tokio::test]
    async fn test_tcp_round_trips_reuse_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = WireConfig {
            compress: true,
            key: Some("11".repeat(32)),
            ..WireConfig::default()
        };
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, config.clone(), Arc::new(Echo), cancel.clone()));

        let client = TcpTransport::new(config).unwrap();
        for seq in 0..3 {
            let reply = client.call(&addr, probe(seq), WAIT).await.unwrap();
            assert!(matches!(reply, Message::Ack { seq: s, .. } if s == seq));
        }
        assert_eq!(client.idle.lock().get(&addr).map(Vec::len), Some(1));

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = TcpTransport::new(WireConfig::default()).unwrap();
        let err = client.call(&addr, probe(0), WAIT).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_bad_key_rejected_up_front() {
        let config = WireConfig {
            key: Some("not-hex".into()),
            ..WireConfig::default()
        };
        assert!(TcpTransport::new(config).is_err());
    }
}
