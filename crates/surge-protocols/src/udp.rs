//! UDP datagram client
//!
//! Sockets are connected to the first resolved address and pooled per
//! origin. The request body is sent as one datagram; when a reply is
//! expected, the first datagram back completes the operation.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;

use surge_core::{OpContext, OpRecorder, Phase, ProtocolKind, Request, ResolvedUrl, SurgeError};

use crate::client::{finish, guarded, ClientConfig, Outcome, ProtocolClient, Response};
use crate::dns::DnsCache;
use crate::pool::{Pool, Poolable};

/// A connected datagram socket
pub struct UdpConn {
    socket: UdpSocket,
    scratch: Vec<u8>,
}

impl UdpConn {
    async fn connect(peer: SocketAddr, recv_buffer: usize) -> Result<Self, SurgeError> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| SurgeError::Connect(format!("bind {local}: {e}")))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| SurgeError::Connect(format!("{peer}: {e}")))?;
        Ok(Self {
            socket,
            scratch: vec![0; recv_buffer.max(512)],
        })
    }
}

impl Poolable for UdpConn {
    fn is_open(&mut self) -> bool {
        // Late replies to an earlier request must not answer the next one
        loop {
            match self.socket.try_recv(&mut self.scratch) {
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }
}

pub struct UdpClient {
    config: ClientConfig,
    dns: Arc<DnsCache>,
    pool: Pool<UdpConn>,
}

impl UdpClient {
    pub fn new(config: ClientConfig, dns: Arc<DnsCache>) -> Self {
        let pool = Pool::new(ProtocolKind::Udp, config.pool_size);
        Self { config, dns, pool }
    }

    pub fn pool(&self) -> &Pool<UdpConn> {
        &self.pool
    }

    async fn call(&self, request: &Request, rec: &mut OpRecorder) -> Result<Response, SurgeError> {
        let target = self.dns.resolve(&request.url).await?;
        rec.mark(Phase::Dns);
        let mut conn = self
            .pool
            .acquire(target.url.origin(), || self.dial(&target, rec))
            .await?;

        let payload = request.body.materialize();
        let io_err = |e: std::io::Error| SurgeError::Protocol(format!("udp: {e}"));
        conn.socket.send(&payload).await.map_err(io_err)?;
        rec.sent(payload.len());
        rec.mark(Phase::Write);

        let mut body = Bytes::new();
        if request.expect_reply {
            let conn = &mut *conn;
            let n = conn.socket.recv(&mut conn.scratch).await.map_err(io_err)?;
            rec.mark(Phase::FirstByte);
            rec.received(n);
            body = Bytes::copy_from_slice(&conn.scratch[..n]);
        }
        rec.mark(Phase::Read);
        conn.release(true);

        Ok(Response {
            body,
            ..Default::default()
        })
    }

    async fn dial(
        &self,
        target: &ResolvedUrl,
        rec: &mut OpRecorder,
    ) -> Result<UdpConn, SurgeError> {
        let peer = *target
            .addrs
            .first()
            .ok_or_else(|| SurgeError::Connect(format!("no addresses for {}", target.url.host())))?;
        let began = Instant::now();
        let conn = UdpConn::connect(peer, self.config.udp_recv_buffer).await?;
        rec.connected(began);
        Ok(conn)
    }
}

#[async_trait]
impl ProtocolClient for UdpClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Udp
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let mut rec = ctx.recorder(Some(ProtocolKind::Udp), request.url.as_str());
        let deadline = request.timeout.unwrap_or(self.config.request_timeout);
        let res = guarded(&ctx.cancel, deadline, self.call(request, &mut rec)).await;
        finish(rec, res, |_| None)
    }

    async fn close(&self) -> Result<(), SurgeError> {
        self.pool.close();
        Ok(())
    }
}
