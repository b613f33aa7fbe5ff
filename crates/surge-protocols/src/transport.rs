//! Stream transports: plaintext TCP or TLS over TCP

use bytes::BytesMut;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use surge_core::{OpRecorder, Phase, ResolvedUrl, SurgeError};

use crate::tls::{Alpn, TlsConnector};

/// A connected byte stream
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Outcome of a liveness probe on an idle stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Nothing to read, peer still connected
    Idle,
    /// Bytes were waiting and have been buffered
    Readable,
    /// Peer closed or the socket errored
    Closed,
}

impl Stream {
    /// Dial the first reachable address, upgrading to TLS for TLS origins.
    ///
    /// Records the connect (and TLS) phase on `rec`.
    pub async fn dial(
        target: &ResolvedUrl,
        tls: &TlsConnector,
        alpn: Alpn,
        connect_timeout: Duration,
        rec: &mut OpRecorder,
    ) -> Result<Self, SurgeError> {
        let began = Instant::now();
        let tcp = connect_any(&target.addrs, connect_timeout).await?;
        rec.connected(began);
        if !target.is_tls() {
            return Ok(Self::Tcp(tcp));
        }
        let handshake = tls.connect(alpn, target.url.host(), tcp);
        let session = tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                SurgeError::Connect(format!("TLS handshake timed out after {connect_timeout:?}"))
            })??;
        rec.mark(Phase::Tls);
        Ok(Self::Tls(Box::new(session)))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// ALPN protocol the server selected, if any
    pub fn alpn(&self) -> Option<&[u8]> {
        match self {
            Self::Tcp(_) => None,
            Self::Tls(tls) => tls.get_ref().1.alpn_protocol(),
        }
    }

    /// Poll the stream once without waiting; readable bytes land in `buf`
    pub fn probe(&mut self, buf: &mut BytesMut) -> Probe {
        let mut scratch = [0u8; 4096];
        match self.read(&mut scratch).now_or_never() {
            None => Probe::Idle,
            Some(Ok(0)) | Some(Err(_)) => Probe::Closed,
            Some(Ok(n)) => {
                buf.extend_from_slice(&scratch[..n]);
                Probe::Readable
            }
        }
    }
}

async fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream, SurgeError> {
    let mut last = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => {
                let _ = tcp.set_nodelay(true);
                return Ok(tcp);
            }
            Ok(Err(e)) => last = Some(format!("{addr}: {e}")),
            Err(_) => last = Some(format!("{addr}: timed out after {timeout:?}")),
        }
    }
    Err(SurgeError::Connect(
        last.unwrap_or_else(|| "no addresses to dial".to_string()),
    ))
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
