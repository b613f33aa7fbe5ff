//! # Protocol Clients
//!
//! Every protocol implements [`ProtocolClient`]; the engine only sees the
//! trait object. A [`ClientSet`] bundles one client per [`ProtocolKind`] for
//! a single worker, all sharing that worker's DNS cache.
//!
//! Each `execute` call follows the same shape:
//!
//! ```text
//!   recorder ── guarded(cancel, deadline, exchange) ──► Response | SurgeError
//!                                                            │
//!                                     finish(recorder) ◄─────┘ ──► OpResult
//! ```
//!
//! Operation failures never escape as `Err`; they become result records.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use surge_core::options::duration_str;
use surge_core::{
    ErrorKind, Headers, OpContext, OpError, OpRecorder, OpResult, ProtocolKind, Request,
    SurgeError,
};

use crate::dns::DnsCache;
use crate::graphql::GraphQlClient;
use crate::grpc::GrpcClient;
use crate::http1::Http1Client;
use crate::http2::Http2Client;
use crate::tls::TlsConnector;
use crate::udp::UdpClient;
use crate::websocket::WsClient;

/// Client-side tuning shared by every protocol
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connections each pool may hand out at once (usually the VU count)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    /// Deadline for requests that do not carry their own
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,

    #[serde(default = "default_dns_ttl", with = "duration_str")]
    pub dns_ttl: Duration,

    /// Skip certificate verification
    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Largest response body accepted
    #[serde(default = "default_max_body")]
    pub max_response_body: usize,

    /// Inbound HTTP/2 stream window advertised to servers
    #[serde(default = "default_h2_window")]
    pub h2_initial_window: u32,

    #[serde(default = "default_udp_buffer")]
    pub udp_recv_buffer: usize,
}

fn default_pool_size() -> usize {
    64
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_dns_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_user_agent() -> String {
    concat!("surge/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_body() -> usize {
    16 * 1024 * 1024
}

fn default_h2_window() -> u32 {
    65_535
}

fn default_udp_buffer() -> usize {
    65_536
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            dns_ttl: default_dns_ttl(),
            insecure_tls: false,
            user_agent: default_user_agent(),
            max_response_body: default_max_body(),
            h2_initial_window: default_h2_window(),
            udp_recv_buffer: default_udp_buffer(),
        }
    }
}

/// Decoded response of a request/response exchange
#[derive(Clone, Debug, Default)]
pub struct Response {
    /// HTTP status, or the protocol's equivalent
    pub status: u16,
    pub headers: Headers,
    pub trailers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// What `execute` hands back: the sealed result and, on success, the response
#[derive(Clone, Debug)]
pub struct Outcome {
    pub result: OpResult,
    pub response: Option<Response>,
}

/// Uniform surface over every protocol
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Issue one operation; failures are reported inside the result
    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome;

    /// Drop pooled connections
    async fn close(&self) -> Result<(), SurgeError>;
}

/// Race an exchange against run cancellation and its deadline.
///
/// Whichever loses is dropped, which closes any connection it held.
pub(crate) async fn guarded<T>(
    cancel: &CancellationToken,
    deadline: Duration,
    exchange: impl Future<Output = Result<T, SurgeError>>,
) -> Result<T, SurgeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SurgeError::Cancelled),
        res = tokio::time::timeout(deadline, exchange) => {
            res.unwrap_or(Err(SurgeError::Timeout(deadline)))
        }
    }
}

/// Seal a recorder from an exchange outcome, with a protocol-specific
/// check that may flag a well-formed response as failed.
pub(crate) fn finish(
    rec: OpRecorder,
    res: Result<Response, SurgeError>,
    check: impl FnOnce(&Response) -> Option<OpError>,
) -> Outcome {
    match res {
        Ok(response) => {
            let error = check(&response);
            let status = (response.status != 0).then_some(response.status);
            Outcome {
                result: rec.finish(status, error),
                response: Some(response),
            }
        }
        Err(err) => Outcome {
            result: rec.fail(err),
            response: None,
        },
    }
}

/// Placeholder for kinds with no transport in this build
pub struct UnsupportedClient {
    kind: ProtocolKind,
    reason: &'static str,
}

impl UnsupportedClient {
    pub fn new(kind: ProtocolKind, reason: &'static str) -> Self {
        Self { kind, reason }
    }
}

#[async_trait]
impl ProtocolClient for UnsupportedClient {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let rec = ctx.recorder(Some(self.kind), request.url.as_str());
        Outcome {
            result: rec.fail(OpError::new(ErrorKind::Protocol, self.reason)),
            response: None,
        }
    }

    async fn close(&self) -> Result<(), SurgeError> {
        Ok(())
    }
}

/// One client per protocol, owned by a single worker
pub struct ClientSet {
    config: ClientConfig,
    dns: Arc<DnsCache>,
    clients: HashMap<ProtocolKind, Arc<dyn ProtocolClient>>,
}

impl ClientSet {
    pub fn new(config: ClientConfig, dns: Arc<DnsCache>) -> Result<Self, SurgeError> {
        let tls = TlsConnector::new(config.insecure_tls)?;
        let http1 = Arc::new(Http1Client::new(config.clone(), dns.clone(), tls.clone()));
        let http2 = Arc::new(Http2Client::new(config.clone(), dns.clone(), tls.clone()));

        let mut clients: HashMap<ProtocolKind, Arc<dyn ProtocolClient>> = HashMap::new();
        clients.insert(ProtocolKind::Http1, http1.clone());
        clients.insert(ProtocolKind::Http2, http2.clone());
        clients.insert(ProtocolKind::Grpc, Arc::new(GrpcClient::new(http2)));
        clients.insert(ProtocolKind::Graphql, Arc::new(GraphQlClient::new(http1)));
        clients.insert(
            ProtocolKind::Websocket,
            Arc::new(WsClient::new(config.clone(), dns.clone(), tls)),
        );
        clients.insert(
            ProtocolKind::Udp,
            Arc::new(UdpClient::new(config.clone(), dns.clone())),
        );
        clients.insert(
            ProtocolKind::Http3,
            Arc::new(UnsupportedClient::new(
                ProtocolKind::Http3,
                "QUIC transport not available",
            )),
        );
        clients.insert(
            ProtocolKind::Browser,
            Arc::new(UnsupportedClient::new(
                ProtocolKind::Browser,
                "browser automation not available",
            )),
        );

        Ok(Self {
            config,
            dns,
            clients,
        })
    }

    /// Client set with a system-resolver DNS cache of its own
    pub fn standalone(config: ClientConfig) -> Result<Self, SurgeError> {
        let dns = Arc::new(DnsCache::system(config.dns_ttl));
        Self::new(config, dns)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dns(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    pub fn get(&self, kind: ProtocolKind) -> Arc<dyn ProtocolClient> {
        match self.clients.get(&kind) {
            Some(client) => client.clone(),
            None => Arc::new(UnsupportedClient::new(kind, "protocol not registered")),
        }
    }

    pub async fn execute(&self, kind: ProtocolKind, request: &Request, ctx: &OpContext) -> Outcome {
        self.get(kind).execute(request, ctx).await
    }

    /// Close every client, continuing past failures
    pub async fn close(&self) {
        for (kind, client) in &self.clients {
            if let Err(e) = client.close().await {
                tracing::warn!(%kind, error = %e, "client close failed");
            }
        }
    }
}
