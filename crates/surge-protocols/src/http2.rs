//! # HTTP/2 Client
//!
//! Pooled [`H2Connection`]s, one active stream each. TLS origins negotiate
//! `h2` through ALPN; plaintext origins speak h2c with prior knowledge.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use surge_core::{
    ErrorKind, Headers, OpContext, OpRecorder, Phase, ProtocolKind, Request, ResolvedUrl,
    SurgeError, Url,
};

use crate::client::{finish, guarded, ClientConfig, Outcome, ProtocolClient, Response};
use crate::dns::DnsCache;
use crate::h2::{H2Connection, H2Error};
use crate::pool::{Pool, Pooled};
use crate::tls::{Alpn, TlsConnector};
use crate::transport::Stream;

pub struct Http2Client {
    config: ClientConfig,
    dns: Arc<DnsCache>,
    tls: TlsConnector,
    pool: Pool<H2Connection>,
}

impl Http2Client {
    pub fn new(config: ClientConfig, dns: Arc<DnsCache>, tls: TlsConnector) -> Self {
        let pool = Pool::new(ProtocolKind::Http2, config.pool_size);
        Self {
            config,
            dns,
            tls,
            pool,
        }
    }

    pub fn pool(&self) -> &Pool<H2Connection> {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Perform the request, following redirects within its budget
    pub async fn exchange(
        &self,
        request: &Request,
        rec: &mut OpRecorder,
    ) -> Result<Response, SurgeError> {
        let mut url = request.url.clone();
        let mut method = request.method.clone();
        let mut headers = request.headers.clone();
        let mut body = request.body.materialize();
        let mut followed = 0u32;

        loop {
            let response = self
                .exchange_parts(&url, &method, &headers, body.clone(), rec)
                .await?;
            if request.redirects == 0 || !response.is_redirect() {
                return Ok(response);
            }
            let Some(location) = response.headers.get("location") else {
                return Ok(response);
            };
            if followed >= request.redirects {
                return Err(SurgeError::Protocol(format!(
                    "redirect budget of {} exhausted at {}",
                    request.redirects, url
                )));
            }
            followed += 1;

            let next = Arc::new(url.join(location).map_err(|e| {
                SurgeError::Protocol(format!("bad Location `{location}`: {e}"))
            })?);
            if matches!(response.status, 301 | 302 | 303) && method != "GET" && method != "HEAD" {
                method = "GET".to_string();
                body = Bytes::new();
                headers.remove("content-length");
                headers.remove("content-type");
            }
            if next.origin() != url.origin() {
                headers.remove("host");
            }
            debug!(from = %url, to = %next, status = response.status, "following redirect");
            rec.redirected(next.as_str());
            url = next;
        }
    }

    /// One stream on a pooled connection, no redirect handling
    pub(crate) async fn exchange_parts(
        &self,
        url: &Arc<Url>,
        method: &str,
        headers: &Headers,
        body: Bytes,
        rec: &mut OpRecorder,
    ) -> Result<Response, SurgeError> {
        let target = self.dns.resolve(url).await?;
        rec.mark(Phase::Dns);

        let mut retried = false;
        loop {
            let mut conn = match self.checkout(&target, retried, rec).await {
                Ok(conn) => conn,
                Err(e) if e.kind() == ErrorKind::Connect && !retried => {
                    debug!(origin = %url.origin(), error = %e, "dial failed, retrying once");
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let res = conn
                .round_trip(
                    method,
                    url,
                    headers,
                    body.clone(),
                    &self.config.user_agent,
                    self.config.max_response_body,
                    rec,
                )
                .await;
            match res {
                Ok(response) => {
                    let clean = conn.is_usable();
                    conn.release(clean);
                    return Ok(response);
                }
                Err(e @ (H2Error::Io(_) | H2Error::GoAway { .. }))
                    if !retried && conn.is_reused() =>
                {
                    debug!(origin = %url.origin(), error = %e, "stale h2 connection, redialing");
                    retried = true;
                }
                Err(e) => {
                    let clean = conn.is_usable();
                    conn.release(clean);
                    return Err(e.into());
                }
            }
        }
    }

    async fn checkout(
        &self,
        target: &ResolvedUrl,
        fresh: bool,
        rec: &mut OpRecorder,
    ) -> Result<Pooled<H2Connection>, SurgeError> {
        let origin = target.url.origin();
        let dial = move || async move { self.dial(target, rec).await };
        if fresh {
            self.pool.acquire_fresh(origin, dial).await
        } else {
            self.pool.acquire(origin, dial).await
        }
    }

    async fn dial(
        &self,
        target: &ResolvedUrl,
        rec: &mut OpRecorder,
    ) -> Result<H2Connection, SurgeError> {
        let timeout = self.config.connect_timeout;
        let stream = Stream::dial(target, &self.tls, Alpn::H2, timeout, rec).await?;
        if stream.is_tls() && stream.alpn() != Some(Alpn::H2.id()) {
            return Err(SurgeError::Protocol(format!(
                "{} did not negotiate h2",
                target.url.origin()
            )));
        }
        match tokio::time::timeout(timeout, H2Connection::handshake(stream, &self.config)).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(SurgeError::Connect(format!(
                "no SETTINGS from {} within {timeout:?}",
                target.url.origin()
            ))),
        }
    }
}

#[async_trait]
impl ProtocolClient for Http2Client {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http2
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let mut rec = ctx.recorder(Some(ProtocolKind::Http2), request.url.as_str());
        let deadline = request.timeout.unwrap_or(self.config.request_timeout);
        let res = guarded(&ctx.cancel, deadline, self.exchange(request, &mut rec)).await;
        finish(rec, res, |_| None)
    }

    async fn close(&self) -> Result<(), SurgeError> {
        self.pool.close();
        Ok(())
    }
}
