//! # HTTP/1.1 Client
//!
//! Hand-rolled request writer and response reader over pooled [`Stream`]s.
//! Bodies may be sized (`Content-Length`), chunked, or delimited by close.
//! Redirects are followed up to the request's budget; a `Location` on a
//! different origin (including an `https` upgrade) is dialed through the
//! pool under that origin's key.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use surge_core::{
    ErrorKind, Headers, OpContext, OpRecorder, Phase, ProtocolKind, Request, ResolvedUrl,
    SurgeError, Url,
};

use crate::client::{finish, guarded, ClientConfig, Outcome, ProtocolClient, Response};
use crate::dns::DnsCache;
use crate::pool::{Pool, Poolable, Pooled};
use crate::tls::{Alpn, TlsConnector};
use crate::transport::{Probe, Stream};

/// Largest response head accepted
const MAX_HEAD_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Serialize a request line, headers and body.
///
/// `Host`, `User-Agent` and `Content-Length` are added when the caller did
/// not set them. A `Transfer-Encoding: chunked` header switches the body to
/// chunked encoding.
pub fn encode_request(
    method: &str,
    url: &Url,
    headers: &Headers,
    body: &[u8],
    user_agent: &str,
) -> BytesMut {
    let mut out = BytesMut::with_capacity(256 + body.len());
    out.extend_from_slice(method.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(url.path_and_query().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains("host") {
        push_header(&mut out, "Host", &url.authority());
    }
    if !headers.contains("user-agent") {
        push_header(&mut out, "User-Agent", user_agent);
    }
    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    let wants_length = !body.is_empty() || matches!(method, "POST" | "PUT" | "PATCH");
    if !chunked && wants_length && !headers.contains("content-length") {
        push_header(&mut out, "Content-Length", &body.len().to_string());
    }
    for (name, value) in headers.iter() {
        push_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");

    if chunked {
        for chunk in body.chunks(16 * 1024) {
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
    } else {
        out.extend_from_slice(body);
    }
    out
}

fn push_header(out: &mut BytesMut, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn protocol(msg: impl Into<String>) -> SurgeError {
    SurgeError::Protocol(msg.into())
}

/// Parsed status line and header block
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub http10: bool,
    pub headers: Headers,
}

impl ResponseHead {
    fn parse(raw: &[u8]) -> Result<Self, SurgeError> {
        let text = std::str::from_utf8(raw).map_err(|_| protocol("response head is not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(protocol(format!("bad status line `{status_line}`")));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|s| (100..1000).contains(s))
            .ok_or_else(|| protocol(format!("bad status line `{status_line}`")))?;

        let mut headers = Headers::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| protocol(format!("malformed header `{line}`")))?;
            headers.append(name.trim(), value.trim());
        }
        Ok(Self {
            status,
            http10: version == "HTTP/1.0",
            headers,
        })
    }

    fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get("connection")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        if self.http10 {
            connection.contains("keep-alive")
        } else {
            !connection.contains("close")
        }
    }
}

/// One HTTP/1.1 connection and its read buffer
pub struct Http1Connection {
    stream: Stream,
    buf: BytesMut,
    keep_alive: bool,
    response_started: bool,
    consumed: usize,
    served: u64,
}

impl Http1Connection {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            keep_alive: true,
            response_started: false,
            consumed: 0,
            served: 0,
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether any byte of the current response has arrived
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    /// Hand back the raw stream and any bytes read past the last response
    pub fn into_parts(self) -> (Stream, BytesMut) {
        (self.stream, self.buf)
    }

    /// Write a full request and read its response
    pub async fn round_trip(
        &mut self,
        wire: &[u8],
        head_only: bool,
        max_body: usize,
        rec: &mut OpRecorder,
    ) -> Result<Response, SurgeError> {
        self.send(wire, rec).await?;
        let head = self.read_head(rec).await?;
        let no_body = head_only || matches!(head.status, 204 | 304);
        let (body, trailers) = if no_body {
            (Bytes::new(), Headers::new())
        } else {
            self.read_body(&head, max_body).await?
        };
        if !head.keep_alive() {
            self.keep_alive = false;
        }
        rec.mark(Phase::Read);
        rec.received(self.consumed);
        self.served += 1;
        Ok(Response {
            status: head.status,
            headers: head.headers,
            trailers,
            body,
        })
    }

    /// Write raw request bytes
    pub async fn send(&mut self, wire: &[u8], rec: &mut OpRecorder) -> Result<(), SurgeError> {
        self.response_started = false;
        self.consumed = 0;
        let io_err = |e: std::io::Error| protocol(format!("write: {e}"));
        self.stream.write_all(wire).await.map_err(io_err)?;
        self.stream.flush().await.map_err(io_err)?;
        rec.sent(wire.len());
        rec.mark(Phase::Write);
        Ok(())
    }

    /// Read a response head, skipping interim 1xx responses other than 101
    pub async fn read_head(&mut self, rec: &mut OpRecorder) -> Result<ResponseHead, SurgeError> {
        loop {
            let end = loop {
                if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                    break pos + 4;
                }
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Err(protocol("response head too large"));
                }
                if self.fill().await? == 0 {
                    self.keep_alive = false;
                    return Err(if self.response_started {
                        protocol("connection closed mid-head")
                    } else {
                        protocol("connection closed before response")
                    });
                }
                if !self.response_started {
                    self.response_started = true;
                    rec.mark(Phase::FirstByte);
                }
            };
            let raw = self.take(end);
            let head = ResponseHead::parse(&raw[..end - 4])?;
            if (100..200).contains(&head.status) && head.status != 101 {
                continue;
            }
            return Ok(head);
        }
    }

    async fn read_body(
        &mut self,
        head: &ResponseHead,
        max_body: usize,
    ) -> Result<(Bytes, Headers), SurgeError> {
        let chunked = head
            .headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return self.read_chunked(max_body).await;
        }
        if let Some(len) = head.headers.get("content-length") {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| protocol(format!("bad content-length `{len}`")))?;
            if len > max_body {
                return Err(protocol(format!("body of {len} bytes exceeds limit")));
            }
            self.ensure(len).await?;
            return Ok((self.take(len), Headers::new()));
        }

        // Delimited by close
        self.keep_alive = false;
        while self.fill().await? > 0 {
            if self.buf.len() > max_body {
                return Err(protocol("body exceeds limit"));
            }
        }
        let len = self.buf.len();
        Ok((self.take(len), Headers::new()))
    }

    async fn read_chunked(&mut self, max_body: usize) -> Result<(Bytes, Headers), SurgeError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size_text = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| protocol(format!("bad chunk size `{line}`")))?;
            if size == 0 {
                break;
            }
            if size > max_body.saturating_sub(body.len()) {
                return Err(protocol("body exceeds limit"));
            }
            self.ensure(size + 2).await?;
            body.extend_from_slice(&self.take(size));
            if self.take(2).as_ref() != b"\r\n" {
                return Err(protocol("chunk missing CRLF"));
            }
        }
        let mut trailers = Headers::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                trailers.append(name.trim(), value.trim());
            }
        }
        Ok((body.freeze(), trailers))
    }

    async fn read_line(&mut self) -> Result<String, SurgeError> {
        loop {
            if let Some(pos) = find(&self.buf, b"\r\n") {
                let raw = self.take(pos + 2);
                return String::from_utf8(raw[..pos].to_vec())
                    .map_err(|_| protocol("line is not UTF-8"));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(protocol("line too long"));
            }
            if self.fill().await? == 0 {
                self.keep_alive = false;
                return Err(protocol("connection closed mid-body"));
            }
        }
    }

    async fn ensure(&mut self, n: usize) -> Result<(), SurgeError> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                self.keep_alive = false;
                return Err(protocol("connection closed mid-body"));
            }
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Bytes {
        self.consumed += n;
        self.buf.split_to(n).freeze()
    }

    async fn fill(&mut self) -> Result<usize, SurgeError> {
        self.buf.reserve(READ_CHUNK);
        self.stream
            .read_buf(&mut self.buf)
            .await
            .map_err(|e| protocol(format!("read: {e}")))
    }
}

impl Poolable for Http1Connection {
    fn is_open(&mut self) -> bool {
        if !self.keep_alive || self.buf.has_remaining() {
            return false;
        }
        // Any unsolicited byte on an idle HTTP/1.1 connection is an error
        self.stream.probe(&mut self.buf) == Probe::Idle
    }
}

/// HTTP/1.1 client over a per-worker pool
pub struct Http1Client {
    config: ClientConfig,
    dns: Arc<DnsCache>,
    tls: TlsConnector,
    pool: Pool<Http1Connection>,
}

impl Http1Client {
    pub fn new(config: ClientConfig, dns: Arc<DnsCache>, tls: TlsConnector) -> Self {
        let pool = Pool::new(ProtocolKind::Http1, config.pool_size);
        Self {
            config,
            dns,
            tls,
            pool,
        }
    }

    pub fn pool(&self) -> &Pool<Http1Connection> {
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
            let response = self.send_once(&url, &method, &headers, &body, rec).await?;
            if request.redirects == 0 || !response.is_redirect() {
                return Ok(response);
            }
            let Some(location) = response.headers.get("location") else {
                return Ok(response);
            };
            if followed >= request.redirects {
                return Err(protocol(format!(
                    "redirect budget of {} exhausted at {}",
                    request.redirects, url
                )));
            }
            followed += 1;

            let next = Arc::new(
                url.join(location)
                    .map_err(|e| protocol(format!("bad Location `{location}`: {e}")))?,
            );
            if matches!(response.status, 301 | 302 | 303) && method != "GET" && method != "HEAD" {
                method = "GET".to_string();
                body = Bytes::new();
                headers.remove("content-length");
                headers.remove("content-type");
                headers.remove("transfer-encoding");
            }
            if next.origin() != url.origin() {
                headers.remove("host");
            }
            debug!(from = %url, to = %next, status = response.status, "following redirect");
            rec.redirected(next.as_str());
            url = next;
        }
    }

    /// One hop: resolve, check out, write, read. A connect failure or a
    /// reused connection that died before answering is retried once on a
    /// freshly dialed connection.
    async fn send_once(
        &self,
        url: &Arc<Url>,
        method: &str,
        headers: &Headers,
        body: &[u8],
        rec: &mut OpRecorder,
    ) -> Result<Response, SurgeError> {
        let target = self.dns.resolve(url).await?;
        rec.mark(Phase::Dns);
        let wire = encode_request(method, url, headers, body, &self.config.user_agent);
        let head_only = method == "HEAD";

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
            match conn
                .round_trip(&wire, head_only, self.config.max_response_body, rec)
                .await
            {
                Ok(response) => {
                    let clean = conn.keep_alive();
                    conn.release(clean);
                    return Ok(response);
                }
                Err(e) if !retried && conn.is_reused() && !conn.response_started() => {
                    debug!(origin = %url.origin(), error = %e, "stale connection, redialing");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn checkout(
        &self,
        target: &ResolvedUrl,
        fresh: bool,
        rec: &mut OpRecorder,
    ) -> Result<Pooled<Http1Connection>, SurgeError> {
        let origin = target.url.origin();
        let dial = move || async move {
            let stream = Stream::dial(
                target,
                &self.tls,
                Alpn::Http1,
                self.config.connect_timeout,
                rec,
            )
            .await?;
            Ok::<_, SurgeError>(Http1Connection::new(stream))
        };
        if fresh {
            self.pool.acquire_fresh(origin, dial).await
        } else {
            self.pool.acquire(origin, dial).await
        }
    }
}

#[async_trait]
impl ProtocolClient for Http1Client {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http1
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let mut rec = ctx.recorder(Some(ProtocolKind::Http1), request.url.as_str());
        let deadline = request.timeout.unwrap_or(self.config.request_timeout);
        let res = guarded(&ctx.cancel, deadline, self.exchange(request, &mut rec)).await;
        finish(rec, res, |_| None)
    }

    async fn close(&self) -> Result<(), SurgeError> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_adds_host_and_length() {
        let url = Url::parse("http://api.test:8080/v1/items?page=2").unwrap();
        let mut headers = Headers::new();
        headers.insert("X-Run", "7");
        let wire = encode_request("POST", &url, &headers, b"{}", "surge-test");
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("POST /v1/items?page=2 HTTP/1.1\r\nHost: api.test:8080\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("X-Run: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn test_encode_chunked_body() {
        let url = Url::parse("http://api.test/upload").unwrap();
        let mut headers = Headers::new();
        headers.insert("Transfer-Encoding", "chunked");
        let wire = encode_request("PUT", &url, &headers, b"hello", "surge-test");
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_parse_head() {
        let head = ResponseHead::parse(
            b"HTTP/1.1 301 Moved Permanently\r\nLocation: https://a.test/\r\nConnection: close",
        )
        .unwrap();
        assert_eq!(head.status, 301);
        assert_eq!(head.headers.get("location"), Some("https://a.test/"));
        assert!(!head.keep_alive());

        let old = ResponseHead::parse(b"HTTP/1.0 200 OK").unwrap();
        assert!(!old.keep_alive());
        assert!(ResponseHead::parse(b"SPDY/3 200 OK").is_err());
    }
}
