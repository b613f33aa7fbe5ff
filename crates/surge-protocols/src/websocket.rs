//! # WebSocket Client
//!
//! Each operation dials, performs the HTTP/1.1 Upgrade handshake, sends the
//! request body as one message, optionally waits for one reply, and closes.
//!
//! ```text
//!   dial ─► GET + Upgrade ─► 101 + accept check ─► frame codec
//!                                                   send ─► [recv] ─► close
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use surge_core::{Headers, OpContext, OpRecorder, Phase, ProtocolKind, Request, SurgeError};

use crate::client::{finish, guarded, ClientConfig, Outcome, ProtocolClient, Response};
use crate::dns::DnsCache;
use crate::http1::{encode_request, Http1Connection};
use crate::tls::{Alpn, TlsConnector};
use crate::transport::Stream;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Expected `Sec-WebSocket-Accept` for a key (RFC 6455 §4.2.2)
pub fn accept_key(key: &str) -> String {
    let mut input = Vec::with_capacity(key.len() + ACCEPT_GUID.len());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(ACCEPT_GUID.as_bytes());
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    BASE64.encode(digest.as_ref())
}

fn new_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

fn protocol(msg: impl Into<String>) -> SurgeError {
    SurgeError::Protocol(msg.into())
}

pub struct WsClient {
    config: ClientConfig,
    dns: Arc<DnsCache>,
    tls: TlsConnector,
}

impl WsClient {
    pub fn new(config: ClientConfig, dns: Arc<DnsCache>, tls: TlsConnector) -> Self {
        Self { config, dns, tls }
    }

    async fn call(&self, request: &Request, rec: &mut OpRecorder) -> Result<Response, SurgeError> {
        let target = self.dns.resolve(&request.url).await?;
        rec.mark(Phase::Dns);
        let stream = Stream::dial(
            &target,
            &self.tls,
            Alpn::Http1,
            self.config.connect_timeout,
            rec,
        )
        .await?;

        let key = new_key();
        let mut headers = request.headers.clone();
        headers.insert("Upgrade", "websocket");
        headers.insert("Connection", "Upgrade");
        headers.insert("Sec-WebSocket-Key", key.clone());
        headers.insert("Sec-WebSocket-Version", "13");
        let wire = encode_request("GET", &request.url, &headers, &[], &self.config.user_agent);

        let mut conn = Http1Connection::new(stream);
        conn.send(&wire, rec).await?;
        let head = conn.read_head(rec).await?;
        if head.status != 101 {
            return Err(protocol(format!(
                "upgrade refused with status {}",
                head.status
            )));
        }
        match head.headers.get("sec-websocket-accept") {
            Some(accept) if accept == accept_key(&key) => {}
            _ => return Err(protocol("bad Sec-WebSocket-Accept")),
        }

        let (stream, leftover) = conn.into_parts();
        let mut ws =
            WebSocketStream::from_partially_read(stream, leftover.to_vec(), Role::Client, None)
                .await;

        let payload = request.body.materialize();
        rec.sent(payload.len());
        let message = match std::str::from_utf8(&payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(payload.to_vec()),
        };
        ws.send(message)
            .await
            .map_err(|e| protocol(format!("websocket send: {e}")))?;
        rec.mark(Phase::Write);

        let mut body = Bytes::new();
        if request.expect_reply {
            body = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break Bytes::from(text),
                    Some(Ok(Message::Binary(data))) => break Bytes::from(data),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(protocol("websocket closed before reply"))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(protocol(format!("websocket read: {e}"))),
                }
            };
            rec.mark(Phase::FirstByte);
            rec.received(body.len());
        }

        // Close errors do not fail an operation that already has its reply
        let _ = ws.close(None).await;
        rec.mark(Phase::Read);

        Ok(Response {
            status: head.status,
            headers: head.headers,
            trailers: Headers::new(),
            body,
        })
    }
}

#[async_trait]
impl ProtocolClient for WsClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Websocket
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let mut rec = ctx.recorder(Some(ProtocolKind::Websocket), request.url.as_str());
        let deadline = request.timeout.unwrap_or(self.config.request_timeout);
        let res = guarded(&ctx.cancel, deadline, self.call(request, &mut rec)).await;
        finish(rec, res, |_| None)
    }

    async fn close(&self) -> Result<(), SurgeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_keys_are_random_16_bytes() {
        let a = new_key();
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
        assert_ne!(a, new_key());
    }
}
