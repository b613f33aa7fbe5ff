//! # gRPC Client
//!
//! Unary calls over the HTTP/2 client. Messages use the length-prefixed
//! framing:
//!
//! ```text
//!   +------------+--------------------+-----------------+
//!   | flag (u8)  | length (u32, BE)   | message bytes   |
//!   +------------+--------------------+-----------------+
//! ```
//!
//! The call status comes from `grpc-status` in the trailers, or in the
//! headers for trailers-only responses.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use surge_core::{ErrorKind, OpContext, OpError, OpRecorder, ProtocolKind, Request, SurgeError};

use crate::client::{finish, guarded, Outcome, ProtocolClient, Response};
use crate::http2::Http2Client;

pub const CONTENT_TYPE: &str = "application/grpc";

/// Frame one uncompressed message
pub fn encode_message(message: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(5 + message.len());
    out.put_u8(0);
    out.put_u32(message.len() as u32);
    out.put_slice(message);
    out.freeze()
}

/// Split a response body into its messages
pub fn decode_messages(mut body: Bytes) -> Result<Vec<Bytes>, SurgeError> {
    let mut messages = Vec::new();
    while body.has_remaining() {
        if body.len() < 5 {
            return Err(SurgeError::Protocol("truncated gRPC frame header".into()));
        }
        let compressed = body.get_u8();
        let len = body.get_u32() as usize;
        if compressed != 0 {
            return Err(SurgeError::Protocol(
                "compressed gRPC messages are not supported".into(),
            ));
        }
        if body.len() < len {
            return Err(SurgeError::Protocol(format!(
                "gRPC message of {len} bytes truncated"
            )));
        }
        messages.push(body.split_to(len));
    }
    Ok(messages)
}

/// Non-OK call status, if any
fn call_status(response: &Response) -> Option<OpError> {
    if response.status != 200 {
        return Some(OpError::new(
            ErrorKind::Protocol,
            format!("gRPC transport status {}", response.status),
        ));
    }
    let (code, message) = match response.trailers.get("grpc-status") {
        Some(code) => (code, response.trailers.get("grpc-message")),
        None => match response.headers.get("grpc-status") {
            Some(code) => (code, response.headers.get("grpc-message")),
            None => {
                return Some(OpError::new(ErrorKind::Protocol, "missing grpc-status"));
            }
        },
    };
    match code.trim() {
        "0" => None,
        code => Some(OpError::new(
            ErrorKind::Protocol,
            format!("grpc-status {code}: {}", message.unwrap_or_default()),
        )),
    }
}

pub struct GrpcClient {
    http2: Arc<Http2Client>,
}

impl GrpcClient {
    pub fn new(http2: Arc<Http2Client>) -> Self {
        Self { http2 }
    }

    async fn call(&self, request: &Request, rec: &mut OpRecorder) -> Result<Response, SurgeError> {
        let mut headers = request.headers.clone();
        headers.insert("content-type", CONTENT_TYPE);
        headers.insert("te", "trailers");
        let body = encode_message(&request.body.materialize());

        let mut response = self
            .http2
            .exchange_parts(&request.url, "POST", &headers, body, rec)
            .await?;
        if response.status == 200 && !response.body.is_empty() {
            let messages = decode_messages(response.body.clone())?;
            response.body = messages.into_iter().next().unwrap_or_default();
        }
        Ok(response)
    }
}

#[async_trait]
impl ProtocolClient for GrpcClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Grpc
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let mut rec = ctx.recorder(Some(ProtocolKind::Grpc), request.url.as_str());
        let deadline = request
            .timeout
            .unwrap_or(self.http2.config().request_timeout);
        let res = guarded(&ctx.cancel, deadline, self.call(request, &mut rec)).await;
        finish(rec, res, call_status)
    }

    async fn close(&self) -> Result<(), SurgeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_core::Headers;

    #[test]
    fn test_message_framing() {
        let framed = encode_message(b"ping");
        assert_eq!(&framed[..5], &[0, 0, 0, 0, 4]);

        let mut two = BytesMut::from(&framed[..]);
        two.extend_from_slice(&encode_message(b""));
        let messages = decode_messages(two.freeze()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..], b"ping");

        assert!(decode_messages(Bytes::from_static(&[1, 0, 0, 0, 0])).is_err());
        assert!(decode_messages(Bytes::from_static(&[0, 0, 0, 0, 9, 1])).is_err());
    }

    #[test]
    fn test_status_from_trailers_or_headers() {
        let mut ok = Response {
            status: 200,
            ..Default::default()
        };
        ok.trailers.insert("grpc-status", "0");
        assert!(call_status(&ok).is_none());

        let mut trailers_only = Response {
            status: 200,
            headers: Headers::new(),
            ..Default::default()
        };
        trailers_only.headers.insert("grpc-status", "5");
        trailers_only.headers.insert("grpc-message", "not found");
        let err = call_status(&trailers_only).unwrap();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(err.message.contains("not found"));

        let missing = Response {
            status: 200,
            ..Default::default()
        };
        assert!(call_status(&missing).is_some());
    }
}
