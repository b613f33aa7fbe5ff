//! # HTTP/2 Frame Engine
//!
//! Client half of RFC 7540, driving one request/response stream at a time
//! per connection.
//!
//! ```text
//!   ┌──────────────┐   frames    ┌──────────────┐
//!   │ H2Connection │ ──────────► │    server    │
//!   │  hpack enc   │ ◄────────── │              │
//!   │  hpack dec   │             └──────────────┘
//!   │  windows     │
//!   │  H2Stream    │  idle ─► open ─► half-closed(local) ─► closed
//!   └──────────────┘
//! ```
//!
//! Connection errors poison the connection (GOAWAY is sent and the pool
//! discards it); stream errors fail only the owning request.

pub mod connection;
pub mod frame;
pub mod hpack;
pub mod stream;

use std::fmt;
use thiserror::Error;

use surge_core::SurgeError;

pub use connection::H2Connection;
pub use frame::{Frame, FrameHeader, Settings};
pub use hpack::HpackError;
pub use stream::{H2Stream, StreamState};

/// HTTP/2 error code (RFC 7540 §7)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reason(pub u32);

impl Reason {
    pub const NO_ERROR: Reason = Reason(0x0);
    pub const PROTOCOL_ERROR: Reason = Reason(0x1);
    pub const INTERNAL_ERROR: Reason = Reason(0x2);
    pub const FLOW_CONTROL_ERROR: Reason = Reason(0x3);
    pub const SETTINGS_TIMEOUT: Reason = Reason(0x4);
    pub const STREAM_CLOSED: Reason = Reason(0x5);
    pub const FRAME_SIZE_ERROR: Reason = Reason(0x6);
    pub const REFUSED_STREAM: Reason = Reason(0x7);
    pub const CANCEL: Reason = Reason(0x8);
    pub const COMPRESSION_ERROR: Reason = Reason(0x9);
    pub const CONNECT_ERROR: Reason = Reason(0xa);
    pub const ENHANCE_YOUR_CALM: Reason = Reason(0xb);
    pub const INADEQUATE_SECURITY: Reason = Reason(0xc);
    pub const HTTP_1_1_REQUIRED: Reason = Reason(0xd);

    pub fn name(&self) -> Option<&'static str> {
        Some(match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        })
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Errors raised by the frame engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum H2Error {
    /// Fatal to the whole connection
    #[error("connection error {reason}: {message}")]
    Connection { reason: Reason, message: String },

    /// Fatal to one stream only
    #[error("stream {stream_id} reset: {reason}")]
    Stream { stream_id: u32, reason: Reason },

    #[error("hpack: {0}")]
    Hpack(#[from] HpackError),

    #[error("peer sent GOAWAY ({reason})")]
    GoAway { reason: Reason },

    #[error("io: {0}")]
    Io(String),
}

impl H2Error {
    /// Whether the connection must be discarded
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, H2Error::Stream { .. })
    }

    /// Code to put in our GOAWAY for a locally detected connection error
    pub fn reason(&self) -> Reason {
        match self {
            H2Error::Connection { reason, .. } | H2Error::Stream { reason, .. } => *reason,
            H2Error::Hpack(_) => Reason::COMPRESSION_ERROR,
            H2Error::GoAway { reason } => *reason,
            H2Error::Io(_) => Reason::INTERNAL_ERROR,
        }
    }
}

impl From<std::io::Error> for H2Error {
    fn from(err: std::io::Error) -> Self {
        H2Error::Io(err.to_string())
    }
}

impl From<H2Error> for SurgeError {
    fn from(err: H2Error) -> Self {
        SurgeError::Protocol(format!("h2: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_core::ErrorKind;

    #[test]
    fn test_reason_display() {
        assert_eq!(Reason::FLOW_CONTROL_ERROR.to_string(), "FLOW_CONTROL_ERROR");
        assert_eq!(Reason(0xff).to_string(), "0xff");
    }

    #[test]
    fn test_error_classification() {
        let stream = H2Error::Stream {
            stream_id: 3,
            reason: Reason::CANCEL,
        };
        assert!(!stream.is_connection_error());
        let hpack = H2Error::from(HpackError::InvalidHuffman);
        assert!(hpack.is_connection_error());
        assert_eq!(hpack.reason(), Reason::COMPRESSION_ERROR);
        assert_eq!(SurgeError::from(hpack).kind(), ErrorKind::Protocol);
    }
}
