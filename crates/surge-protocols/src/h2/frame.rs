//! HTTP/2 frames (RFC 7540 §4, §6)
//!
//! ```text
//!  +-----------------------------------------------+
//!  |                 Length (24)                   |
//!  +---------------+---------------+---------------+
//!  |   Type (8)    |   Flags (8)   |
//!  +-+-------------+---------------+-------------------------------+
//!  |R|                 Stream Identifier (31)                      |
//!  +=+=============================================================+
//!  |                   Frame Payload (0...)                      ...
//!  +---------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{H2Error, Reason};

/// Client connection preface
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const HEADER_LEN: usize = 9;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const DEFAULT_WINDOW: u32 = 65_535;
pub const MAX_WINDOW: u32 = (1 << 31) - 1;

pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// SETTINGS parameter identifiers
pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// The fixed 9-byte frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(raw: &[u8]) -> Self {
        let length = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
        let stream_id = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & MAX_WINDOW;
        Self {
            length,
            kind: raw[3],
            flags: raw[4],
            stream_id,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.length.to_be_bytes()[1..]);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & MAX_WINDOW);
    }
}

/// A decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Payload length including padding, as counted by flow control
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        reason: Reason,
    },
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        reason: Reason,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown frame types are ignored
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

fn conn_err(reason: Reason, msg: &str) -> H2Error {
    H2Error::Connection {
        reason,
        message: msg.to_string(),
    }
}

/// Strip PADDED padding, returning the content
fn unpad(frame_flags: u8, mut payload: Bytes) -> Result<Bytes, H2Error> {
    if frame_flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(conn_err(Reason::PROTOCOL_ERROR, "padded frame without pad length"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(conn_err(Reason::PROTOCOL_ERROR, "padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

impl Frame {
    /// Decode a frame from its header and complete payload
    pub fn decode(head: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        let sid = head.stream_id;
        let require_stream = |kind: &str| {
            if sid == 0 {
                Err(conn_err(
                    Reason::PROTOCOL_ERROR,
                    &format!("{kind} frame on stream 0"),
                ))
            } else {
                Ok(())
            }
        };
        let require_conn = |kind: &str| {
            if sid != 0 {
                Err(conn_err(
                    Reason::PROTOCOL_ERROR,
                    &format!("{kind} frame on stream {sid}"),
                ))
            } else {
                Ok(())
            }
        };

        match head.kind {
            kind::DATA => {
                require_stream("DATA")?;
                let flow_len = payload.len() as u32;
                Ok(Frame::Data {
                    stream_id: sid,
                    data: unpad(head.flags, payload)?,
                    end_stream: head.flags & flags::END_STREAM != 0,
                    flow_len,
                })
            }
            kind::HEADERS => {
                require_stream("HEADERS")?;
                let mut block = unpad(head.flags, payload)?;
                if head.flags & flags::PRIORITY != 0 {
                    if block.len() < 5 {
                        return Err(conn_err(Reason::FRAME_SIZE_ERROR, "short HEADERS priority"));
                    }
                    block.advance(5);
                }
                Ok(Frame::Headers {
                    stream_id: sid,
                    block,
                    end_stream: head.flags & flags::END_STREAM != 0,
                    end_headers: head.flags & flags::END_HEADERS != 0,
                })
            }
            kind::PRIORITY => {
                require_stream("PRIORITY")?;
                if payload.len() != 5 {
                    return Err(H2Error::Stream {
                        stream_id: sid,
                        reason: Reason::FRAME_SIZE_ERROR,
                    });
                }
                Ok(Frame::Priority { stream_id: sid })
            }
            kind::RST_STREAM => {
                require_stream("RST_STREAM")?;
                if payload.len() != 4 {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "RST_STREAM length"));
                }
                let mut p = payload;
                Ok(Frame::RstStream {
                    stream_id: sid,
                    reason: Reason(p.get_u32()),
                })
            }
            kind::SETTINGS => {
                require_conn("SETTINGS")?;
                let ack = head.flags & flags::ACK != 0;
                if ack && !payload.is_empty() {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "SETTINGS ack with payload"));
                }
                if payload.len() % 6 != 0 {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "SETTINGS length"));
                }
                let mut p = payload;
                let mut params = Vec::with_capacity(p.len() / 6);
                while p.has_remaining() {
                    params.push((p.get_u16(), p.get_u32()));
                }
                Ok(Frame::Settings { ack, params })
            }
            kind::PUSH_PROMISE => {
                require_stream("PUSH_PROMISE")?;
                let mut p = unpad(head.flags, payload)?;
                if p.len() < 4 {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "PUSH_PROMISE length"));
                }
                Ok(Frame::PushPromise {
                    stream_id: sid,
                    promised_id: p.get_u32() & MAX_WINDOW,
                })
            }
            kind::PING => {
                require_conn("PING")?;
                if payload.len() != 8 {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "PING length"));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping {
                    ack: head.flags & flags::ACK != 0,
                    payload: data,
                })
            }
            kind::GOAWAY => {
                require_conn("GOAWAY")?;
                if payload.len() < 8 {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "GOAWAY length"));
                }
                let mut p = payload;
                let last_stream_id = p.get_u32() & MAX_WINDOW;
                let reason = Reason(p.get_u32());
                Ok(Frame::GoAway {
                    last_stream_id,
                    reason,
                    debug: p,
                })
            }
            kind::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(conn_err(Reason::FRAME_SIZE_ERROR, "WINDOW_UPDATE length"));
                }
                let mut p = payload;
                Ok(Frame::WindowUpdate {
                    stream_id: sid,
                    increment: p.get_u32() & MAX_WINDOW,
                })
            }
            kind::CONTINUATION => {
                require_stream("CONTINUATION")?;
                Ok(Frame::Continuation {
                    stream_id: sid,
                    block: payload,
                    end_headers: head.flags & flags::END_HEADERS != 0,
                })
            }
            other => Ok(Frame::Unknown {
                kind: other,
                stream_id: sid,
            }),
        }
    }

    /// Append the wire form of this frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        let (kind, flags, stream_id, payload): (u8, u8, u32, Bytes) = match self {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                ..
            } => (
                kind::DATA,
                if *end_stream { flags::END_STREAM } else { 0 },
                *stream_id,
                data.clone(),
            ),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                let mut f = 0;
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                (kind::HEADERS, f, *stream_id, block.clone())
            }
            Frame::Priority { stream_id } => (
                kind::PRIORITY,
                0,
                *stream_id,
                Bytes::from_static(&[0, 0, 0, 0, 15]),
            ),
            Frame::RstStream { stream_id, reason } => (
                kind::RST_STREAM,
                0,
                *stream_id,
                Bytes::copy_from_slice(&reason.0.to_be_bytes()),
            ),
            Frame::Settings { ack, params } => {
                let mut p = BytesMut::with_capacity(params.len() * 6);
                for (id, value) in params {
                    p.put_u16(*id);
                    p.put_u32(*value);
                }
                (
                    kind::SETTINGS,
                    if *ack { flags::ACK } else { 0 },
                    0,
                    p.freeze(),
                )
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
            } => (
                kind::PUSH_PROMISE,
                flags::END_HEADERS,
                *stream_id,
                Bytes::copy_from_slice(&promised_id.to_be_bytes()),
            ),
            Frame::Ping { ack, payload } => (
                kind::PING,
                if *ack { flags::ACK } else { 0 },
                0,
                Bytes::copy_from_slice(payload),
            ),
            Frame::GoAway {
                last_stream_id,
                reason,
                debug,
            } => {
                let mut p = BytesMut::with_capacity(8 + debug.len());
                p.put_u32(*last_stream_id);
                p.put_u32(reason.0);
                p.put_slice(debug);
                (kind::GOAWAY, 0, 0, p.freeze())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => (
                kind::WINDOW_UPDATE,
                0,
                *stream_id,
                Bytes::copy_from_slice(&increment.to_be_bytes()),
            ),
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => (
                kind::CONTINUATION,
                if *end_headers { flags::END_HEADERS } else { 0 },
                *stream_id,
                block.clone(),
            ),
            Frame::Unknown { kind, stream_id } => (*kind, 0, *stream_id, Bytes::new()),
        };
        FrameHeader {
            length: payload.len() as u32,
            kind,
            flags,
            stream_id,
        }
        .encode(dst);
        dst.put_slice(&payload);
    }
}

/// Peer or local SETTINGS values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Apply received parameters, validating their ranges (RFC 7540 §6.5.2)
    pub fn apply(&mut self, params: &[(u16, u32)]) -> Result<(), H2Error> {
        for &(id, value) in params {
            match id {
                setting::HEADER_TABLE_SIZE => self.header_table_size = value,
                setting::ENABLE_PUSH => match value {
                    0 => self.enable_push = false,
                    1 => self.enable_push = true,
                    _ => return Err(conn_err(Reason::PROTOCOL_ERROR, "ENABLE_PUSH not 0/1")),
                },
                setting::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                setting::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW {
                        return Err(conn_err(
                            Reason::FLOW_CONTROL_ERROR,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    self.initial_window_size = value;
                }
                setting::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(conn_err(Reason::PROTOCOL_ERROR, "MAX_FRAME_SIZE out of range"));
                    }
                    self.max_frame_size = value;
                }
                setting::MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// Parameters that differ from protocol defaults, for our SETTINGS frame
    pub fn to_params(&self) -> Vec<(u16, u32)> {
        let defaults = Settings::default();
        let mut params = Vec::new();
        if self.header_table_size != defaults.header_table_size {
            params.push((setting::HEADER_TABLE_SIZE, self.header_table_size));
        }
        if !self.enable_push {
            params.push((setting::ENABLE_PUSH, 0));
        }
        if let Some(n) = self.max_concurrent_streams {
            params.push((setting::MAX_CONCURRENT_STREAMS, n));
        }
        if self.initial_window_size != defaults.initial_window_size {
            params.push((setting::INITIAL_WINDOW_SIZE, self.initial_window_size));
        }
        if self.max_frame_size != defaults.max_frame_size {
            params.push((setting::MAX_FRAME_SIZE, self.max_frame_size));
        }
        if let Some(n) = self.max_header_list_size {
            params.push((setting::MAX_HEADER_LIST_SIZE, n));
        }
        params
    }
}
