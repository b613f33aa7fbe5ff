//! Client stream state machine (RFC 7540 §5.1)

use bytes::{Bytes, BytesMut};

use surge_core::Headers;

use super::{H2Error, Reason};
use crate::client::Response;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// One request/response exchange on a connection
#[derive(Debug)]
pub struct H2Stream {
    pub id: u32,
    pub state: StreamState,
    /// Outbound credit; may go negative after a SETTINGS change
    pub send_window: i64,
    /// Inbound credit we have granted
    pub recv_window: i64,
    status: Option<u16>,
    headers: Headers,
    trailers: Headers,
    body: BytesMut,
    reset: Option<Reason>,
}

impl H2Stream {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window: send_window as i64,
            recv_window: recv_window as i64,
            status: None,
            headers: Headers::new(),
            trailers: Headers::new(),
            body: BytesMut::new(),
            reset: None,
        }
    }

    fn stream_err(&self, reason: Reason) -> H2Error {
        H2Error::Stream {
            stream_id: self.id,
            reason,
        }
    }

    /// Our HEADERS went out
    pub fn send_headers(&mut self, end_stream: bool) {
        if self.state == StreamState::Idle {
            self.state = if end_stream {
                StreamState::HalfClosedLocal
            } else {
                StreamState::Open
            };
        }
    }

    /// Our final DATA frame carried END_STREAM
    pub fn send_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    fn recv_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    fn can_receive(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// A decoded header block arrived
    pub fn recv_headers(
        &mut self,
        fields: Vec<(String, String)>,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        if !self.can_receive() {
            return Err(self.stream_err(Reason::STREAM_CLOSED));
        }

        if self.status.is_none() {
            let mut status = None;
            let mut headers = Headers::new();
            for (name, value) in fields {
                if name == ":status" {
                    status = value.parse::<u16>().ok();
                } else if !name.starts_with(':') {
                    headers.append(name, value);
                }
            }
            let status = status.ok_or_else(|| self.stream_err(Reason::PROTOCOL_ERROR))?;
            // Informational responses precede the real one
            if (100..200).contains(&status) {
                return Ok(());
            }
            self.status = Some(status);
            self.headers = headers;
        } else {
            if !end_stream {
                return Err(self.stream_err(Reason::PROTOCOL_ERROR));
            }
            for (name, value) in fields {
                self.trailers.append(name, value);
            }
        }

        if end_stream {
            self.recv_end_stream();
        }
        Ok(())
    }

    /// A DATA payload arrived; flow control is settled by the connection
    pub fn recv_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), H2Error> {
        if !self.can_receive() || self.status.is_none() {
            return Err(self.stream_err(Reason::STREAM_CLOSED));
        }
        self.body.extend_from_slice(&data);
        if end_stream {
            self.recv_end_stream();
        }
        Ok(())
    }

    pub fn recv_reset(&mut self, reason: Reason) {
        self.reset = Some(reason);
        self.state = StreamState::Closed;
    }

    /// Final status, once response headers arrived
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn reset_reason(&self) -> Option<Reason> {
        self.reset
    }

    /// Peer finished its half
    pub fn is_remote_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn into_response(self) -> Response {
        Response {
            status: self.status.unwrap_or_default(),
            headers: self.headers,
            trailers: self.trailers,
            body: self.body.freeze(),
        }
    }
}
