//! HTTP/2 client connection
//!
//! Owns one transport, both HPACK tables, the connection-level windows and
//! at most one active stream. Frames are read into a single inbound buffer
//! and dispatched in arrival order; the exchange loop runs until the active
//! stream's remote half closes.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use surge_core::{Headers, OpRecorder, Phase, Url};

use super::frame::{self, Frame, FrameHeader, Settings, DEFAULT_WINDOW, HEADER_LEN, MAX_WINDOW, PREFACE};
use super::hpack::{Decoder, Encoder};
use super::stream::H2Stream;
use super::{H2Error, Reason};
use crate::client::{ClientConfig, Response};
use crate::pool::Poolable;
use crate::transport::{Probe, Stream};

const READ_CHUNK: usize = 16 * 1024;

/// Advertised MAX_HEADER_LIST_SIZE
const MAX_HEADER_LIST: u32 = 65_535;

/// Headers that are meaningless on HTTP/2 (RFC 7540 §8.1.2.2)
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn conn_err(reason: Reason, message: impl Into<String>) -> H2Error {
    H2Error::Connection {
        reason,
        message: message.into(),
    }
}

/// Header block being assembled from HEADERS + CONTINUATION
struct PartialBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

pub struct H2Connection {
    stream: Stream,
    read_buf: BytesMut,
    local: Settings,
    remote: Settings,
    pending_acks: usize,
    encoder: Encoder,
    decoder: Decoder,
    next_stream_id: u32,
    /// Connection-level outbound credit
    send_window: i64,
    /// Connection-level inbound credit
    recv_window: i64,
    active: Option<H2Stream>,
    partial: Option<PartialBlock>,
    going_away: bool,
    broken: bool,
    bytes_in: usize,
    bytes_out: usize,
}

impl H2Connection {
    /// Send the preface and our SETTINGS, then wait for the peer's SETTINGS
    pub async fn handshake(stream: Stream, config: &ClientConfig) -> Result<Self, H2Error> {
        let local = Settings {
            enable_push: false,
            max_concurrent_streams: Some(config.pool_size as u32),
            initial_window_size: config.h2_initial_window.min(MAX_WINDOW),
            max_header_list_size: Some(MAX_HEADER_LIST),
            ..Settings::default()
        };
        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            local,
            remote: Settings::default(),
            pending_acks: 0,
            encoder: Encoder::default(),
            decoder: Decoder::new(local.header_table_size as usize, MAX_HEADER_LIST as usize),
            next_stream_id: 1,
            send_window: DEFAULT_WINDOW as i64,
            recv_window: DEFAULT_WINDOW as i64,
            active: None,
            partial: None,
            going_away: false,
            broken: false,
            bytes_in: 0,
            bytes_out: 0,
        };

        let mut out = BytesMut::with_capacity(64);
        out.extend_from_slice(PREFACE);
        Frame::Settings {
            ack: false,
            params: conn.local.to_params(),
        }
        .encode(&mut out);
        conn.write_raw(&out).await?;
        conn.pending_acks += 1;

        // The first frame from the server must be SETTINGS
        match conn.read_frame().await? {
            Frame::Settings { ack: false, params } => conn.on_settings(&params).await?,
            other => {
                return Err(conn.fail(conn_err(
                    Reason::PROTOCOL_ERROR,
                    format!("expected SETTINGS, got {other:?}"),
                ))
                .await)
            }
        }
        trace!(remote = ?conn.remote, "h2 handshake complete");
        Ok(conn)
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }

    /// Whether a new stream may be started
    pub fn is_usable(&self) -> bool {
        !self.broken && !self.going_away && self.active.is_none()
    }

    /// Send one request and read its response on a fresh stream
    #[allow(clippy::too_many_arguments)]
    pub async fn round_trip(
        &mut self,
        method: &str,
        url: &Url,
        headers: &Headers,
        body: Bytes,
        user_agent: &str,
        max_body: usize,
        rec: &mut OpRecorder,
    ) -> Result<Response, H2Error> {
        if self.broken {
            return Err(conn_err(Reason::INTERNAL_ERROR, "connection is closed"));
        }
        if self.going_away {
            return Err(H2Error::GoAway {
                reason: Reason::NO_ERROR,
            });
        }
        self.bytes_in = 0;
        self.bytes_out = 0;

        let res = self
            .exchange(method, url, headers, body, user_agent, max_body, rec)
            .await;
        rec.sent(self.bytes_out);
        rec.received(self.bytes_in);
        match res {
            Ok(response) => Ok(response),
            Err(e) if e.is_connection_error() => Err(self.fail(e).await),
            Err(e) => {
                if let H2Error::Stream { stream_id, reason } = &e {
                    // Peer resets need no answer
                    let peer_reset = self
                        .active
                        .as_ref()
                        .and_then(H2Stream::reset_reason)
                        .is_some();
                    if !peer_reset {
                        let _ = self
                            .write_frame(Frame::RstStream {
                                stream_id: *stream_id,
                                reason: *reason,
                            })
                            .await;
                    }
                }
                self.active = None;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &mut self,
        method: &str,
        url: &Url,
        headers: &Headers,
        body: Bytes,
        user_agent: &str,
        max_body: usize,
        rec: &mut OpRecorder,
    ) -> Result<Response, H2Error> {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        self.active = Some(H2Stream::new(
            id,
            self.remote.initial_window_size,
            self.local.initial_window_size,
        ));

        let authority = headers
            .get("host")
            .map(str::to_string)
            .unwrap_or_else(|| url.authority());
        let path = url.path_and_query();
        let mut fields: Vec<(String, String)> = vec![
            (":method".into(), method.to_string()),
            (":scheme".into(), if url.is_tls() { "https" } else { "http" }.into()),
            (":authority".into(), authority),
            (":path".into(), path),
        ];
        for (name, value) in headers.iter() {
            let name = name.to_ascii_lowercase();
            if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                continue;
            }
            if name == "te" && !value.eq_ignore_ascii_case("trailers") {
                continue;
            }
            fields.push((name, value.to_string()));
        }
        if !headers.contains("user-agent") {
            fields.push(("user-agent".into(), user_agent.to_string()));
        }
        if !body.is_empty() && !headers.contains("content-length") {
            fields.push(("content-length".into(), body.len().to_string()));
        }

        let mut block = BytesMut::new();
        self.encoder
            .encode(fields.iter().map(|(n, v)| (n.as_str(), v.as_str())), &mut block);
        let end_stream = body.is_empty();
        self.send_headers(id, block.freeze(), end_stream).await?;
        if let Some(stream) = self.active.as_mut() {
            stream.send_headers(end_stream);
        }
        if !end_stream {
            self.send_body(id, body).await?;
        }
        rec.mark(Phase::Write);

        let mut first_byte = false;
        loop {
            let frame = self.read_frame().await?;
            self.dispatch(frame).await?;

            let Some(stream) = self.active.as_ref() else {
                return Err(conn_err(Reason::INTERNAL_ERROR, "active stream lost"));
            };
            if !first_byte && (stream.status().is_some() || stream.reset_reason().is_some()) {
                first_byte = true;
                rec.mark(Phase::FirstByte);
            }
            if let Some(reason) = stream.reset_reason() {
                return Err(H2Error::Stream {
                    stream_id: id,
                    reason,
                });
            }
            if stream.body_len() > max_body {
                return Err(H2Error::Stream {
                    stream_id: id,
                    reason: Reason::CANCEL,
                });
            }
            if stream.is_remote_closed() {
                break;
            }
        }

        rec.mark(Phase::Read);
        let stream = self
            .active
            .take()
            .ok_or_else(|| conn_err(Reason::INTERNAL_ERROR, "active stream lost"))?;
        Ok(stream.into_response())
    }

    /// HEADERS followed by CONTINUATION frames, split at the peer's frame size
    async fn send_headers(
        &mut self,
        id: u32,
        block: Bytes,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let max = self.remote.max_frame_size as usize;
        let mut out = BytesMut::with_capacity(block.len() + HEADER_LEN * (1 + block.len() / max));
        let mut rest = block;
        let first = rest.split_to(rest.len().min(max));
        Frame::Headers {
            stream_id: id,
            block: first,
            end_stream,
            end_headers: rest.is_empty(),
        }
        .encode(&mut out);
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            Frame::Continuation {
                stream_id: id,
                block: chunk,
                end_headers: rest.is_empty(),
            }
            .encode(&mut out);
        }
        self.write_raw(&out).await
    }

    /// DATA frames within both outbound windows; waits for WINDOW_UPDATE
    /// whenever either window is exhausted
    async fn send_body(&mut self, id: u32, mut body: Bytes) -> Result<(), H2Error> {
        while !body.is_empty() {
            let stream_window = match self.active.as_ref() {
                Some(stream) => {
                    if let Some(reason) = stream.reset_reason() {
                        return Err(H2Error::Stream {
                            stream_id: id,
                            reason,
                        });
                    }
                    stream.send_window
                }
                None => return Err(conn_err(Reason::INTERNAL_ERROR, "active stream lost")),
            };
            let available = self
                .send_window
                .min(stream_window)
                .min(self.remote.max_frame_size as i64);
            if available <= 0 {
                trace!(
                    stream = id,
                    conn_window = self.send_window,
                    stream_window,
                    "send blocked on flow control"
                );
                let frame = self.read_frame().await?;
                self.dispatch(frame).await?;
                continue;
            }

            let chunk = body.split_to(body.len().min(available as usize));
            let last = body.is_empty();
            self.send_window -= chunk.len() as i64;
            if let Some(stream) = self.active.as_mut() {
                stream.send_window -= chunk.len() as i64;
                if last {
                    stream.send_end_stream();
                }
            }
            let flow_len = chunk.len() as u32;
            self.write_frame(Frame::Data {
                stream_id: id,
                data: chunk,
                end_stream: last,
                flow_len,
            })
            .await?;
        }
        Ok(())
    }

    /// Read one complete frame
    async fn read_frame(&mut self) -> Result<Frame, H2Error> {
        self.ensure(HEADER_LEN).await?;
        let head = FrameHeader::parse(&self.read_buf[..HEADER_LEN]);
        if head.length > self.local.max_frame_size {
            return Err(conn_err(
                Reason::FRAME_SIZE_ERROR,
                format!("frame of {} bytes exceeds limit", head.length),
            ));
        }
        let total = HEADER_LEN + head.length as usize;
        self.ensure(total).await?;
        let mut raw = self.read_buf.split_to(total).freeze();
        let payload = raw.split_off(HEADER_LEN);
        Frame::decode(head, payload)
    }

    async fn ensure(&mut self, n: usize) -> Result<(), H2Error> {
        while self.read_buf.len() < n {
            self.read_buf.reserve(READ_CHUNK);
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(H2Error::Io("connection closed by peer".into()));
            }
            self.bytes_in += read;
        }
        Ok(())
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        let mut out = BytesMut::with_capacity(HEADER_LEN + 64);
        frame.encode(&mut out);
        self.write_raw(&out).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), H2Error> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        self.bytes_out += bytes.len();
        Ok(())
    }

    /// Apply one inbound frame
    async fn dispatch(&mut self, frame: Frame) -> Result<(), H2Error> {
        if let Some(partial) = &self.partial {
            let continues = matches!(
                &frame,
                Frame::Continuation { stream_id, .. } if *stream_id == partial.stream_id
            );
            if !continues {
                return Err(conn_err(Reason::PROTOCOL_ERROR, "expected CONTINUATION"));
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, data, end_stream, flow_len).await,
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.on_header_block(stream_id, &block, end_stream)
                } else {
                    self.partial = Some(PartialBlock {
                        stream_id,
                        block: BytesMut::from(&block[..]),
                        end_stream,
                    });
                    Ok(())
                }
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let Some(mut partial) = self.partial.take() else {
                    return Err(conn_err(Reason::PROTOCOL_ERROR, "unexpected CONTINUATION"));
                };
                partial.block.extend_from_slice(&block);
                if end_headers {
                    self.on_header_block(stream_id, &partial.block, partial.end_stream)
                } else {
                    self.partial = Some(partial);
                    Ok(())
                }
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => Ok(()),
            Frame::RstStream { stream_id, reason } => {
                if let Some(stream) = self.active.as_mut().filter(|s| s.id == stream_id) {
                    debug!(stream = stream_id, %reason, "stream reset by peer");
                    stream.recv_reset(reason);
                }
                Ok(())
            }
            Frame::Settings { ack: true, .. } => {
                self.pending_acks = self.pending_acks.saturating_sub(1);
                Ok(())
            }
            Frame::Settings { ack: false, params } => self.on_settings(&params).await,
            Frame::PushPromise { .. } => Err(conn_err(
                Reason::PROTOCOL_ERROR,
                "PUSH_PROMISE received with push disabled",
            )),
            Frame::Ping { ack: false, payload } => {
                self.write_frame(Frame::Ping { ack: true, payload }).await
            }
            Frame::Ping { ack: true, .. } => Ok(()),
            Frame::GoAway {
                last_stream_id,
                reason,
                ..
            } => {
                debug!(last_stream_id, %reason, "peer sent GOAWAY");
                self.going_away = true;
                if let Some(stream) = self.active.as_mut().filter(|s| s.id > last_stream_id) {
                    stream.recv_reset(Reason::REFUSED_STREAM);
                }
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment),
        }
    }

    async fn on_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
    ) -> Result<(), H2Error> {
        if stream_id >= self.next_stream_id {
            return Err(conn_err(Reason::PROTOCOL_ERROR, "DATA on idle stream"));
        }
        let flow = flow_len as i64;
        if flow > self.recv_window {
            return Err(conn_err(
                Reason::FLOW_CONTROL_ERROR,
                "peer exceeded connection window",
            ));
        }
        self.recv_window -= flow;

        let mut stream_refill = None;
        if let Some(stream) = self.active.as_mut().filter(|s| s.id == stream_id) {
            if flow > stream.recv_window {
                return Err(conn_err(
                    Reason::FLOW_CONTROL_ERROR,
                    format!("peer exceeded window of stream {stream_id}"),
                ));
            }
            stream.recv_window -= flow;
            stream.recv_data(data, end_stream)?;
            let initial = self.local.initial_window_size as i64;
            if !stream.is_remote_closed() && stream.recv_window < initial / 2 {
                stream_refill = Some((initial - stream.recv_window) as u32);
                stream.recv_window = initial;
            }
        }

        if self.recv_window < DEFAULT_WINDOW as i64 / 2 {
            let increment = (DEFAULT_WINDOW as i64 - self.recv_window) as u32;
            self.recv_window = DEFAULT_WINDOW as i64;
            self.write_frame(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            })
            .await?;
        }
        if let Some(increment) = stream_refill {
            self.write_frame(Frame::WindowUpdate {
                stream_id,
                increment,
            })
            .await?;
        }
        Ok(())
    }

    fn on_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        // Always decode so the dynamic table stays in sync
        let fields = self.decoder.decode(block)?;
        match self.active.as_mut().filter(|s| s.id == stream_id) {
            Some(stream) => stream.recv_headers(fields, end_stream),
            None => Ok(()),
        }
    }

    async fn on_settings(&mut self, params: &[(u16, u32)]) -> Result<(), H2Error> {
        let old_window = self.remote.initial_window_size as i64;
        self.remote.apply(params)?;
        let delta = self.remote.initial_window_size as i64 - old_window;
        if delta != 0 {
            if let Some(stream) = self.active.as_mut() {
                stream.send_window += delta;
                if stream.send_window > MAX_WINDOW as i64 {
                    return Err(conn_err(Reason::FLOW_CONTROL_ERROR, "stream window overflow"));
                }
            }
        }
        if params.iter().any(|(id, _)| *id == frame::setting::HEADER_TABLE_SIZE) {
            self.encoder.set_max_size(self.remote.header_table_size as usize);
        }
        self.write_frame(Frame::Settings {
            ack: true,
            params: Vec::new(),
        })
        .await
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        if stream_id == 0 {
            if increment == 0 {
                return Err(conn_err(Reason::PROTOCOL_ERROR, "zero WINDOW_UPDATE"));
            }
            self.send_window += increment as i64;
            if self.send_window > MAX_WINDOW as i64 {
                return Err(conn_err(Reason::FLOW_CONTROL_ERROR, "connection window overflow"));
            }
            return Ok(());
        }
        if let Some(stream) = self.active.as_mut().filter(|s| s.id == stream_id) {
            if increment == 0 {
                return Err(H2Error::Stream {
                    stream_id,
                    reason: Reason::PROTOCOL_ERROR,
                });
            }
            stream.send_window += increment as i64;
            if stream.send_window > MAX_WINDOW as i64 {
                return Err(H2Error::Stream {
                    stream_id,
                    reason: Reason::FLOW_CONTROL_ERROR,
                });
            }
        }
        Ok(())
    }

    /// Poison the connection after a connection error, telling the peer why
    async fn fail(&mut self, err: H2Error) -> H2Error {
        if !self.broken {
            self.broken = true;
            self.active = None;
            if !matches!(err, H2Error::Io(_)) {
                let last_stream_id = self.next_stream_id.saturating_sub(2);
                let _ = self
                    .write_frame(Frame::GoAway {
                        last_stream_id,
                        reason: err.reason(),
                        debug: Bytes::new(),
                    })
                    .await;
            }
            debug!(error = %err, "h2 connection failed");
        }
        err
    }
}

impl Poolable for H2Connection {
    fn is_open(&mut self) -> bool {
        if !self.is_usable() {
            return false;
        }
        // Buffered frames (PING, SETTINGS) are handled on the next exchange
        self.stream.probe(&mut self.read_buf) != Probe::Closed
    }
}
