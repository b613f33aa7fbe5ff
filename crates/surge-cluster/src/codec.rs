//! # Wire Framing
//!
//! ```text
//!   ┌──────────────┬───────────────────────────────────────────────┐
//!   │ len: u32 BE  │ payload                                       │
//!   └──────────────┴───────────────────────────────────────────────┘
//!   payload = bincode(Message)
//!           → zstd               (if negotiated)
//!           → nonce ‖ AES-256-GCM(…) with AAD = len  (if negotiated)
//! ```
//!
//! A connection opens with one HELLO frame in each direction, sent in the
//! clear. Compression is used when both sides ask for it; encryption must be
//! configured identically on both sides or the handshake fails. Nonces are a
//! random 4-byte connection prefix plus a 64-bit counter; a receiver rejects
//! counters that do not increase.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ClusterError, Result};
use crate::message::{Hello, Message, PROTOCOL_VERSION};

/// Largest accepted frame payload
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

const TAG_LEN: usize = 16;

/// 256-bit shared cluster secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ClusterKey([u8; 32]);

impl ClusterKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(text.trim()).map_err(|e| ClusterError::InvalidKey(e.to_string()))?,
        );
        let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ClusterError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }

    fn cipher(&self) -> Result<LessSafeKey> {
        let key = UnboundKey::new(&AES_256_GCM, &self.0)
            .map_err(|_| ClusterError::InvalidKey("rejected by AES-256-GCM".into()))?;
        Ok(LessSafeKey::new(key))
    }
}

impl fmt::Debug for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClusterKey(..)")
    }
}

/// Wire settings for cluster connections
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireConfig {
    /// Ask peers for zstd compression
    #[serde(default)]
    pub compress: bool,

    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Hex-encoded AES-256-GCM key shared by every node
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_frame() -> usize {
    MAX_FRAME
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            compress: false,
            compression_level: default_compression_level(),
            key: None,
            max_frame: default_max_frame(),
        }
    }
}

impl WireConfig {
    pub fn cluster_key(&self) -> Result<Option<ClusterKey>> {
        self.key.as_deref().map(ClusterKey::from_hex).transpose()
    }

    fn hello(&self) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            compress: self.compress,
            encrypt: self.key.is_some(),
        }
    }
}

struct Sealer {
    key: LessSafeKey,
    prefix: [u8; 4],
    sent: u64,
    received: Option<u64>,
}

impl Sealer {
    fn new(key: &ClusterKey) -> Result<Self> {
        Ok(Self {
            key: key.cipher()?,
            prefix: rand::random(),
            sent: 0,
            received: None,
        })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.sent.to_be_bytes());
        self.sent += 1;
        nonce
    }
}

/// Per-connection frame encoder/decoder with negotiated settings
pub struct FrameCodec {
    compress: bool,
    level: i32,
    max_frame: usize,
    sealer: Option<Sealer>,
}

impl FrameCodec {
    /// No compression, no encryption
    pub fn plain() -> Self {
        Self {
            compress: false,
            level: default_compression_level(),
            max_frame: MAX_FRAME,
            sealer: None,
        }
    }

    pub fn new(
        compress: bool,
        level: i32,
        max_frame: usize,
        key: Option<&ClusterKey>,
    ) -> Result<Self> {
        Ok(Self {
            compress,
            level,
            max_frame,
            sealer: key.map(Sealer::new).transpose()?,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealer.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Length-prefixed frame for `msg`
    pub fn encode(&mut self, msg: &Message) -> Result<Vec<u8>> {
        let mut body = bincode::serialize(msg)?;
        if self.compress {
            body = zstd::bulk::compress(&body, self.level)
                .map_err(|e| ClusterError::Compression(e.to_string()))?;
        }
        let Some(sealer) = self.sealer.as_mut() else {
            return frame(body, self.max_frame);
        };

        let len = NONCE_LEN + body.len() + TAG_LEN;
        let prefix = length_prefix(len, self.max_frame)?;
        let nonce = sealer.next_nonce();
        sealer
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(prefix),
                &mut body,
            )
            .map_err(|_| ClusterError::Decrypt)?;

        let mut out = Vec::with_capacity(4 + len);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a payload read after `prefix`
    pub fn decode(&mut self, prefix: [u8; 4], mut payload: Vec<u8>) -> Result<Message> {
        if let Some(sealer) = self.sealer.as_mut() {
            if payload.len() < NONCE_LEN + TAG_LEN {
                return Err(ClusterError::Decrypt);
            }
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&payload[..NONCE_LEN]);
            let mut counter = [0u8; 8];
            counter.copy_from_slice(&nonce[4..]);
            let counter = u64::from_be_bytes(counter);
            if sealer.received.is_some_and(|last| counter <= last) {
                return Err(ClusterError::Decrypt);
            }

            let mut sealed = payload.split_off(NONCE_LEN);
            let plain_len = sealer
                .key
                .open_in_place(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::from(prefix),
                    &mut sealed,
                )
                .map_err(|_| ClusterError::Decrypt)?
                .len();
            sealed.truncate(plain_len);
            sealer.received = Some(counter);
            payload = sealed;
        }
        if self.compress {
            payload = zstd::bulk::decompress(&payload, self.max_frame)
                .map_err(|e| ClusterError::Compression(e.to_string()))?;
        }
        Ok(bincode::deserialize(&payload)?)
    }
}

fn length_prefix(len: usize, max: usize) -> Result<[u8; 4]> {
    if len > max {
        return Err(ClusterError::FrameTooLarge { len, max });
    }
    Ok((len as u32).to_be_bytes())
}

fn frame(body: Vec<u8>, max: usize) -> Result<Vec<u8>> {
    let prefix = length_prefix(body.len(), max)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<([u8; 4], Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(ClusterError::FrameTooLarge { len, max });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((prefix, payload)))
}

/// A stream that has completed the HELLO exchange
pub struct FramedStream<S> {
    stream: S,
    codec: FrameCodec,
    max_frame: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Dialing side: send HELLO, adopt the listener's answer
    pub async fn connect(mut stream: S, config: &WireConfig) -> Result<Self> {
        let key = config.cluster_key()?;
        let ours = config.hello();
        write_hello(&mut stream, &ours).await?;
        let theirs = read_hello(&mut stream, config.max_frame).await?;
        if theirs.version != PROTOCOL_VERSION {
            return Err(ClusterError::Handshake(format!(
                "peer speaks version {}, expected {PROTOCOL_VERSION}",
                theirs.version
            )));
        }
        if theirs.encrypt != ours.encrypt {
            return Err(ClusterError::Handshake("encryption settings differ".into()));
        }
        let compress = ours.compress && theirs.compress;
        let codec = FrameCodec::new(
            compress,
            config.compression_level,
            config.max_frame,
            key.as_ref(),
        )?;
        Ok(Self {
            stream,
            codec,
            max_frame: config.max_frame,
        })
    }

    /// Listening side: read HELLO, answer with the agreed settings
    pub async fn accept(mut stream: S, config: &WireConfig) -> Result<Self> {
        let key = config.cluster_key()?;
        let theirs = read_hello(&mut stream, config.max_frame).await?;
        if theirs.version != PROTOCOL_VERSION {
            return Err(ClusterError::Handshake(format!(
                "peer speaks version {}, expected {PROTOCOL_VERSION}",
                theirs.version
            )));
        }
        let ours = config.hello();
        if theirs.encrypt != ours.encrypt {
            // Answer anyway so the dialer fails with the same reason.
            write_hello(&mut stream, &ours).await?;
            return Err(ClusterError::Handshake("encryption settings differ".into()));
        }
        let compress = ours.compress && theirs.compress;
        write_hello(
            &mut stream,
            &Hello {
                compress,
                ..ours
            },
        )
        .await?;
        let codec = FrameCodec::new(
            compress,
            config.compression_level,
            config.max_frame,
            key.as_ref(),
        )?;
        Ok(Self {
            stream,
            codec,
            max_frame: config.max_frame,
        })
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let bytes = self.codec.encode(msg)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next message; `Closed` once the peer hangs up
    pub async fn recv(&mut self) -> Result<Message> {
        match read_frame(&mut self.stream, self.max_frame).await? {
            Some((prefix, payload)) => self.codec.decode(prefix, payload),
            None => Err(ClusterError::Closed),
        }
    }
}

async fn write_hello<S: AsyncWrite + Unpin>(stream: &mut S, hello: &Hello) -> Result<()> {
    let bytes = frame(bincode::serialize(hello)?, MAX_FRAME)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_hello<S: AsyncRead + Unpin>(stream: &mut S, max: usize) -> Result<Hello> {
    match read_frame(stream, max).await? {
        Some((_, payload)) => Ok(bincode::deserialize(&payload)?),
        None => Err(ClusterError::Handshake("peer closed before HELLO".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_core::NodeId;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn probe() -> Message {
        Message::Probe {
            src: NodeId(7),
            seq: 42,
            updates: Vec::new(),
        }
    }

    fn split(frame: Vec<u8>) -> ([u8; 4], Vec<u8>) {
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&frame[..4]);
        assert_eq!(u32::from_be_bytes(prefix) as usize, frame.len() - 4);
        (prefix, frame[4..].to_vec())
    }

    fn sealed_pair() -> (FrameCodec, FrameCodec) {
        let key = ClusterKey::from_hex(KEY).unwrap();
        (
            FrameCodec::new(true, 3, MAX_FRAME, Some(&key)).unwrap(),
            FrameCodec::new(true, 3, MAX_FRAME, Some(&key)).unwrap(),
        )
    }

    #[test]
    fn test_plain_frame() {
        let mut codec = FrameCodec::plain();
        let (prefix, payload) = split(codec.encode(&probe()).unwrap());
        assert_eq!(codec.decode(prefix, payload).unwrap(), probe());
    }

    #[test]
    fn test_sealed_compressed_frame() {
        let (mut tx, mut rx) = sealed_pair();
        for _ in 0..3 {
            let (prefix, payload) = split(tx.encode(&probe()).unwrap());
            assert_eq!(rx.decode(prefix, payload).unwrap(), probe());
        }
    }

    #[test]
    fn test_tampering_is_detected() {
        let (mut tx, mut rx) = sealed_pair();
        let (prefix, mut payload) = split(tx.encode(&probe()).unwrap());
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        assert!(matches!(rx.decode(prefix, payload), Err(ClusterError::Decrypt)));
    }

    #[test]
    fn test_length_is_authenticated() {
        let (mut tx, mut rx) = sealed_pair();
        let (prefix, payload) = split(tx.encode(&probe()).unwrap());
        let forged = (u32::from_be_bytes(prefix) + 1).to_be_bytes();
        assert!(matches!(rx.decode(forged, payload), Err(ClusterError::Decrypt)));
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut tx, mut rx) = sealed_pair();
        let (prefix, payload) = split(tx.encode(&probe()).unwrap());
        rx.decode(prefix, payload.clone()).unwrap();
        assert!(matches!(rx.decode(prefix, payload), Err(ClusterError::Decrypt)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let other = ClusterKey::new([9u8; 32]);
        let key = ClusterKey::from_hex(KEY).unwrap();
        let mut tx = FrameCodec::new(false, 3, MAX_FRAME, Some(&key)).unwrap();
        let mut rx = FrameCodec::new(false, 3, MAX_FRAME, Some(&other)).unwrap();
        let (prefix, payload) = split(tx.encode(&probe()).unwrap());
        assert!(rx.decode(prefix, payload).is_err());
    }

    #[test]
    fn test_frame_limit() {
        let mut codec = FrameCodec::new(false, 3, 8, None).unwrap();
        let err = codec.encode(&probe()).unwrap_err();
        assert!(matches!(err, ClusterError::FrameTooLarge { max: 8, .. }));
    }

    #[test]
    fn test_key_parsing() {
        assert!(ClusterKey::from_hex(KEY).is_ok());
        assert!(matches!(
            ClusterKey::from_hex("abcd"),
            Err(ClusterError::InvalidKey(_))
        ));
        assert!(ClusterKey::from_hex("zz").is_err());
        assert_eq!(format!("{:?}", ClusterKey::new([1; 32])), "ClusterKey(..)");
    }

    #[tokio::test]
    async fn test_handshake_negotiates_compression() {
        let (a, b) = tokio::io::duplex(4096);
        let dialer = WireConfig {
            compress: true,
            key: Some(KEY.into()),
            ..WireConfig::default()
        };
        let listener = WireConfig {
            compress: false,
            key: Some(KEY.into()),
            ..WireConfig::default()
        };
        let server = tokio::spawn(async move {
            let mut conn = FramedStream::accept(b, &listener).await.unwrap();
            let msg = conn.recv().await.unwrap();
            conn.send(&msg).await.unwrap();
            conn.codec().is_compressed()
        });
        let mut conn = FramedStream::connect(a, &dialer).await.unwrap();
        assert!(conn.codec().is_encrypted());
        assert!(!conn.codec().is_compressed());
        conn.send(&probe()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), probe());
        assert!(!server.await.unwrap());
    }

    #[tokio::test]
    async fn test_handshake_rejects_encryption_mismatch() {
        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            FramedStream::accept(b, &WireConfig::default()).await.is_err()
        });
        let dialer = WireConfig {
            key: Some(KEY.into()),
            ..WireConfig::default()
        };
        let err = FramedStream::connect(a, &dialer).await.err().unwrap();
        assert!(matches!(err, ClusterError::Handshake(_)));
        assert!(server.await.unwrap());
    }
}
