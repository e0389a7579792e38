//! # Wire Format
//!
//! Each message travels on its own libp2p substream as one frame: a 4-byte
//! big-endian length followed by that many bytes of a JSON-encoded
//! [`Message`]. The remote answers on the same substream with one frame
//! holding its acknowledgement.
//!
//! ```text
//! +----------------+-------------------------------------------------+
//! | len: u32 (BE)  | {"type":..,"payload":..,"from":..,"timestamp":..} |
//! +----------------+-------------------------------------------------+
//! ```
//!
//! [`read_frame`] and [`write_frame`] implement the framing over any
//! `futures` byte stream. Frames above [`MAX_FRAME_LENGTH`] are refused in
//! both directions.

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};

use crate::config::{
    MAX_FRAME_LENGTH, PROTOCOL_BLOCK, PROTOCOL_CONSENSUS, PROTOCOL_DISCOVERY, PROTOCOL_STATE_SYNC,
    PROTOCOL_TRANSACTION,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Framing and format errors. They fail the affected substream only.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("stream closed by remote")]
    Closed,

    #[error("stream I/O: {0}")]
    Io(#[from] io::Error),
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => e,
            WireError::Closed => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// A protocol id that does not have the `/<name>/.../<major>.<minor>.<patch>`
/// shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid protocol id {0:?}: expected /<name>/<major>.<minor>.<patch>")]
pub struct InvalidProtocolId(pub String);

// ---------------------------------------------------------------------------
// ProtocolId
// ---------------------------------------------------------------------------

/// Versioned, path-like protocol identifier such as `/aporia-zero/tx/1.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn parse(s: &str) -> Result<Self, InvalidProtocolId> {
        let invalid = || InvalidProtocolId(s.to_string());

        let rest = s.strip_prefix('/').ok_or_else(invalid)?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() < 2 || segments.iter().any(|seg| seg.is_empty()) {
            return Err(invalid());
        }

        let version = segments[segments.len() - 1];
        let parts: Vec<&str> = version.split('.').collect();
        let numeric = |p: &&str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
        if parts.len() != 3 || !parts.iter().all(numeric) {
            return Err(invalid());
        }

        Ok(Self(s.to_string()))
    }

    /// Wrap a compile-time constant id without validation. Only for the
    /// built-in ids in [`crate::config`].
    pub(crate) fn from_static(s: &'static str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing `major.minor.patch` segment.
    pub fn version(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProtocolId {
    type Err = InvalidProtocolId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProtocolId {
    type Error = InvalidProtocolId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ProtocolId> for String {
    fn from(id: ProtocolId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Well-known message kinds, each bound to its own protocol id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Transaction,
    Block,
    PeerDiscovery,
    StateSync,
    Consensus,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        Self::Transaction,
        Self::Block,
        Self::PeerDiscovery,
        Self::StateSync,
        Self::Consensus,
    ];

    pub fn protocol_str(self) -> &'static str {
        match self {
            Self::Transaction => PROTOCOL_TRANSACTION,
            Self::Block => PROTOCOL_BLOCK,
            Self::PeerDiscovery => PROTOCOL_DISCOVERY,
            Self::StateSync => PROTOCOL_STATE_SYNC,
            Self::Consensus => PROTOCOL_CONSENSUS,
        }
    }

    pub fn protocol_id(self) -> ProtocolId {
        ProtocolId::from_static(self.protocol_str())
    }

    pub fn from_protocol(id: &ProtocolId) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.protocol_str() == id.as_str())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction => write!(f, "Transaction"),
            Self::Block => write!(f, "Block"),
            Self::PeerDiscovery => write!(f, "PeerDiscovery"),
            Self::StateSync => write!(f, "StateSync"),
            Self::Consensus => write!(f, "Consensus"),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The unit exchanged between peers.
///
/// `protocol` doubles as the type tag: it names the handler the message is
/// dispatched to and the ordered lane it travels on. The sender fills in
/// `from`, and the receiving transport overwrites it with the peer id the
/// connection authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub protocol: ProtocolId,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub from: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self::with_protocol(kind.protocol_id(), payload)
    }

    pub fn with_protocol(protocol: ProtocolId, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            payload,
            from: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_protocol(&self.protocol)
    }

    /// Serialize the message body. Fails if the result would not fit in a
    /// frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_LENGTH {
            return Err(WireError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_LENGTH,
            });
        }
        Ok(Bytes::from(bytes))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Read one length-prefixed frame. A stream that ends before the length
/// prefix is [`WireError::Closed`].
pub async fn read_frame<R>(io: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    io.read_exact(&mut prefix).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => WireError::Closed,
        _ => WireError::Io(e),
    })?;

    let size = u32::from_be_bytes(prefix) as usize;
    if size > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge {
            size,
            max: MAX_FRAME_LENGTH,
        });
    }
    let mut body = vec![0u8; size];
    io.read_exact(&mut body).await?;
    Ok(body)
}

/// Write `body` as one length-prefixed frame and flush.
pub async fn write_frame<W>(io: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LENGTH,
        });
    }
    io.write_all(&(body.len() as u32).to_be_bytes()).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}
