// Operations: causally-stamped edits and their versioned binary codec.
//
// An operation is immutable once created; history is append-only and a
// deletion tombstones its targets instead of removing them. The binary
// layout leads with a format version byte so a peer speaking a different
// protocol revision rejects the payload instead of merging garbage.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::types::{OpId, OpSpan, PeerId};

/// Binary format version; bump on any layout change.
pub const OP_FORMAT_VERSION: u8 = 1;

/// Maximum UTF-8 byte length for a peer id in the compact encoding.
pub const MAX_PEER_ID_LEN: usize = u8::MAX as usize;

/// Maximum UTF-8 byte length for insert content in one operation.
pub const MAX_CONTENT_LEN: usize = 256 * 1024;

/// Maximum delete spans in one operation.
pub const MAX_DELETE_SPANS: usize = u16::MAX as usize;

const KIND_INSERT: u8 = 0;
const KIND_DELETE: u8 = 1;

/// A single causally-stamped edit.
///
/// Inserts anchor to the marker on their left at creation time (`None`
/// anchors at the document start); the characters occupy the counters
/// `id.counter ..= id.counter + chars - 1` in the origin peer's sequence.
/// Deletes consume one counter and name their targets as spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert {
        id: OpId,
        left: Option<OpId>,
        content: String,
    },
    Delete {
        id: OpId,
        targets: Vec<OpSpan>,
    },
}

impl Operation {
    pub fn id(&self) -> &OpId {
        match self {
            Self::Insert { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.id().peer
    }

    /// Highest counter this operation occupies in its peer's sequence.
    pub fn last_counter(&self) -> u64 {
        match self {
            Self::Insert { id, content, .. } => {
                id.counter + (content.chars().count() as u64).saturating_sub(1)
            }
            Self::Delete { id, .. } => id.counter,
        }
    }

    /// Compact binary encoding for transport.
    ///
    /// Layout:
    /// - byte 0: format version
    /// - byte 1: kind (0 = insert, 1 = delete)
    /// - insert: id, anchor flag + anchor id, u32 content length, UTF-8 content
    /// - delete: id, u16 span count, then (peer, start, len) per span
    ///
    /// Ids are a length-prefixed UTF-8 peer id followed by a little-endian
    /// u64 counter; all fixed-width integers are little-endian.
    pub fn encode(&self) -> Result<Vec<u8>, OpCodecError> {
        let mut buf = Vec::with_capacity(32);
        buf.push(OP_FORMAT_VERSION);
        match self {
            Self::Insert { id, left, content } => {
                if content.is_empty() {
                    return Err(OpCodecError::EmptyContent);
                }
                if content.len() > MAX_CONTENT_LEN {
                    return Err(OpCodecError::ContentTooLong {
                        len: content.len(),
                        max: MAX_CONTENT_LEN,
                    });
                }
                buf.push(KIND_INSERT);
                put_op_id(&mut buf, id)?;
                match left {
                    Some(anchor) => {
                        buf.push(1);
                        put_op_id(&mut buf, anchor)?;
                    }
                    None => buf.push(0),
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(content.as_bytes());
            }
            Self::Delete { id, targets } => {
                if targets.is_empty() {
                    return Err(OpCodecError::EmptyTargets);
                }
                if targets.len() > MAX_DELETE_SPANS {
                    return Err(OpCodecError::TooManyTargets(targets.len()));
                }
                buf.push(KIND_DELETE);
                put_op_id(&mut buf, id)?;
                buf.extend_from_slice(&(targets.len() as u16).to_le_bytes());
                for span in targets {
                    if span.len == 0 {
                        return Err(OpCodecError::ZeroLengthSpan);
                    }
                    put_peer(&mut buf, &span.peer)?;
                    buf.extend_from_slice(&span.start.to_le_bytes());
                    buf.extend_from_slice(&span.len.to_le_bytes());
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OpCodecError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u8()?;
        if version != OP_FORMAT_VERSION {
            return Err(OpCodecError::UnsupportedVersion(version));
        }
        let op = match reader.u8()? {
            KIND_INSERT => {
                let id = reader.op_id()?;
                let left = match reader.u8()? {
                    0 => None,
                    _ => Some(reader.op_id()?),
                };
                let content_len = reader.u32()? as usize;
                if content_len == 0 {
                    return Err(OpCodecError::EmptyContent);
                }
                if content_len > MAX_CONTENT_LEN {
                    return Err(OpCodecError::ContentTooLong {
                        len: content_len,
                        max: MAX_CONTENT_LEN,
                    });
                }
                let content = std::str::from_utf8(reader.take(content_len)?)
                    .map_err(|_| OpCodecError::InvalidUtf8Content)?
                    .to_string();
                Self::Insert { id, left, content }
            }
            KIND_DELETE => {
                let id = reader.op_id()?;
                let span_count = reader.u16()? as usize;
                if span_count == 0 {
                    return Err(OpCodecError::EmptyTargets);
                }
                let mut targets = Vec::with_capacity(span_count);
                for _ in 0..span_count {
                    let peer = reader.peer()?;
                    let start = reader.u64()?;
                    let len = reader.u64()?;
                    if len == 0 {
                        return Err(OpCodecError::ZeroLengthSpan);
                    }
                    targets.push(OpSpan { peer, start, len });
                }
                Self::Delete { id, targets }
            }
            other => return Err(OpCodecError::UnknownKind(other)),
        };
        reader.finish()?;
        Ok(op)
    }

    /// Encode to base64 for embedding in JSON frames.
    pub fn encode_b64(&self) -> Result<String, OpCodecError> {
        Ok(BASE64.encode(self.encode()?))
    }

    pub fn decode_b64(encoded: &str) -> Result<Self, OpCodecError> {
        let bytes = BASE64.decode(encoded).map_err(|_| OpCodecError::InvalidBase64)?;
        Self::decode(&bytes)
    }
}

fn put_peer(buf: &mut Vec<u8>, peer: &PeerId) -> Result<(), OpCodecError> {
    let bytes = peer.as_str().as_bytes();
    if bytes.len() > MAX_PEER_ID_LEN {
        return Err(OpCodecError::PeerIdTooLong { len: bytes.len(), max: MAX_PEER_ID_LEN });
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_op_id(buf: &mut Vec<u8>, id: &OpId) -> Result<(), OpCodecError> {
    put_peer(buf, &id.peer)?;
    buf.extend_from_slice(&id.counter.to_le_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OpCodecError> {
        let end = self.pos.saturating_add(n);
        if end > self.bytes.len() {
            return Err(OpCodecError::Truncated { needed: end, actual: self.bytes.len() });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, OpCodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, OpCodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("slice has fixed width")))
    }

    fn u32(&mut self) -> Result<u32, OpCodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("slice has fixed width")))
    }

    fn u64(&mut self) -> Result<u64, OpCodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("slice has fixed width")))
    }

    fn peer(&mut self) -> Result<PeerId, OpCodecError> {
        let len = self.u8()? as usize;
        let raw = std::str::from_utf8(self.take(len)?)
            .map_err(|_| OpCodecError::InvalidUtf8PeerId)?;
        Ok(PeerId::new(raw))
    }

    fn op_id(&mut self) -> Result<OpId, OpCodecError> {
        let peer = self.peer()?;
        let counter = self.u64()?;
        Ok(OpId::new(peer, counter))
    }

    fn finish(&self) -> Result<(), OpCodecError> {
        if self.pos != self.bytes.len() {
            return Err(OpCodecError::LengthMismatch {
                expected: self.pos,
                actual: self.bytes.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpCodecError {
    #[error("unsupported operation format version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown operation kind marker: {0}")]
    UnknownKind(u8),
    #[error("operation payload truncated: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("operation payload length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("peer id exceeds maximum length ({max} bytes), got {len}")]
    PeerIdTooLong { len: usize, max: usize },
    #[error("peer id is not valid UTF-8")]
    InvalidUtf8PeerId,
    #[error("insert content is not valid UTF-8")]
    InvalidUtf8Content,
    #[error("insert content exceeds maximum length ({max} bytes), got {len}")]
    ContentTooLong { len: usize, max: usize },
    #[error("insert operation carries no content")]
    EmptyContent,
    #[error("delete operation names no targets")]
    EmptyTargets,
    #[error("delete span has zero length")]
    ZeroLengthSpan,
    #[error("too many delete spans: {0}")]
    TooManyTargets(usize),
    #[error("operation payload is not valid base64")]
    InvalidBase64,
}
