// Peer-channel message types for the cowrite-sync.v1 protocol.
//
// Frames are JSON with a `type` tag. Document content only ever travels
// inside `ops` frames as base64-encoded binary operations; awareness
// frames are ephemeral and never enter the operation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Frontier, PeerId, PeerIdentity, PresenceState, RoomId};

pub const CURRENT_PROTOCOL_VERSION: &str = "cowrite-sync.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["cowrite-sync.v1"];

/// Causal frontier for one named document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocFrontier {
    pub doc: String,
    pub frontier: Frontier,
}

/// All message types in the cowrite-sync.v1 peer protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Dialer -> acceptor: channel handshake. A version or room mismatch
    /// is answered with `Error` and a close, never a partial merge.
    Hello {
        protocol_version: String,
        room_id: RoomId,
        peer_id: PeerId,
        identity: PeerIdentity,
        sent_at: DateTime<Utc>,
    },

    /// Acceptor -> dialer: handshake acknowledgement.
    HelloAck {
        protocol_version: String,
        peer_id: PeerId,
        identity: PeerIdentity,
        sent_at: DateTime<Utc>,
    },

    /// Bidirectional: per-document causal frontiers, sent right after the
    /// handshake so each side replays only what the other is missing. An
    /// empty frontier for a document requests full replay.
    StateSummary { docs: Vec<DocFrontier> },

    /// Bidirectional: a batch of encoded operations for one document.
    /// Live fan-out and reconnection catch-up use the same frame.
    Ops { doc: String, ops_b64: Vec<String> },

    /// Bidirectional: ephemeral presence. `state: None` clears the entry
    /// (clean leave); stale clocks are ignored by the receiver.
    Awareness {
        peer_id: PeerId,
        clock: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<PresenceState>,
    },

    /// Bidirectional: divergence hardening probe over the visible text.
    DigestProbe { doc: String, digest_hex: String },

    /// Best-effort clean-leave notification.
    Leave { peer_id: PeerId },

    /// Protocol-level failure; the sender closes the channel after this.
    Error { code: String, message: String },
}

impl PeerMessage {
    /// Serialize for a JSON text channel.
    pub fn encode_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a frame received from a JSON text channel.
    pub fn parse_frame(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
