// Core domain types shared across the Cowrite crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque collaboration namespace identifier.
///
/// Any two processes presenting the same room id through the same signaling
/// path are in the same room. The id carries no authorization semantics;
/// restricting who learns it is the embedding application's concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random room id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier for one editing peer.
///
/// `Ord` is lexicographic byte order. Concurrent inserts at the same logical
/// position are ranked by `(peer, counter)`, so this ordering is part of the
/// merge contract, not a convenience.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random peer id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display identity shown to collaborators (name badge and cursor color).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIdentity {
    pub display_name: String,
    /// Hex color like "#e06c75".
    pub color: String,
}

/// Causal stamp on an operation: origin peer plus that peer's counter.
///
/// Counters start at 1 and increase monotonically per peer per document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId {
    pub peer: PeerId,
    pub counter: u64,
}

impl OpId {
    pub fn new(peer: PeerId, counter: u64) -> Self {
        Self { peer, counter }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.counter)
    }
}

/// A contiguous run of marker counters minted by one peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpSpan {
    pub peer: PeerId,
    pub start: u64,
    pub len: u64,
}

/// Per-peer "received up to counter N" watermarks for one document.
///
/// Exchanged on connect so each side replays only the gap, and used to gate
/// tombstone pruning. An empty frontier covers nothing and requests full
/// replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Frontier(BTreeMap<PeerId, u64>);

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter received from `peer`, 0 when none.
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// Raise the watermark for `peer`; never lowers it.
    pub fn advance(&mut self, peer: &PeerId, counter: u64) {
        if counter == 0 {
            return;
        }
        let entry = self.0.entry(peer.clone()).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    pub fn covers(&self, id: &OpId) -> bool {
        id.counter <= self.get(&id.peer)
    }

    /// Element-wise minimum: the coverage every party in `self` and `other`
    /// agrees on.
    pub fn meet(&self, other: &Frontier) -> Frontier {
        let mut out = BTreeMap::new();
        for (peer, counter) in &self.0 {
            let bound = other.get(peer).min(*counter);
            if bound > 0 {
                out.insert(peer.clone(), bound);
            }
        }
        Frontier(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, u64)> {
        self.0.iter().map(|(peer, counter)| (peer, *counter))
    }
}

/// Cursor or selection locator in absolute character offsets. A collapsed
/// cursor has `anchor == head`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorLocator {
    pub anchor: u32,
    pub head: u32,
}

/// Ephemeral presence record for one peer. Last-write-wins per peer and
/// never part of the document history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceState {
    pub identity: PeerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorLocator>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_order_lexicographically() {
        let a = PeerId::new("alice");
        let b = PeerId::new("bob");
        assert!(a < b);
        assert!(OpId::new(a.clone(), 9) < OpId::new(b, 1));
        assert!(OpId::new(a.clone(), 1) < OpId::new(a, 2));
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(RoomId::random(), RoomId::random());
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn frontier_advance_is_monotonic() {
        let peer = PeerId::new("alice");
        let mut frontier = Frontier::new();
        assert_eq!(frontier.get(&peer), 0);

        frontier.advance(&peer, 5);
        frontier.advance(&peer, 3);
        assert_eq!(frontier.get(&peer), 5);

        assert!(frontier.covers(&OpId::new(peer.clone(), 5)));
        assert!(!frontier.covers(&OpId::new(peer, 6)));
    }

    #[test]
    fn frontier_ignores_zero_counters() {
        let peer = PeerId::new("alice");
        let mut frontier = Frontier::new();
        frontier.advance(&peer, 0);
        assert!(frontier.is_empty());
    }

    #[test]
    fn frontier_meet_takes_elementwise_minimum() {
        let alice = PeerId::new("alice");
        let bob = PeerId::new("bob");

        let mut left = Frontier::new();
        left.advance(&alice, 10);
        left.advance(&bob, 4);

        let mut right = Frontier::new();
        right.advance(&alice, 7);

        let meet = left.meet(&right);
        assert_eq!(meet.get(&alice), 7);
        assert_eq!(meet.get(&bob), 0);
    }

    #[test]
    fn frontier_serializes_as_plain_map() {
        let mut frontier = Frontier::new();
        frontier.advance(&PeerId::new("alice"), 3);
        let json = serde_json::to_value(&frontier).expect("serialize frontier");
        assert_eq!(json, serde_json::json!({ "alice": 3 }));
    }

    #[test]
    fn op_id_display_is_peer_and_counter() {
        let id = OpId::new(PeerId::new("alice"), 12);
        assert_eq!(id.to_string(), "alice:12");
    }
}
