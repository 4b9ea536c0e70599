// Per-document replica registry and the append-only update log.
//
// Owns one replica per document name (created lazily on first
// reference), the operation log used for reconnection catch-up, and
// per-peer receive cursors so redelivery costs the gap, never the full
// history. Malformed payloads are rejected before this layer; nothing
// here can corrupt a replica.

use std::collections::{BTreeSet, HashMap};

use sha2::{Digest, Sha256};
use tracing::debug;

use cowrite_common::op::Operation;
use cowrite_common::types::{Frontier, PeerId};

use crate::engine::replica::{DocumentReplica, EditEvent, MutationDelta};

/// Tracks which counters from one peer have been received.
///
/// `watermark` is the highest contiguous counter; counters that arrive
/// ahead of a gap wait in `ahead` until the gap fills. The advertised
/// frontier only ever exposes the contiguous watermark, so a peer with
/// gaps re-requests conservatively rather than skipping history.
#[derive(Debug, Default)]
struct PeerCursor {
    watermark: u64,
    ahead: BTreeSet<u64>,
}

impl PeerCursor {
    /// Record the counters `start..=end`. Returns `false` when every one
    /// of them was already seen.
    fn observe(&mut self, start: u64, end: u64) -> bool {
        let mut any_new = false;
        for counter in start..=end {
            if counter <= self.watermark || !self.ahead.insert(counter) {
                continue;
            }
            any_new = true;
        }
        while self.ahead.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
        any_new
    }
}

struct ManagedDoc {
    replica: DocumentReplica,
    /// Append-only history in arrival order.
    log: Vec<Operation>,
    cursors: HashMap<PeerId, PeerCursor>,
}

/// One room's documents: replicas, logs, and watermarks.
pub struct ReplicaStore {
    local_peer: PeerId,
    docs: HashMap<String, ManagedDoc>,
}

impl ReplicaStore {
    pub fn new(local_peer: PeerId) -> Self {
        Self { local_peer, docs: HashMap::new() }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Names of every document referenced so far, sorted.
    pub fn doc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_doc(&self, doc: &str) -> bool {
        self.docs.contains_key(doc)
    }

    /// Apply a local widget edit, producing the stamped operation to
    /// broadcast. `None` when the edit has no effect. Never blocks.
    pub fn apply_local(&mut self, doc: &str, edit: &EditEvent) -> Option<Operation> {
        let local_peer = self.local_peer.clone();
        let entry = self.doc_entry(doc);
        let op = entry.replica.apply_local(edit)?;
        entry
            .cursors
            .entry(local_peer)
            .or_default()
            .observe(op.id().counter, op.last_counter());
        entry.log.push(op.clone());
        Some(op)
    }

    /// Merge a remote operation. Redelivered operations are dropped
    /// before they reach the replica; merging is idempotent either way.
    /// Returns the visible changes for the editor binding.
    pub fn apply_remote(&mut self, doc: &str, op: &Operation) -> Vec<MutationDelta> {
        let entry = self.doc_entry(doc);
        let cursor = entry.cursors.entry(op.peer().clone()).or_default();
        if !cursor.observe(op.id().counter, op.last_counter()) {
            debug!(doc, op = %op.id(), "dropping redelivered operation");
            return Vec::new();
        }
        entry.log.push(op.clone());
        entry.replica.apply_remote(op)
    }

    /// Per-peer received watermarks for one document.
    pub fn frontier(&self, doc: &str) -> Frontier {
        let mut frontier = Frontier::new();
        if let Some(entry) = self.docs.get(doc) {
            for (peer, cursor) in &entry.cursors {
                frontier.advance(peer, cursor.watermark);
            }
        }
        frontier
    }

    /// Operations a peer at `remote` is missing: the gap, never the full
    /// history unless the frontier is empty.
    pub fn ops_since(&self, doc: &str, remote: &Frontier) -> Vec<Operation> {
        let Some(entry) = self.docs.get(doc) else {
            return Vec::new();
        };
        entry
            .log
            .iter()
            .filter(|op| op.last_counter() > remote.get(op.peer()))
            .cloned()
            .collect()
    }

    /// Operations held for one document.
    pub fn op_count(&self, doc: &str) -> usize {
        self.docs.get(doc).map(|entry| entry.log.len()).unwrap_or(0)
    }

    /// Markers held for one document, tombstones included.
    pub fn marker_count(&self, doc: &str) -> usize {
        self.docs.get(doc).map(|entry| entry.replica.marker_count()).unwrap_or(0)
    }

    /// Visible text of a document; empty if the document is unknown.
    pub fn text(&self, doc: &str) -> String {
        self.docs.get(doc).map(|entry| entry.replica.text()).unwrap_or_default()
    }

    /// Lowercase hex SHA-256 of the visible text, for divergence probes.
    pub fn digest_hex(&self, doc: &str) -> String {
        let digest = Sha256::digest(self.text(doc).as_bytes());
        hex_encode(&digest)
    }

    /// Seed a document that has no history yet with initial content.
    /// Returns the insert to broadcast, or `None` if the document already
    /// has state (another peer seeded it first, or edits arrived).
    pub fn seed(&mut self, doc: &str, text: &str) -> Option<Operation> {
        if text.is_empty() {
            return None;
        }
        if self.docs.get(doc).is_some_and(|entry| !entry.log.is_empty()) {
            return None;
        }
        self.apply_local(doc, &EditEvent::Insert { index: 0, text: text.to_string() })
    }

    /// Prune acknowledged tombstones in one document. `acked` must be
    /// the element-wise minimum frontier across every connected peer.
    /// The log is retained in full so a fresh peer can still be served a
    /// complete replay.
    pub fn compact(&mut self, doc: &str, acked: &Frontier) -> usize {
        match self.docs.get_mut(doc) {
            Some(entry) => entry.replica.compact(acked),
            None => 0,
        }
    }

    fn doc_entry(&mut self, doc: &str) -> &mut ManagedDoc {
        self.docs.entry(doc.to_string()).or_insert_with(|| ManagedDoc {
            replica: DocumentReplica::new(self.local_peer.clone()),
            log: Vec::new(),
            cursors: HashMap::new(),
        })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
