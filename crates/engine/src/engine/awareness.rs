// Ephemeral presence: last-write-wins per peer, throttled broadcast,
// and liveness expiry.
//
// Deliberately separate from the operation history. Losing or
// duplicating a presence frame costs at most a stale cursor indicator,
// never document state, so this channel trades delivery guarantees for
// silence on the hot edit path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cowrite_common::types::{PeerId, PresenceState};

/// A remote peer's presence entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub state: PresenceState,
    pub clock: u64,
    last_seen: Instant,
}

/// One room's presence map plus the local publish throttle.
#[derive(Debug)]
pub struct AwarenessChannel {
    local_peer: PeerId,
    throttle: Duration,
    liveness_timeout: Duration,
    clock: u64,
    last_broadcast_at: Option<Instant>,
    /// Latest local state held back by the throttle window.
    deferred: Option<PresenceState>,
    peers: HashMap<PeerId, PeerPresence>,
}

impl AwarenessChannel {
    pub fn new(local_peer: PeerId, throttle: Duration, liveness_timeout: Duration) -> Self {
        Self {
            local_peer,
            throttle,
            liveness_timeout,
            clock: 0,
            last_broadcast_at: None,
            deferred: None,
            peers: HashMap::new(),
        }
    }

    /// Queue the local state for broadcast. Returns the stamped state to
    /// send now, or `None` while the throttle window is open; a burst of
    /// updates coalesces into the latest state, released by `flush`.
    pub fn publish(&mut self, state: PresenceState, now: Instant) -> Option<(u64, PresenceState)> {
        if let Some(last) = self.last_broadcast_at {
            if now.saturating_duration_since(last) < self.throttle {
                self.deferred = Some(state);
                return None;
            }
        }
        Some(self.stamp(state, now))
    }

    /// Release a coalesced state once the throttle window has elapsed.
    pub fn flush(&mut self, now: Instant) -> Option<(u64, PresenceState)> {
        if let Some(last) = self.last_broadcast_at {
            if now.saturating_duration_since(last) < self.throttle {
                return None;
            }
        }
        let state = self.deferred.take()?;
        Some(self.stamp(state, now))
    }

    fn stamp(&mut self, state: PresenceState, now: Instant) -> (u64, PresenceState) {
        self.clock += 1;
        self.last_broadcast_at = Some(now);
        self.deferred = None;
        (self.clock, state)
    }

    /// Merge a remote presence frame. Stale clocks are ignored; a `None`
    /// state clears the entry (clean leave). Returns `true` when the
    /// visible presence changed.
    pub fn apply_remote(
        &mut self,
        peer: &PeerId,
        clock: u64,
        state: Option<PresenceState>,
        now: Instant,
    ) -> bool {
        if *peer == self.local_peer {
            return false; // our own frame echoed back
        }
        match state {
            Some(state) => match self.peers.get_mut(peer) {
                Some(existing) => {
                    // Even a stale frame proves the peer is alive.
                    existing.last_seen = now;
                    if clock <= existing.clock {
                        return false;
                    }
                    existing.clock = clock;
                    existing.state = state;
                    true
                }
                None => {
                    self.peers.insert(peer.clone(), PeerPresence { state, clock, last_seen: now });
                    true
                }
            },
            None => self.peers.remove(peer).is_some(),
        }
    }

    /// Record channel traffic from a peer; any frame counts as liveness.
    pub fn observe_traffic(&mut self, peer: &PeerId, now: Instant) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.last_seen = now;
        }
    }

    /// Drop the entry for a peer that left cleanly.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Expire peers silent past the liveness timeout. This is the only
    /// cleanup path for a peer that vanished without a leave (network
    /// loss, crash, closed tab).
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let mut expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.last_seen) >= self.liveness_timeout
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        expired.sort();
        for peer in &expired {
            self.peers.remove(peer);
        }
        expired
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerPresence> {
        self.peers.get(peer)
    }

    /// Current remote presence entries, sorted by peer id.
    pub fn peers(&self) -> Vec<(&PeerId, &PeerPresence)> {
        let mut entries: Vec<_> = self.peers.iter().collect();
        entries.sort_by_key(|(peer, _)| *peer);
        entries
    }
}
