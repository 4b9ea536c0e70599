// Peer session manager: room lifecycle over direct peer channels.
//
// Owns discovery through the external signaling collaborator, the
// per-peer channel handshake, operation fan-out and catch-up, awareness
// propagation, and reconnection with capped backoff. Leaderless: every
// locally produced operation goes to every connected peer and no peer
// is authoritative.
//
// Transports are abstracted behind `Signaling`, `PeerConnector`, and
// `PeerChannel` for testability; concrete implementations live with the
// embedding application.

pub mod runtime;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;

use cowrite_common::op::Operation;
use cowrite_common::protocol::wire::{
    DocFrontier, PeerMessage, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use cowrite_common::types::{
    CursorLocator, Frontier, PeerId, PeerIdentity, PresenceState, RoomId,
};

use crate::config::SyncConfig;
use crate::engine::awareness::AwarenessChannel;
use crate::engine::doc_manager::ReplicaStore;
use crate::engine::replica::{EditEvent, MutationDelta};

// ── Signaling and transport traits ─────────────────────────────────

/// Connection-establishment metadata exchanged through signaling.
/// Carries no document content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOffer {
    pub peer_id: PeerId,
    /// Dialable endpoint for a direct channel, e.g. "mem://bob" in tests.
    pub endpoint: String,
}

/// The external rendezvous collaborator. If it becomes unreachable only
/// new discoveries stop; connected peers are unaffected.
pub trait Signaling {
    /// Announce the local offer to the room.
    fn announce(&mut self, room: &RoomId, offer: &ConnectionOffer) -> Result<()>;

    /// Next offer announced by another peer in the room, if any.
    fn poll(&mut self) -> Result<Option<ConnectionOffer>>;
}

/// Result of polling a peer channel.
#[derive(Debug)]
pub enum ChannelPoll {
    Empty,
    Frame(PeerMessage),
    Closed,
}

/// A direct, ordered, bidirectional channel to one peer.
pub trait PeerChannel: Send {
    fn send(&mut self, msg: &PeerMessage) -> Result<()>;
    /// Non-blocking receive.
    fn poll_recv(&mut self) -> ChannelPoll;
    fn close(&mut self);
}

/// Opens direct channels from offers and surfaces channels that remote
/// peers opened toward us.
pub trait PeerConnector {
    fn open(&mut self, offer: &ConnectionOffer) -> Result<Box<dyn PeerChannel>>;
    /// Next inbound channel, if a peer has dialed us.
    fn poll_accept(&mut self) -> Option<Box<dyn PeerChannel>>;
}

// ── Reconnection ───────────────────────────────────────────────────

/// Capped exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX, // retry indefinitely
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(7);
        saturating_mul(self.base_delay, 1u64 << exp).min(self.max_delay)
    }
}

fn saturating_mul(duration: Duration, rhs: u64) -> Duration {
    let nanos = duration.as_nanos().saturating_mul(rhs as u128);
    if nanos > u64::MAX as u128 {
        Duration::from_secs(u64::MAX)
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

// ── Room and peer state ────────────────────────────────────────────

/// Lifecycle of the local end of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Idle,
    Discovering,
    Connected,
    Closed,
}

/// Lifecycle of one remote peer's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionState {
    Connecting,
    Connected,
    Closed,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Discovery timed out without a peer. Solo editing is valid; the
    /// session keeps listening.
    NoPeersFound,
    PeerConnected { peer: PeerId, identity: PeerIdentity },
    /// A channel was lost. Document state is unaffected; edits keep
    /// applying locally and sync once reconnected.
    PeerDisconnected { peer: PeerId, reason: String, will_retry: bool },
    /// A peer announced a clean leave.
    PeerLeft { peer: PeerId },
    /// Remote operations merged into a document.
    RemoteEdit { doc: String, deltas: Vec<MutationDelta> },
    AwarenessChanged { peer: PeerId, state: Option<PresenceState> },
    /// A silent peer's presence expired.
    AwarenessExpired { peer: PeerId },
    /// A digest probe disagreed; a full resync has been requested.
    DivergenceDetected { doc: String, peer: PeerId },
    ProtocolError { peer: PeerId, code: String, message: String },
}

/// Book-keeping for one remote peer.
struct PeerSession {
    state: PeerSessionState,
    identity: Option<PeerIdentity>,
    channel: Option<Box<dyn PeerChannel>>,
    /// Offer used to dial this peer; `None` for inbound sessions, whose
    /// remote side redials on loss.
    dial_offer: Option<ConnectionOffer>,
    last_seen: Instant,
    /// Their acknowledged frontier per document, from state summaries.
    acked: HashMap<String, Frontier>,
    consecutive_failures: u32,
    next_reconnect_at: Option<Instant>,
}

impl PeerSession {
    fn dialing(offer: ConnectionOffer, now: Instant) -> Self {
        Self {
            state: PeerSessionState::Closed,
            identity: None,
            channel: None,
            dial_offer: Some(offer),
            last_seen: now,
            acked: HashMap::new(),
            consecutive_failures: 0,
            next_reconnect_at: Some(now),
        }
    }
}

// ── Room session ───────────────────────────────────────────────────

/// The explicit handle for one joined room. Coordination is message
/// passing through `pump`; nothing on the edit path blocks on the
/// network, and all merges for a document are serialized through the
/// store owned here.
pub struct RoomSession<S: Signaling, C: PeerConnector> {
    room_id: RoomId,
    identity: PeerIdentity,
    local_offer: ConnectionOffer,
    config: SyncConfig,
    reconnect: ReconnectPolicy,
    signaling: S,
    connector: C,
    store: ReplicaStore,
    awareness: AwarenessChannel,
    peers: HashMap<PeerId, PeerSession>,
    /// Inbound channels waiting for their hello.
    inbound: Vec<Box<dyn PeerChannel>>,
    state: RoomState,
    discovery_deadline: Option<Instant>,
    solo_reported: bool,
    last_probe_at: Option<Instant>,
    pending_events: Vec<RoomEvent>,
}

impl<S: Signaling, C: PeerConnector> RoomSession<S, C> {
    pub fn new(
        room_id: RoomId,
        local_peer: PeerId,
        identity: PeerIdentity,
        endpoint: impl Into<String>,
        signaling: S,
        connector: C,
        config: SyncConfig,
    ) -> Self {
        let local_offer = ConnectionOffer { peer_id: local_peer.clone(), endpoint: endpoint.into() };
        let awareness = AwarenessChannel::new(
            local_peer.clone(),
            config.awareness_throttle(),
            config.awareness_timeout(),
        );
        let reconnect = config.reconnect_policy();
        Self {
            room_id,
            identity,
            local_offer,
            config,
            reconnect,
            signaling,
            connector,
            store: ReplicaStore::new(local_peer),
            awareness,
            peers: HashMap::new(),
            inbound: Vec::new(),
            state: RoomState::Idle,
            discovery_deadline: None,
            solo_reported: false,
            last_probe_at: None,
            pending_events: Vec::new(),
        }
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn local_peer(&self) -> &PeerId {
        self.store.local_peer()
    }

    /// Read access to replicated documents for the embedding application.
    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    /// Read access to the presence map for rendering collaborator lists.
    pub fn awareness(&self) -> &AwarenessChannel {
        &self.awareness
    }

    /// Peers with an open, handshaken channel, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, session)| session.state == PeerSessionState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Announce presence and start discovering peers. A room with no
    /// peers is valid: after the discovery timeout, `pump` reports
    /// `NoPeersFound` once and keeps listening.
    pub fn join(&mut self, now: Instant) -> Result<()> {
        if self.state != RoomState::Idle {
            return Ok(());
        }
        self.signaling.announce(&self.room_id, &self.local_offer)?;
        self.state = RoomState::Discovering;
        self.discovery_deadline = Some(now + self.config.discovery_timeout());
        info!(room = %self.room_id, peer = %self.local_offer.peer_id, "joined room, discovering peers");
        Ok(())
    }

    /// Apply a local widget edit and fan the operation out to every
    /// connected peer. Synchronous: typing latency never waits on the
    /// network.
    pub fn local_edit(&mut self, doc: &str, edit: &EditEvent, now: Instant) {
        let Some(op) = self.store.apply_local(doc, edit) else {
            return;
        };
        self.broadcast_ops(doc, &[op], now);
    }

    /// Seed a locally created document with initial content.
    pub fn seed_document(&mut self, doc: &str, text: &str, now: Instant) {
        let Some(op) = self.store.seed(doc, text) else {
            return;
        };
        self.broadcast_ops(doc, &[op], now);
    }

    /// Broadcast local presence. Bursts inside the throttle window
    /// coalesce into the next `pump`.
    pub fn publish_awareness(&mut self, cursor: Option<CursorLocator>, now: Instant) {
        let state = PresenceState { identity: self.identity.clone(), cursor, updated_at: Utc::now() };
        if let Some((clock, state)) = self.awareness.publish(state, now) {
            let frame = PeerMessage::Awareness {
                peer_id: self.local_peer().clone(),
                clock,
                state: Some(state),
            };
            self.broadcast(&frame, now);
        }
    }

    /// Leave the room: best-effort leave notification to every connected
    /// peer, then deterministic teardown. Idempotent, and safe even if
    /// `join` never completed.
    pub fn leave(&mut self) {
        if self.state == RoomState::Closed {
            return;
        }
        let frame = PeerMessage::Leave { peer_id: self.local_offer.peer_id.clone() };
        for session in self.peers.values_mut() {
            if let Some(channel) = session.channel.as_mut() {
                let _ = channel.send(&frame);
                channel.close();
            }
            session.channel = None;
            session.state = PeerSessionState::Closed;
            session.next_reconnect_at = None;
        }
        self.peers.clear();
        for channel in self.inbound.iter_mut() {
            channel.close();
        }
        self.inbound.clear();
        self.state = RoomState::Closed;
        info!(room = %self.room_id, "left room");
    }

    /// Drive the room: drain signaling and every peer channel, release
    /// throttled awareness, expire silent peers, and run periodic
    /// maintenance. All merges are serialized through this call.
    pub fn pump(&mut self, now: Instant) -> Vec<RoomEvent> {
        if self.state == RoomState::Idle || self.state == RoomState::Closed {
            return std::mem::take(&mut self.pending_events);
        }
        self.drain_signaling(now);
        self.accept_inbound(now);
        self.drive_reconnects(now);
        self.drain_channels(now);
        self.flush_awareness(now);
        for peer in self.awareness.sweep(now) {
            self.pending_events.push(RoomEvent::AwarenessExpired { peer: peer.clone() });
            // A peer whose presence expired with no channel traffic at all
            // is gone; tear the channel down rather than trusting it.
            let stale = self.peers.get(&peer).is_some_and(|session| {
                session.state == PeerSessionState::Connected
                    && now.saturating_duration_since(session.last_seen)
                        >= self.config.awareness_timeout()
            });
            if stale {
                self.mark_disconnected(&peer, "liveness timeout", now);
            }
        }
        self.run_maintenance(now);
        self.report_solo(now);
        std::mem::take(&mut self.pending_events)
    }

    // ── Discovery and dialing ───────────────────────────────────────

    fn drain_signaling(&mut self, now: Instant) {
        loop {
            match self.signaling.poll() {
                Ok(Some(offer)) => self.handle_offer(offer, now),
                Ok(None) => break,
                Err(error) => {
                    // Signaling loss only blocks new discoveries.
                    debug!(%error, "signaling poll failed");
                    break;
                }
            }
        }
    }

    fn handle_offer(&mut self, offer: ConnectionOffer, now: Instant) {
        if offer.peer_id == *self.local_peer() {
            return;
        }
        if Url::parse(&offer.endpoint).is_err() {
            warn!(peer = %offer.peer_id, endpoint = %offer.endpoint, "ignoring offer with unparseable endpoint");
            return;
        }
        let dials = self.dials(&offer.peer_id);
        if let Some(existing) = self.peers.get_mut(&offer.peer_id) {
            if existing.state != PeerSessionState::Closed {
                return; // already connecting or connected
            }
            // A fresh offer means the peer is reachable again.
            if dials {
                existing.dial_offer = Some(offer);
                existing.next_reconnect_at = Some(now);
            }
            return;
        }
        if dials {
            self.peers.insert(offer.peer_id.clone(), PeerSession::dialing(offer, now));
        }
        // Otherwise the remote side dials us; the session is created when
        // its hello arrives on an inbound channel.
    }

    /// Deterministic glare avoidance: the lexicographically smaller peer
    /// id dials, the larger accepts.
    fn dials(&self, remote: &PeerId) -> bool {
        self.local_peer() < remote
    }

    fn drive_reconnects(&mut self, now: Instant) {
        let due: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, session)| {
                session.state == PeerSessionState::Closed
                    && session.dial_offer.is_some()
                    && session.next_reconnect_at.is_some_and(|at| at <= now)
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer_id in due {
            self.redial(&peer_id, now);
        }
    }

    fn redial(&mut self, peer_id: &PeerId, now: Instant) {
        let offer = match self.peers.get_mut(peer_id) {
            Some(session) if session.state == PeerSessionState::Closed => {
                session.next_reconnect_at = None;
                match session.dial_offer.clone() {
                    Some(offer) => offer,
                    None => return,
                }
            }
            _ => return,
        };
        let hello = self.hello_frame();
        let opened = self.connector.open(&offer).and_then(|mut channel| {
            channel.send(&hello)?;
            Ok(channel)
        });
        match opened {
            Ok(channel) => {
                debug!(peer = %peer_id, "dialed peer, awaiting handshake");
                if let Some(session) = self.peers.get_mut(peer_id) {
                    session.channel = Some(channel);
                    session.state = PeerSessionState::Connecting;
                    session.last_seen = now;
                }
            }
            Err(error) => {
                warn!(peer = %peer_id, %error, "failed to open peer channel");
                if let Some(session) = self.peers.get_mut(peer_id) {
                    session.consecutive_failures = session.consecutive_failures.saturating_add(1);
                    if session.consecutive_failures < self.reconnect.max_attempts {
                        session.next_reconnect_at =
                            Some(now + self.reconnect.delay(session.consecutive_failures));
                    } else {
                        session.next_reconnect_at = None;
                    }
                }
            }
        }
    }

    fn hello_frame(&self) -> PeerMessage {
        PeerMessage::Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            room_id: self.room_id.clone(),
            peer_id: self.local_peer().clone(),
            identity: self.identity.clone(),
            sent_at: Utc::now(),
        }
    }

    // ── Inbound channels ────────────────────────────────────────────

    fn accept_inbound(&mut self, now: Instant) {
        while let Some(channel) = self.connector.poll_accept() {
            self.inbound.push(channel);
        }
        let mut index = 0;
        while index < self.inbound.len() {
            let poll = self.inbound[index].poll_recv();
            match poll {
                ChannelPoll::Frame(PeerMessage::Hello {
                    protocol_version,
                    room_id,
                    peer_id,
                    identity,
                    ..
                }) => {
                    let channel = self.inbound.remove(index);
                    self.admit_peer(channel, protocol_version, room_id, peer_id, identity, now);
                }
                ChannelPoll::Frame(other) => {
                    warn!(frame = ?other, "closing inbound channel: expected hello first");
                    let mut channel = self.inbound.remove(index);
                    let _ = channel.send(&PeerMessage::Error {
                        code: "EXPECTED_HELLO".to_string(),
                        message: "the first frame on a channel must be hello".to_string(),
                    });
                    channel.close();
                }
                ChannelPoll::Closed => {
                    self.inbound.remove(index);
                }
                ChannelPoll::Empty => {
                    index += 1;
                }
            }
        }
    }

    fn admit_peer(
        &mut self,
        mut channel: Box<dyn PeerChannel>,
        protocol_version: String,
        room_id: RoomId,
        peer_id: PeerId,
        identity: PeerIdentity,
        now: Instant,
    ) {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version.as_str()) {
            warn!(peer = %peer_id, version = %protocol_version, "rejecting peer with unsupported protocol version");
            let _ = channel.send(&PeerMessage::Error {
                code: "UNSUPPORTED_PROTOCOL_VERSION".to_string(),
                message: format!("this peer speaks {CURRENT_PROTOCOL_VERSION}"),
            });
            channel.close();
            return;
        }
        if room_id != self.room_id {
            warn!(peer = %peer_id, room = %room_id, "rejecting peer from a different room");
            let _ = channel.send(&PeerMessage::Error {
                code: "ROOM_MISMATCH".to_string(),
                message: format!("this channel belongs to room {}", self.room_id),
            });
            channel.close();
            return;
        }
        let ack = PeerMessage::HelloAck {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            peer_id: self.local_peer().clone(),
            identity: self.identity.clone(),
            sent_at: Utc::now(),
        };
        if channel.send(&ack).is_err() || channel.send(&self.state_summary()).is_err() {
            channel.close();
            return;
        }
        // Replaces any stale session left over from a previous channel.
        self.peers.insert(
            peer_id.clone(),
            PeerSession {
                state: PeerSessionState::Connected,
                identity: Some(identity.clone()),
                channel: Some(channel),
                dial_offer: None,
                last_seen: now,
                acked: HashMap::new(),
                consecutive_failures: 0,
                next_reconnect_at: None,
            },
        );
        self.state = RoomState::Connected;
        info!(peer = %peer_id, "peer connected");
        self.pending_events.push(RoomEvent::PeerConnected { peer: peer_id, identity });
    }

    /// Our per-document frontiers, exchanged right after the handshake
    /// so each side replays only what the other is missing.
    fn state_summary(&self) -> PeerMessage {
        let docs = self
            .store
            .doc_names()
            .into_iter()
            .map(|doc| DocFrontier { frontier: self.store.frontier(&doc), doc })
            .collect();
        PeerMessage::StateSummary { docs }
    }

    // ── Frame handling ──────────────────────────────────────────────

    fn drain_channels(&mut self, now: Instant) {
        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            loop {
                let poll = match self.peers.get_mut(&peer_id).and_then(|s| s.channel.as_mut()) {
                    Some(channel) => channel.poll_recv(),
                    None => break,
                };
                match poll {
                    ChannelPoll::Empty => break,
                    ChannelPoll::Closed => {
                        self.mark_disconnected(&peer_id, "channel closed", now);
                        break;
                    }
                    ChannelPoll::Frame(frame) => self.handle_frame(&peer_id, frame, now),
                }
            }
        }
    }

    fn handle_frame(&mut self, peer_id: &PeerId, frame: PeerMessage, now: Instant) {
        if let Some(session) = self.peers.get_mut(peer_id) {
            session.last_seen = now;
        }
        self.awareness.observe_traffic(peer_id, now);
        match frame {
            PeerMessage::Hello { .. } => {
                // Hello is only valid as the first frame of an inbound channel.
                debug!(peer = %peer_id, "ignoring unexpected hello");
            }
            PeerMessage::HelloAck { protocol_version, identity, .. } => {
                self.handle_hello_ack(peer_id, &protocol_version, identity, now);
            }
            PeerMessage::StateSummary { docs } => self.handle_state_summary(peer_id, docs, now),
            PeerMessage::Ops { doc, ops_b64 } => self.handle_ops(peer_id, &doc, &ops_b64),
            PeerMessage::Awareness { peer_id: origin, clock, state } => {
                let changed = self.awareness.apply_remote(&origin, clock, state.clone(), now);
                if changed {
                    self.pending_events.push(RoomEvent::AwarenessChanged { peer: origin, state });
                }
            }
            PeerMessage::DigestProbe { doc, digest_hex } => {
                self.handle_digest_probe(peer_id, &doc, &digest_hex, now);
            }
            PeerMessage::Leave { peer_id: origin } => self.handle_leave(&origin),
            PeerMessage::Error { code, message } => {
                warn!(peer = %peer_id, code, message, "peer reported protocol error");
                self.pending_events.push(RoomEvent::ProtocolError {
                    peer: peer_id.clone(),
                    code,
                    message,
                });
                // Fail closed: no automatic redial after a protocol error.
                if let Some(session) = self.peers.get_mut(peer_id) {
                    session.dial_offer = None;
                }
                self.mark_disconnected(peer_id, "peer reported protocol error", now);
            }
        }
    }

    fn handle_hello_ack(
        &mut self,
        peer_id: &PeerId,
        protocol_version: &str,
        identity: PeerIdentity,
        now: Instant,
    ) {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version) {
            warn!(peer = %peer_id, version = %protocol_version, "peer acknowledged with unsupported protocol version");
            if let Some(channel) = self.peers.get_mut(peer_id).and_then(|s| s.channel.as_mut()) {
                let _ = channel.send(&PeerMessage::Error {
                    code: "UNSUPPORTED_PROTOCOL_VERSION".to_string(),
                    message: format!("this peer speaks {CURRENT_PROTOCOL_VERSION}"),
                });
            }
            if let Some(session) = self.peers.get_mut(peer_id) {
                session.dial_offer = None;
            }
            self.mark_disconnected(peer_id, "unsupported protocol version", now);
            return;
        }
        let summary = self.state_summary();
        let mut sent = false;
        if let Some(session) = self.peers.get_mut(peer_id) {
            session.state = PeerSessionState::Connected;
            session.identity = Some(identity.clone());
            session.consecutive_failures = 0;
            if let Some(channel) = session.channel.as_mut() {
                sent = channel.send(&summary).is_ok();
            }
        }
        if sent {
            self.state = RoomState::Connected;
            info!(peer = %peer_id, "peer connected");
            self.pending_events.push(RoomEvent::PeerConnected { peer: peer_id.clone(), identity });
        } else {
            self.mark_disconnected(peer_id, "send failed", now);
        }
    }

    fn handle_state_summary(&mut self, peer_id: &PeerId, docs: Vec<DocFrontier>, now: Instant) {
        let mut replies: Vec<(String, Vec<Operation>)> = Vec::new();
        for doc_frontier in &docs {
            let missing = self.store.ops_since(&doc_frontier.doc, &doc_frontier.frontier);
            if !missing.is_empty() {
                replies.push((doc_frontier.doc.clone(), missing));
            }
        }
        // Documents the summary never mentioned are fully missing there.
        let empty = Frontier::new();
        for doc in self.store.doc_names() {
            if docs.iter().any(|d| d.doc == doc) {
                continue;
            }
            let missing = self.store.ops_since(&doc, &empty);
            if !missing.is_empty() {
                replies.push((doc, missing));
            }
        }
        if let Some(session) = self.peers.get_mut(peer_id) {
            for doc_frontier in docs {
                session.acked.insert(doc_frontier.doc, doc_frontier.frontier);
            }
        }
        for (doc, ops) in replies {
            self.send_ops(peer_id, &doc, &ops, now);
        }
    }

    fn handle_ops(&mut self, peer_id: &PeerId, doc: &str, ops_b64: &[String]) {
        let mut deltas: Vec<MutationDelta> = Vec::new();
        for encoded in ops_b64 {
            let op = match Operation::decode_b64(encoded) {
                Ok(op) => op,
                Err(error) => {
                    // Fails safe: the buffer is never touched by garbage.
                    warn!(peer = %peer_id, doc, %error, "dropping undecodable operation");
                    continue;
                }
            };
            deltas.extend(self.store.apply_remote(doc, &op));
        }
        if !deltas.is_empty() {
            self.pending_events.push(RoomEvent::RemoteEdit { doc: doc.to_string(), deltas });
        }
    }

    fn handle_digest_probe(&mut self, peer_id: &PeerId, doc: &str, digest_hex: &str, now: Instant) {
        if self.store.digest_hex(doc) == digest_hex {
            return;
        }
        warn!(peer = %peer_id, doc, "document digest mismatch, requesting full resync");
        self.pending_events.push(RoomEvent::DivergenceDetected {
            doc: doc.to_string(),
            peer: peer_id.clone(),
        });
        // An empty frontier asks the peer for a full replay of this document.
        let frame = PeerMessage::StateSummary {
            docs: vec![DocFrontier { doc: doc.to_string(), frontier: Frontier::new() }],
        };
        self.send_frame(peer_id, &frame, now);
    }

    fn handle_leave(&mut self, origin: &PeerId) {
        if let Some(mut session) = self.peers.remove(origin) {
            if let Some(channel) = session.channel.as_mut() {
                channel.close();
            }
        }
        // Presence clears immediately instead of waiting for expiry.
        self.awareness.remove(origin);
        info!(peer = %origin, "peer left room");
        self.pending_events.push(RoomEvent::PeerLeft { peer: origin.clone() });
        if self.state == RoomState::Connected && !self.has_connected_peer() {
            self.state = RoomState::Discovering;
        }
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    fn broadcast_ops(&mut self, doc: &str, ops: &[Operation], now: Instant) {
        let Some(frame) = ops_frame(doc, ops) else {
            return;
        };
        self.broadcast(&frame, now);
    }

    fn send_ops(&mut self, peer_id: &PeerId, doc: &str, ops: &[Operation], now: Instant) {
        let Some(frame) = ops_frame(doc, ops) else {
            return;
        };
        self.send_frame(peer_id, &frame, now);
    }

    fn send_frame(&mut self, peer_id: &PeerId, frame: &PeerMessage, now: Instant) {
        let sent = self
            .peers
            .get_mut(peer_id)
            .and_then(|session| session.channel.as_mut())
            .map(|channel| channel.send(frame).is_ok())
            .unwrap_or(false);
        if !sent {
            self.mark_disconnected(peer_id, "send failed", now);
        }
    }

    /// Send to every connected peer; there is no leader and no relay.
    fn broadcast(&mut self, frame: &PeerMessage, now: Instant) {
        let mut lost: Vec<PeerId> = Vec::new();
        for (peer_id, session) in self.peers.iter_mut() {
            if session.state != PeerSessionState::Connected {
                continue;
            }
            let Some(channel) = session.channel.as_mut() else {
                continue;
            };
            if channel.send(frame).is_err() {
                lost.push(peer_id.clone());
            }
        }
        for peer_id in lost {
            self.mark_disconnected(&peer_id, "send failed", now);
        }
    }

    // ── Lifecycle bookkeeping ───────────────────────────────────────

    fn mark_disconnected(&mut self, peer_id: &PeerId, reason: &str, now: Instant) {
        let Some(session) = self.peers.get_mut(peer_id) else {
            return;
        };
        if session.state == PeerSessionState::Closed && session.channel.is_none() {
            return;
        }
        if let Some(channel) = session.channel.as_mut() {
            channel.close();
        }
        session.channel = None;
        session.state = PeerSessionState::Closed;
        let mut will_retry = false;
        if session.dial_offer.is_some() {
            session.consecutive_failures = session.consecutive_failures.saturating_add(1);
            if session.consecutive_failures < self.reconnect.max_attempts {
                session.next_reconnect_at =
                    Some(now + self.reconnect.delay(session.consecutive_failures));
                will_retry = true;
            } else {
                session.next_reconnect_at = None;
            }
        }
        // The peer's presence is left for the liveness sweep; document
        // state is unaffected.
        warn!(peer = %peer_id, reason, will_retry, "peer channel lost");
        self.pending_events.push(RoomEvent::PeerDisconnected {
            peer: peer_id.clone(),
            reason: reason.to_string(),
            will_retry,
        });
        if self.state == RoomState::Connected && !self.has_connected_peer() {
            self.state = RoomState::Discovering;
        }
    }

    fn has_connected_peer(&self) -> bool {
        self.peers.values().any(|session| session.state == PeerSessionState::Connected)
    }

    fn flush_awareness(&mut self, now: Instant) {
        if let Some((clock, state)) = self.awareness.flush(now) {
            let frame = PeerMessage::Awareness {
                peer_id: self.local_peer().clone(),
                clock,
                state: Some(state),
            };
            self.broadcast(&frame, now);
        }
    }

    fn run_maintenance(&mut self, now: Instant) {
        let Some(interval) = self.config.digest_probe_interval() else {
            return;
        };
        let due = self
            .last_probe_at
            .map_or(true, |last| now.saturating_duration_since(last) >= interval);
        if !due || !self.has_connected_peer() {
            return;
        }
        self.last_probe_at = Some(now);
        for doc in self.store.doc_names() {
            let frame =
                PeerMessage::DigestProbe { digest_hex: self.store.digest_hex(&doc), doc };
            self.broadcast(&frame, now);
        }
        if self.config.compaction {
            self.compact_acknowledged();
        }
    }

    /// Prune tombstones covered by every connected peer's acknowledged
    /// frontier. Skipped while no peer is connected or a peer has not
    /// acknowledged a document yet; pruning is never speculative.
    fn compact_acknowledged(&mut self) {
        let connected: Vec<&PeerSession> = self
            .peers
            .values()
            .filter(|session| session.state == PeerSessionState::Connected)
            .collect();
        if connected.is_empty() {
            return;
        }
        for doc in self.store.doc_names() {
            let Some(acked) = min_acked_frontier(&connected, &doc) else {
                continue;
            };
            let pruned = self.store.compact(&doc, &acked);
            if pruned > 0 {
                debug!(doc = %doc, pruned, "pruned acknowledged tombstones");
            }
        }
    }

    fn report_solo(&mut self, now: Instant) {
        if self.solo_reported || self.state != RoomState::Discovering {
            return;
        }
        let Some(deadline) = self.discovery_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if self.peers.is_empty() && self.inbound.is_empty() {
            self.solo_reported = true;
            info!(room = %self.room_id, "no peers found yet, editing solo");
            self.pending_events.push(RoomEvent::NoPeersFound);
        }
    }
}

fn ops_frame(doc: &str, ops: &[Operation]) -> Option<PeerMessage> {
    let mut ops_b64 = Vec::with_capacity(ops.len());
    for op in ops {
        match op.encode_b64() {
            Ok(encoded) => ops_b64.push(encoded),
            Err(error) => {
                warn!(doc, op = %op.id(), %error, "failed to encode operation, not sent");
            }
        }
    }
    if ops_b64.is_empty() {
        return None;
    }
    Some(PeerMessage::Ops { doc: doc.to_string(), ops_b64 })
}

fn min_acked_frontier(peers: &[&PeerSession], doc: &str) -> Option<Frontier> {
    let mut iter = peers.iter();
    let mut min = iter.next()?.acked.get(doc)?.clone();
    for peer in iter {
        min = min.meet(peer.acked.get(doc)?);
    }
    Some(min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const DOC: &str = "notes.md";

    // ── Scripted signaling ──────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedSignaling {
        announced: Vec<(RoomId, ConnectionOffer)>,
        offers: VecDeque<ConnectionOffer>,
        fail_announce: bool,
    }

    impl Signaling for ScriptedSignaling {
        fn announce(&mut self, room: &RoomId, offer: &ConnectionOffer) -> Result<()> {
            if self.fail_announce {
                return Err(anyhow!("signaling unreachable"));
            }
            self.announced.push((room.clone(), offer.clone()));
            Ok(())
        }

        fn poll(&mut self) -> Result<Option<ConnectionOffer>> {
            Ok(self.offers.pop_front())
        }
    }

    // ── Scripted channels ───────────────────────────────────────────

    #[derive(Clone, Default)]
    struct ChannelHandle {
        sent: Arc<Mutex<Vec<PeerMessage>>>,
        recv: Arc<Mutex<VecDeque<PeerMessage>>>,
        closed: Arc<Mutex<bool>>,
        remote_closed: Arc<Mutex<bool>>,
    }

    impl ChannelHandle {
        fn queue(&self, msg: PeerMessage) {
            self.recv.lock().unwrap().push_back(msg);
        }

        fn sent(&self) -> Vec<PeerMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }

        fn close_remote(&self) {
            *self.remote_closed.lock().unwrap() = true;
        }

        fn channel(&self) -> Box<dyn PeerChannel> {
            Box::new(ScriptedChannel { handle: self.clone() })
        }
    }

    struct ScriptedChannel {
        handle: ChannelHandle,
    }

    impl PeerChannel for ScriptedChannel {
        fn send(&mut self, msg: &PeerMessage) -> Result<()> {
            if *self.handle.closed.lock().unwrap() || *self.handle.remote_closed.lock().unwrap() {
                return Err(anyhow!("channel closed"));
            }
            self.handle.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn poll_recv(&mut self) -> ChannelPoll {
            if *self.handle.closed.lock().unwrap() {
                return ChannelPoll::Closed;
            }
            match self.handle.recv.lock().unwrap().pop_front() {
                Some(msg) => ChannelPoll::Frame(msg),
                None if *self.handle.remote_closed.lock().unwrap() => ChannelPoll::Closed,
                None => ChannelPoll::Empty,
            }
        }

        fn close(&mut self) {
            *self.handle.closed.lock().unwrap() = true;
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        open_calls: Vec<ConnectionOffer>,
        open_queue: VecDeque<ChannelHandle>,
        accept_queue: VecDeque<Box<dyn PeerChannel>>,
        fail_open: bool,
    }

    impl PeerConnector for ScriptedConnector {
        fn open(&mut self, offer: &ConnectionOffer) -> Result<Box<dyn PeerChannel>> {
            self.open_calls.push(offer.clone());
            if self.fail_open {
                return Err(anyhow!("dial refused"));
            }
            let handle = self.open_queue.pop_front().ok_or_else(|| anyhow!("no scripted channel"))?;
            Ok(handle.channel())
        }

        fn poll_accept(&mut self) -> Option<Box<dyn PeerChannel>> {
            self.accept_queue.pop_front()
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    type TestSession = RoomSession<ScriptedSignaling, ScriptedConnector>;

    fn identity(name: &str) -> PeerIdentity {
        PeerIdentity { display_name: name.to_string(), color: "#c678dd".to_string() }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            discovery_timeout_ms: 100,
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 400,
            reconnect_max_attempts: 4,
            awareness_throttle_ms: 50,
            awareness_timeout_ms: 1_000,
            digest_probe_interval_ms: 0,
            compaction: false,
        }
    }

    fn new_session(local: &str) -> TestSession {
        new_session_with_config(local, test_config())
    }

    fn new_session_with_config(local: &str, config: SyncConfig) -> TestSession {
        RoomSession::new(
            RoomId::new("room-1"),
            PeerId::new(local),
            identity(local),
            format!("mem://{local}"),
            ScriptedSignaling::default(),
            ScriptedConnector::default(),
            config,
        )
    }

    fn offer(peer: &str) -> ConnectionOffer {
        ConnectionOffer { peer_id: PeerId::new(peer), endpoint: format!("mem://{peer}") }
    }

    fn hello_ack(peer: &str) -> PeerMessage {
        PeerMessage::HelloAck {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            peer_id: PeerId::new(peer),
            identity: identity(peer),
            sent_at: Utc::now(),
        }
    }

    fn awareness_frame(peer: &str, clock: u64, cursor: u32) -> PeerMessage {
        PeerMessage::Awareness {
            peer_id: PeerId::new(peer),
            clock,
            state: Some(PresenceState {
                identity: identity(peer),
                cursor: Some(CursorLocator { anchor: cursor, head: cursor }),
                updated_at: Utc::now(),
            }),
        }
    }

    /// Dial "bob" from an "alice" session and complete the handshake.
    fn connect_peer(session: &mut TestSession, remote: &str, now: Instant) -> ChannelHandle {
        let handle = ChannelHandle::default();
        session.connector.open_queue.push_back(handle.clone());
        session.signaling.offers.push_back(offer(remote));
        handle.queue(hello_ack(remote));
        let events = session.pump(now);
        assert!(
            events.iter().any(|e| matches!(e, RoomEvent::PeerConnected { .. })),
            "expected PeerConnected, got {events:?}"
        );
        handle
    }

    fn decode_ops(frame: &PeerMessage) -> Vec<Operation> {
        match frame {
            PeerMessage::Ops { ops_b64, .. } => ops_b64
                .iter()
                .map(|b64| Operation::decode_b64(b64).expect("ops frame should decode"))
                .collect(),
            other => panic!("expected an ops frame, got {other:?}"),
        }
    }

    // ── Join and discovery ──────────────────────────────────────────

    #[test]
    fn join_announces_and_enters_discovering() {
        let mut session = new_session("alice");
        assert_eq!(session.state(), RoomState::Idle);

        session.join(Instant::now()).expect("join should announce");
        assert_eq!(session.state(), RoomState::Discovering);
        assert_eq!(session.signaling.announced.len(), 1);
        let (room, announced) = &session.signaling.announced[0];
        assert_eq!(room, &RoomId::new("room-1"));
        assert_eq!(announced.peer_id, PeerId::new("alice"));
    }

    #[test]
    fn join_twice_announces_once() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("first join");
        session.join(now).expect("second join is a no-op");
        assert_eq!(session.signaling.announced.len(), 1);
    }

    #[test]
    fn join_surfaces_signaling_failure() {
        let mut session = new_session("alice");
        session.signaling.fail_announce = true;
        assert!(session.join(Instant::now()).is_err());
        assert_eq!(session.state(), RoomState::Idle);
    }

    #[test]
    fn discovery_timeout_reports_no_peers_once() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");

        assert!(session.pump(now).is_empty());
        let events = session.pump(now + Duration::from_millis(150));
        assert_eq!(events, vec![RoomEvent::NoPeersFound]);
        assert!(session.pump(now + Duration::from_millis(300)).is_empty());
    }

    #[test]
    fn pump_before_join_does_nothing() {
        let mut session = new_session("alice");
        assert!(session.pump(Instant::now()).is_empty());
        assert!(session.connector.open_calls.is_empty());
    }

    // ── Dialing and handshake ───────────────────────────────────────

    #[test]
    fn smaller_peer_dials_and_completes_handshake() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");

        let handle = connect_peer(&mut session, "bob", now);
        assert_eq!(session.state(), RoomState::Connected);
        assert_eq!(session.connected_peers(), vec![PeerId::new("bob")]);

        let sent = handle.sent();
        assert!(matches!(sent[0], PeerMessage::Hello { .. }));
        assert!(matches!(sent[1], PeerMessage::StateSummary { .. }));
    }

    #[test]
    fn larger_peer_waits_for_inbound_dial() {
        let mut session = new_session("bob");
        let now = Instant::now();
        session.join(now).expect("join");

        session.signaling.offers.push_back(offer("alice"));
        session.pump(now);
        assert!(session.connector.open_calls.is_empty());
    }

    #[test]
    fn own_offer_and_garbage_endpoints_are_ignored() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");

        session.signaling.offers.push_back(offer("alice"));
        session.signaling.offers.push_back(ConnectionOffer {
            peer_id: PeerId::new("zed"),
            endpoint: "not a url".to_string(),
        });
        session.pump(now);
        assert!(session.connector.open_calls.is_empty());
        assert!(session.peers.is_empty());
    }

    #[test]
    fn hello_ack_with_foreign_version_fails_closed() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");

        let handle = ChannelHandle::default();
        session.connector.open_queue.push_back(handle.clone());
        session.signaling.offers.push_back(offer("bob"));
        handle.queue(PeerMessage::HelloAck {
            protocol_version: "cowrite-sync.v999".to_string(),
            peer_id: PeerId::new("bob"),
            identity: identity("bob"),
            sent_at: Utc::now(),
        });

        let events = session.pump(now);
        assert!(events.iter().any(|e| matches!(
            e,
            RoomEvent::PeerDisconnected { will_retry: false, .. }
        )));
        assert!(handle.is_closed());
        assert!(handle.sent().iter().any(|m| matches!(m, PeerMessage::Error { code, .. }
            if code == "UNSUPPORTED_PROTOCOL_VERSION")));
        // No redial is ever scheduled for a version mismatch.
        session.pump(now + Duration::from_secs(60));
        assert_eq!(session.connector.open_calls.len(), 1);
    }

    // ── Inbound admission ───────────────────────────────────────────

    #[test]
    fn inbound_hello_is_acked_with_a_state_summary() {
        let mut session = new_session("bob");
        let now = Instant::now();
        session.join(now).expect("join");

        let handle = ChannelHandle::default();
        handle.queue(PeerMessage::Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            room_id: RoomId::new("room-1"),
            peer_id: PeerId::new("alice"),
            identity: identity("alice"),
            sent_at: Utc::now(),
        });
        session.connector.accept_queue.push_back(handle.channel());

        let events = session.pump(now);
        assert!(events.iter().any(|e| matches!(e, RoomEvent::PeerConnected { peer, .. }
            if *peer == PeerId::new("alice"))));
        let sent = handle.sent();
        assert!(matches!(sent[0], PeerMessage::HelloAck { .. }));
        assert!(matches!(sent[1], PeerMessage::StateSummary { .. }));
    }

    #[test]
    fn inbound_hello_from_wrong_room_is_rejected() {
        let mut session = new_session("bob");
        let now = Instant::now();
        session.join(now).expect("join");

        let handle = ChannelHandle::default();
        handle.queue(PeerMessage::Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            room_id: RoomId::new("another-room"),
            peer_id: PeerId::new("alice"),
            identity: identity("alice"),
            sent_at: Utc::now(),
        });
        session.connector.accept_queue.push_back(handle.channel());

        let events = session.pump(now);
        assert!(events.is_empty());
        assert!(handle.is_closed());
        assert!(handle.sent().iter().any(|m| matches!(m, PeerMessage::Error { code, .. }
            if code == "ROOM_MISMATCH")));
    }

    #[test]
    fn inbound_channel_must_lead_with_hello() {
        let mut session = new_session("bob");
        let now = Instant::now();
        session.join(now).expect("join");

        let handle = ChannelHandle::default();
        handle.queue(PeerMessage::Leave { peer_id: PeerId::new("alice") });
        session.connector.accept_queue.push_back(handle.channel());

        session.pump(now);
        assert!(handle.is_closed());
        assert!(handle.sent().iter().any(|m| matches!(m, PeerMessage::Error { code, .. }
            if code == "EXPECTED_HELLO")));
    }

    // ── Fan-out and catch-up ────────────────────────────────────────

    #[test]
    fn local_edits_fan_out_to_connected_peers() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        session.local_edit(DOC, &EditEvent::Insert { index: 0, text: "hi".to_string() }, now);

        let sent = handle.sent();
        let ops = decode_ops(sent.last().expect("an ops frame should be sent"));
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Operation::Insert { content, .. } if content == "hi"));
    }

    #[test]
    fn no_op_edits_are_not_broadcast() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);
        let frames_before = handle.sent().len();

        session.local_edit(DOC, &EditEvent::Insert { index: 0, text: String::new() }, now);
        session.local_edit(DOC, &EditEvent::Delete { index: 0, len: 3 }, now);
        assert_eq!(handle.sent().len(), frames_before);
    }

    #[test]
    fn state_summary_is_answered_with_exactly_the_missing_ops() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        for (index, ch) in "abcde".chars().enumerate() {
            session.local_edit(DOC, &EditEvent::Insert { index, text: ch.to_string() }, now);
        }

        // Bob claims he has the first three operations already.
        let mut frontier = Frontier::new();
        frontier.advance(&PeerId::new("alice"), 3);
        handle.queue(PeerMessage::StateSummary {
            docs: vec![DocFrontier { doc: DOC.to_string(), frontier }],
        });
        session.pump(now);

        let sent = handle.sent();
        let ops = decode_ops(sent.last().expect("a catch-up frame should be sent"));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn state_summary_covers_documents_the_peer_never_mentioned() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        session.seed_document(DOC, "seeded", now);
        let frames_before = handle.sent().len();

        handle.queue(PeerMessage::StateSummary { docs: vec![] });
        session.pump(now);

        let sent = handle.sent();
        assert_eq!(sent.len(), frames_before + 1);
        let ops = decode_ops(&sent[frames_before]);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn remote_ops_merge_and_surface_deltas() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        let op = Operation::Insert {
            id: cowrite_common::types::OpId::new(PeerId::new("bob"), 1),
            left: None,
            content: "yo".to_string(),
        };
        handle.queue(PeerMessage::Ops {
            doc: DOC.to_string(),
            ops_b64: vec![op.encode_b64().expect("encode op")],
        });

        let events = session.pump(now);
        assert!(events.contains(&RoomEvent::RemoteEdit {
            doc: DOC.to_string(),
            deltas: vec![MutationDelta::Insert { index: 0, text: "yo".to_string() }],
        }));
        assert_eq!(session.store().text(DOC), "yo");
    }

    #[test]
    fn undecodable_ops_are_dropped_without_touching_state() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        let good = Operation::Insert {
            id: cowrite_common::types::OpId::new(PeerId::new("bob"), 1),
            left: None,
            content: "ok".to_string(),
        };
        handle.queue(PeerMessage::Ops {
            doc: DOC.to_string(),
            ops_b64: vec![
                "!!garbage!!".to_string(),
                good.encode_b64().expect("encode op"),
            ],
        });

        session.pump(now);
        assert_eq!(session.store().text(DOC), "ok");
        // The channel survives a bad payload.
        assert_eq!(session.connected_peers(), vec![PeerId::new("bob")]);
    }

    // ── Awareness ───────────────────────────────────────────────────

    #[test]
    fn awareness_bursts_coalesce_into_one_flush() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        session.publish_awareness(Some(CursorLocator { anchor: 1, head: 1 }), now);
        session.publish_awareness(Some(CursorLocator { anchor: 2, head: 2 }), now);
        session.publish_awareness(Some(CursorLocator { anchor: 3, head: 3 }), now);

        let count = |handle: &ChannelHandle| {
            handle
                .sent()
                .iter()
                .filter(|m| matches!(m, PeerMessage::Awareness { .. }))
                .count()
        };
        assert_eq!(count(&handle), 1);

        session.pump(now + Duration::from_millis(60));
        assert_eq!(count(&handle), 2);
        match handle.sent().last().cloned() {
            Some(PeerMessage::Awareness { clock, state: Some(state), .. }) => {
                assert_eq!(clock, 2);
                assert_eq!(state.cursor, Some(CursorLocator { anchor: 3, head: 3 }));
            }
            other => panic!("expected a flushed awareness frame, got {other:?}"),
        }
    }

    #[test]
    fn remote_awareness_surfaces_and_expires_without_traffic() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        handle.queue(awareness_frame("bob", 1, 7));
        let events = session.pump(now);
        assert!(events.iter().any(|e| matches!(e, RoomEvent::AwarenessChanged { peer, .. }
            if *peer == PeerId::new("bob"))));
        assert!(session.awareness().get(&PeerId::new("bob")).is_some());

        // Silence past the liveness timeout is the only cleanup path.
        let events = session.pump(now + Duration::from_millis(1_500));
        assert!(events.contains(&RoomEvent::AwarenessExpired { peer: PeerId::new("bob") }));
        assert!(session.awareness().get(&PeerId::new("bob")).is_none());
    }

    #[test]
    fn clean_leave_clears_presence_immediately() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        handle.queue(awareness_frame("bob", 1, 0));
        handle.queue(PeerMessage::Leave { peer_id: PeerId::new("bob") });
        let events = session.pump(now);

        assert!(events.contains(&RoomEvent::PeerLeft { peer: PeerId::new("bob") }));
        assert!(session.awareness().get(&PeerId::new("bob")).is_none());
        assert!(session.connected_peers().is_empty());
    }

    // ── Channel loss and reconnection ───────────────────────────────

    #[test]
    fn channel_loss_schedules_backoff_redials() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        handle.close_remote();
        let events = session.pump(now);
        assert!(events.iter().any(|e| matches!(
            e,
            RoomEvent::PeerDisconnected { will_retry: true, .. }
        )));
        assert_eq!(session.state(), RoomState::Discovering);

        // One failure: the redial waits out base_delay * 2.
        let next = ChannelHandle::default();
        session.connector.open_queue.push_back(next.clone());
        session.pump(now + Duration::from_millis(50));
        assert_eq!(session.connector.open_calls.len(), 1);

        next.queue(hello_ack("bob"));
        let events = session.pump(now + Duration::from_millis(110));
        assert_eq!(session.connector.open_calls.len(), 2);
        assert!(events.iter().any(|e| matches!(e, RoomEvent::PeerConnected { .. })));
        assert_eq!(session.state(), RoomState::Connected);
    }

    #[test]
    fn redials_stop_after_max_attempts() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        handle.close_remote();
        session.connector.fail_open = true;
        // Drive far past every backoff window.
        let mut at = now;
        for _ in 0..32 {
            at += Duration::from_secs(1);
            session.pump(at);
        }
        // First dial succeeded, then at most max_attempts - 1 redials.
        assert!(session.connector.open_calls.len() <= 4);
        let calls = session.connector.open_calls.len();
        session.pump(at + Duration::from_secs(120));
        assert_eq!(session.connector.open_calls.len(), calls);
    }

    // ── Divergence hardening ────────────────────────────────────────

    #[test]
    fn digest_mismatch_requests_full_resync() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);
        session.local_edit(DOC, &EditEvent::Insert { index: 0, text: "x".to_string() }, now);

        handle.queue(PeerMessage::DigestProbe {
            doc: DOC.to_string(),
            digest_hex: "0000".to_string(),
        });
        let events = session.pump(now);

        assert!(events.contains(&RoomEvent::DivergenceDetected {
            doc: DOC.to_string(),
            peer: PeerId::new("bob"),
        }));
        match handle.sent().last().cloned() {
            Some(PeerMessage::StateSummary { docs }) => {
                assert_eq!(docs.len(), 1);
                assert!(docs[0].frontier.is_empty());
            }
            other => panic!("expected a resync request, got {other:?}"),
        }
    }

    #[test]
    fn matching_digest_probe_is_silent() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);
        session.local_edit(DOC, &EditEvent::Insert { index: 0, text: "x".to_string() }, now);
        let frames_before = handle.sent().len();

        handle.queue(PeerMessage::DigestProbe {
            doc: DOC.to_string(),
            digest_hex: session.store().digest_hex(DOC),
        });
        let events = session.pump(now);
        assert!(events.is_empty());
        assert_eq!(handle.sent().len(), frames_before);
    }

    #[test]
    fn maintenance_probes_documents_and_compacts_acknowledged_tombstones() {
        let mut config = test_config();
        config.digest_probe_interval_ms = 10;
        config.compaction = true;
        let mut session = new_session_with_config("alice", config);
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        for (index, ch) in "abc".chars().enumerate() {
            session.local_edit(DOC, &EditEvent::Insert { index, text: ch.to_string() }, now);
        }
        session.local_edit(DOC, &EditEvent::Delete { index: 2, len: 1 }, now);
        assert_eq!(session.store().marker_count(DOC), 3);

        // Bob acknowledges everything, including the delete.
        let mut frontier = Frontier::new();
        frontier.advance(&PeerId::new("alice"), 4);
        handle.queue(PeerMessage::StateSummary {
            docs: vec![DocFrontier { doc: DOC.to_string(), frontier }],
        });
        session.pump(now + Duration::from_millis(20));

        session.pump(now + Duration::from_millis(40));
        assert_eq!(session.store().marker_count(DOC), 2);
        assert!(handle.sent().iter().any(|m| matches!(m, PeerMessage::DigestProbe { .. })));
    }

    // ── Leave ───────────────────────────────────────────────────────

    #[test]
    fn leave_notifies_peers_and_is_idempotent() {
        let mut session = new_session("alice");
        let now = Instant::now();
        session.join(now).expect("join");
        let handle = connect_peer(&mut session, "bob", now);

        session.leave();
        assert_eq!(session.state(), RoomState::Closed);
        assert!(matches!(handle.sent().last(), Some(PeerMessage::Leave { .. })));
        assert!(handle.is_closed());

        session.leave();
        assert!(session.pump(now).is_empty());
    }

    #[test]
    fn leave_before_join_is_safe() {
        let mut session = new_session("alice");
        session.leave();
        assert_eq!(session.state(), RoomState::Closed);
        session.leave();
    }
}
