use libp2p_identity::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Peer misbehaviour reported by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    InvalidBlock,
    InvalidHeader,
    InvalidMessage,
    TimeoutMessage,
    UnexpectedMessage,
    RepeatedMessage,
    InvalidNetwork,
    IncompatibleProtocol,
    UnexpectedGenesis,
    InvalidStateChunk,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::InvalidBlock,
        EventType::InvalidHeader,
        EventType::InvalidMessage,
        EventType::TimeoutMessage,
        EventType::UnexpectedMessage,
        EventType::RepeatedMessage,
        EventType::InvalidNetwork,
        EventType::IncompatibleProtocol,
        EventType::UnexpectedGenesis,
        EventType::InvalidStateChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InvalidBlock => "invalid_block",
            EventType::InvalidHeader => "invalid_header",
            EventType::InvalidMessage => "invalid_message",
            EventType::TimeoutMessage => "timeout_message",
            EventType::UnexpectedMessage => "unexpected_message",
            EventType::RepeatedMessage => "repeated_message",
            EventType::InvalidNetwork => "invalid_network",
            EventType::IncompatibleProtocol => "incompatible_protocol",
            EventType::UnexpectedGenesis => "unexpected_genesis",
            EventType::InvalidStateChunk => "invalid_state_chunk",
        }
    }

    /// Reputation cost of one occurrence.
    pub fn penalty(&self) -> u32 {
        match self {
            EventType::InvalidBlock
            | EventType::InvalidHeader
            | EventType::InvalidNetwork
            | EventType::IncompatibleProtocol
            | EventType::UnexpectedGenesis
            | EventType::InvalidStateChunk => ReputationTable::BAD_REPUTATION_PENALTY,
            EventType::InvalidMessage => 50,
            EventType::TimeoutMessage | EventType::UnexpectedMessage => 10,
            EventType::RepeatedMessage => 5,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait PeerScoring: Send + Sync {
    fn has_good_reputation(&self, peer_id: &PeerId) -> bool;

    fn record_event(&self, peer_id: &PeerId, event: EventType, message: &str);
}

#[derive(Debug, Default, Clone)]
struct PeerScore {
    penalty: u32,
    events: HashMap<EventType, u32>,
}

/// Accumulates penalties per peer; a peer whose penalty reaches
/// [`ReputationTable::BAD_REPUTATION_PENALTY`] loses its good reputation.
#[derive(Debug, Default)]
pub struct ReputationTable {
    scores: RwLock<HashMap<PeerId, PeerScore>>,
}

impl ReputationTable {
    pub const BAD_REPUTATION_PENALTY: u32 = 100;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self, peer_id: &PeerId, event: EventType) -> u32 {
        self.scores
            .read()
            .get(peer_id)
            .and_then(|score| score.events.get(&event).copied())
            .unwrap_or_default()
    }

    pub fn total_events(&self, peer_id: &PeerId) -> u32 {
        self.scores
            .read()
            .get(peer_id)
            .map(|score| score.events.values().sum())
            .unwrap_or_default()
    }

    pub fn penalty(&self, peer_id: &PeerId) -> u32 {
        self.scores
            .read()
            .get(peer_id)
            .map(|score| score.penalty)
            .unwrap_or_default()
    }
}

impl PeerScoring for ReputationTable {
    fn has_good_reputation(&self, peer_id: &PeerId) -> bool {
        self.penalty(peer_id) < Self::BAD_REPUTATION_PENALTY
    }

    fn record_event(&self, peer_id: &PeerId, event: EventType, message: &str) {
        let mut scores = self.scores.write();
        let score = scores.entry(*peer_id).or_default();
        score.penalty = score.penalty.saturating_add(event.penalty());
        *score.events.entry(event).or_default() += 1;
        warn!(peer = %peer_id, event = %event, penalty = score.penalty, "{message}");
    }
}
