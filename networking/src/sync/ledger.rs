use std::collections::HashMap;
use std::time::Duration;

use libp2p_identity::PeerId;
use tokio::time::Instant;

use crate::req_resp::{MessageKind, RequestId, SyncRequest};

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub peer_id: PeerId,
    pub request: SyncRequest,
    generation: u64,
    retired: bool,
    issued_at: Instant,
}

/// What the ledger makes of an incoming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerVerdict {
    /// Issued by the active state and answered by the right peer.
    Accepted(SyncRequest),
    /// No request with this id is outstanding.
    Unknown,
    WrongPeer { expected: PeerId },
    WrongKind { expected: MessageKind },
    /// Issued by a state that is no longer active. `late` is set once the
    /// response took longer than the request timeout.
    Stale { late: bool },
}

/// Every outbound request the coordinator issued and has not seen answered.
///
/// A transition bumps the generation; entries from older generations are
/// kept only to tell a late answer from a forged one.
#[derive(Debug, Default)]
pub struct RequestLedger {
    next_id: RequestId,
    generation: u64,
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, peer_id: PeerId, request: SyncRequest) -> RequestId {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            PendingRequest {
                peer_id,
                request,
                generation: self.generation,
                retired: false,
                issued_at: Instant::now(),
            },
        );
        id
    }

    /// Forget a request that never left.
    pub fn cancel(&mut self, id: RequestId) {
        self.pending.remove(&id);
    }

    /// The active state gave up waiting for this request.
    pub fn retire(&mut self, id: RequestId) {
        if let Some(entry) = self.pending.get_mut(&id) {
            entry.retired = true;
        }
    }

    pub fn advance_generation(&mut self) {
        self.generation += 1;
    }

    pub fn check(
        &mut self,
        id: RequestId,
        peer_id: &PeerId,
        kind: MessageKind,
        timeout: Duration,
    ) -> LedgerVerdict {
        let Some(entry) = self.pending.get(&id) else {
            return LedgerVerdict::Unknown;
        };
        if entry.peer_id != *peer_id {
            return LedgerVerdict::WrongPeer {
                expected: entry.peer_id,
            };
        }
        if entry.request.kind() != kind {
            return LedgerVerdict::WrongKind {
                expected: entry.request.kind(),
            };
        }
        let Some(entry) = self.pending.remove(&id) else {
            return LedgerVerdict::Unknown;
        };
        if entry.retired {
            return LedgerVerdict::Stale { late: true };
        }
        if entry.generation != self.generation {
            return LedgerVerdict::Stale {
                late: entry.issued_at.elapsed() >= timeout,
            };
        }
        LedgerVerdict::Accepted(entry.request)
    }

    /// Drop entries of past states older than `max_age`.
    pub fn purge(&mut self, max_age: Duration) {
        let generation = self.generation;
        self.pending.retain(|_, entry| {
            (entry.generation == generation && !entry.retired)
                || entry.issued_at.elapsed() < max_age
        });
    }

    /// Requests issued by the active state and still awaited.
    pub fn in_flight(&self) -> usize {
        self.pending
            .values()
            .filter(|entry| entry.generation == self.generation && !entry.retired)
            .count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
