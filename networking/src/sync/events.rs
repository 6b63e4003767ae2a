use chain::EventType;
use containers::Status;
use libp2p_identity::PeerId;

use crate::req_resp::{RequestId, SyncResponse};

/// Everything the sync service reacts to, posted onto its single event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PeerStatus {
        peer_id: PeerId,
        status: Status,
        snap_capable: bool,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    Response {
        peer_id: PeerId,
        request_id: RequestId,
        response: SyncResponse,
    },
    SnapProgress {
        peer_id: PeerId,
    },
    SnapFinished {
        peer_id: PeerId,
    },
    SnapFailed {
        peer_id: PeerId,
        event: EventType,
        reason: String,
    },
}
