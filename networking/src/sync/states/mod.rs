//! Sync state machine.
//!
//! Exactly one [`SyncState`] is active. Each variant interprets the events
//! routed to it and answers with a [`Transition`]; the coordinator applies
//! the transition by building the next state and calling its `on_enter`.

mod checking_best_header;
mod deciding;
mod downloading_backwards_bodies;
mod downloading_backwards_headers;
mod downloading_bodies;
mod downloading_headers;
mod downloading_skeleton;
mod finding_connection_point;
mod snap_selection;
mod snap_sync;
mod waiting;

pub use checking_best_header::CheckingBestHeader;
pub use deciding::PeerAndModeDeciding;
pub use downloading_backwards_bodies::DownloadingBackwardsBodies;
pub use downloading_backwards_headers::DownloadingBackwardsHeaders;
pub use downloading_bodies::DownloadingBodies;
pub use downloading_headers::DownloadingHeaders;
pub use downloading_skeleton::DownloadingSkeleton;
pub use finding_connection_point::FindingConnectionPoint;
pub use snap_selection::{SnapCapablePeerSelection, snap_checkpoint_number};
pub use snap_sync::SnapSync;
pub use waiting::WaitingForPeers;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use chain::{BlockStore, EventType, SnapshotProcessor, Validators};
use containers::{Block, BlockBody, BlockDifficulty, BlockHeader, BlockIdentifier, BlockNumber, Bytes32};
use libp2p_identity::PeerId;

use super::config::SyncConfig;
use super::error::SyncError;
use super::ledger::RequestLedger;
use super::peer_manager::PeerManager;
use crate::req_resp::{RequestId, SyncRequest};
use crate::types::NetworkRequester;

pub type SyncResult = Result<Transition, SyncError>;

/// Protocol phase of the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncPhase {
    #[default]
    WaitingForPeers,
    PeerAndModeDeciding,
    CheckingBestHeader,
    FindingConnectionPoint,
    DownloadingSkeleton,
    DownloadingHeaders,
    DownloadingBodies,
    DownloadingBackwardsHeaders,
    DownloadingBackwardsBodies,
    SnapCapablePeerSelection,
    SnapSync,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::WaitingForPeers => "waiting_for_peers",
            SyncPhase::PeerAndModeDeciding => "peer_and_mode_deciding",
            SyncPhase::CheckingBestHeader => "checking_best_header",
            SyncPhase::FindingConnectionPoint => "finding_connection_point",
            SyncPhase::DownloadingSkeleton => "downloading_skeleton",
            SyncPhase::DownloadingHeaders => "downloading_headers",
            SyncPhase::DownloadingBodies => "downloading_bodies",
            SyncPhase::DownloadingBackwardsHeaders => "downloading_backwards_headers",
            SyncPhase::DownloadingBackwardsBodies => "downloading_backwards_bodies",
            SyncPhase::SnapCapablePeerSelection => "snap_capable_peer_selection",
            SyncPhase::SnapSync => "snap_sync",
        }
    }

    /// Numeric id exported as a gauge.
    pub fn id(&self) -> i64 {
        *self as i64
    }

    pub fn is_syncing(&self) -> bool {
        !matches!(
            self,
            SyncPhase::WaitingForPeers | SyncPhase::PeerAndModeDeciding
        )
    }

    /// Check if a transition to the target phase is valid.
    ///
    /// Stopping is always allowed; everything else follows the protocol order.
    pub fn can_transition_to(&self, target: SyncPhase) -> bool {
        if target == SyncPhase::WaitingForPeers {
            return true;
        }
        match self {
            // A sync may also be started directly with a chosen peer.
            SyncPhase::WaitingForPeers => matches!(
                target,
                SyncPhase::PeerAndModeDeciding
                    | SyncPhase::CheckingBestHeader
                    | SyncPhase::FindingConnectionPoint
            ),
            SyncPhase::PeerAndModeDeciding => matches!(
                target,
                SyncPhase::CheckingBestHeader
                    | SyncPhase::FindingConnectionPoint
                    | SyncPhase::DownloadingBackwardsHeaders
                    | SyncPhase::SnapCapablePeerSelection
            ),
            SyncPhase::CheckingBestHeader => matches!(target, SyncPhase::FindingConnectionPoint),
            SyncPhase::FindingConnectionPoint => {
                matches!(target, SyncPhase::DownloadingSkeleton)
            }
            SyncPhase::DownloadingSkeleton => matches!(target, SyncPhase::DownloadingHeaders),
            SyncPhase::DownloadingHeaders => matches!(target, SyncPhase::DownloadingBodies),
            SyncPhase::DownloadingBodies => false,
            SyncPhase::DownloadingBackwardsHeaders => {
                matches!(target, SyncPhase::DownloadingBackwardsBodies)
            }
            SyncPhase::DownloadingBackwardsBodies => {
                matches!(target, SyncPhase::DownloadingBackwardsHeaders)
            }
            SyncPhase::SnapCapablePeerSelection => matches!(target, SyncPhase::SnapSync),
            SyncPhase::SnapSync => false,
        }
    }
}

/// What a state asks the coordinator to do after handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stay,
    StartDeciding,
    StartSyncing(PeerId),
    StartFindingConnectionPoint(PeerId),
    StartDownloadingSkeleton {
        peer_id: PeerId,
        connection_point: BlockNumber,
    },
    StartDownloadingHeaders {
        peer_id: PeerId,
        connection_point: BlockNumber,
        skeletons: HashMap<PeerId, Vec<BlockIdentifier>>,
    },
    StartDownloadingBodies {
        peer_id: PeerId,
        pending_headers: Vec<VecDeque<BlockHeader>>,
        skeletons: HashMap<PeerId, Vec<BlockIdentifier>>,
    },
    BackwardSyncing(PeerId),
    StartDownloadingBackwardsBodies {
        peer_id: PeerId,
        child: Block,
        headers: Vec<BlockHeader>,
    },
    StartSnapCapablePeerSelection,
    StartSnapSync {
        peer_id: PeerId,
        checkpoint: Option<BlockHeader>,
    },
    StopSyncing,
    /// Peer-attributable failure: report the peer, then stop.
    ErrorSyncing {
        peer_id: PeerId,
        event: EventType,
        message: String,
    },
    /// Local trouble unrelated to peer behaviour: stop without reporting.
    SyncIssue {
        peer_id: Option<PeerId>,
        message: String,
    },
}

impl Transition {
    pub fn error(peer_id: PeerId, event: EventType, message: impl Into<String>) -> Self {
        Transition::ErrorSyncing {
            peer_id,
            event,
            message: message.into(),
        }
    }

    pub fn issue(peer_id: impl Into<Option<PeerId>>, message: impl Into<String>) -> Self {
        Transition::SyncIssue {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }
}

/// Misbehaviour a state observed; applied by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReport {
    pub peer_id: PeerId,
    pub event: EventType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// Side effects of one event, collected for the coordinator.
#[derive(Debug, Default)]
pub struct SyncEffects {
    pub reports: Vec<PeerReport>,
    pub saved_forward: u64,
    pub saved_backward: u64,
}

/// The only handle a state has on the outside world while it handles one event.
pub struct SyncContext<'a> {
    pub config: &'a SyncConfig,
    pub peers: &'a mut PeerManager,
    pub store: &'a dyn BlockStore,
    pub validators: &'a Validators,
    pub snapshot: &'a dyn SnapshotProcessor,
    network: &'a dyn NetworkRequester,
    ledger: &'a mut RequestLedger,
    effects: SyncEffects,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        config: &'a SyncConfig,
        peers: &'a mut PeerManager,
        store: &'a dyn BlockStore,
        validators: &'a Validators,
        snapshot: &'a dyn SnapshotProcessor,
        network: &'a dyn NetworkRequester,
        ledger: &'a mut RequestLedger,
    ) -> Self {
        Self {
            config,
            peers,
            store,
            validators,
            snapshot,
            network,
            ledger,
            effects: SyncEffects::default(),
        }
    }

    /// Issue a request under a fresh id. Never waits for the answer.
    pub fn send(&mut self, peer_id: PeerId, request: SyncRequest) -> Result<RequestId> {
        let id = self.ledger.issue(peer_id, request.clone());
        if let Err(err) = self.network.send_request(peer_id, id, request) {
            self.ledger.cancel(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Stop waiting for a request; a later answer counts as unexpected.
    pub fn retire_request(&mut self, id: RequestId) {
        self.ledger.retire(id);
    }

    pub fn report(&mut self, peer_id: PeerId, event: EventType, message: impl Into<String>) {
        self.effects.reports.push(PeerReport {
            peer_id,
            event,
            message: message.into(),
        });
    }

    pub fn record_saved(&mut self, direction: Direction, count: u64) {
        match direction {
            Direction::Forward => self.effects.saved_forward += count,
            Direction::Backward => self.effects.saved_backward += count,
        }
    }

    pub fn local_total_difficulty(&self) -> BlockDifficulty {
        self.store.best_total_difficulty()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout_waiting_request
    }

    pub fn into_effects(self) -> SyncEffects {
        self.effects
    }
}

/// Per-state event handlers. Unhandled responses are reported as unexpected.
pub trait SyncStateHandler {
    fn phase(&self) -> SyncPhase;

    fn on_enter(&mut self, _ctx: &mut SyncContext<'_>) -> SyncResult {
        Ok(Transition::Stay)
    }

    fn new_peer_status(&mut self, _ctx: &mut SyncContext<'_>, _peer_id: PeerId) -> SyncResult {
        Ok(Transition::Stay)
    }

    fn peer_disconnected(&mut self, _ctx: &mut SyncContext<'_>, _peer_id: PeerId) -> SyncResult {
        Ok(Transition::Stay)
    }

    /// Block hash answer, used as connection point data and snap checkpoints.
    fn new_block_hash(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        _request_id: RequestId,
        _hash: Bytes32,
    ) -> SyncResult {
        unexpected(ctx, peer_id, self.phase(), "block hash")
    }

    fn new_block_headers(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        _request_id: RequestId,
        _headers: Vec<BlockHeader>,
    ) -> SyncResult {
        unexpected(ctx, peer_id, self.phase(), "block headers")
    }

    fn new_body(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        _request_id: RequestId,
        _body: BlockBody,
    ) -> SyncResult {
        unexpected(ctx, peer_id, self.phase(), "block body")
    }

    fn new_skeleton(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        _request_id: RequestId,
        _skeleton: Vec<BlockIdentifier>,
    ) -> SyncResult {
        unexpected(ctx, peer_id, self.phase(), "skeleton")
    }

    fn snap_progress(&mut self, _ctx: &mut SyncContext<'_>, _peer_id: PeerId) -> SyncResult {
        Ok(Transition::Stay)
    }

    fn snap_finished(&mut self, _ctx: &mut SyncContext<'_>, _peer_id: PeerId) -> SyncResult {
        Ok(Transition::Stay)
    }

    fn snap_failed(
        &mut self,
        _ctx: &mut SyncContext<'_>,
        _peer_id: PeerId,
        _event: EventType,
        _reason: String,
    ) -> SyncResult {
        Ok(Transition::Stay)
    }

    fn tick(&mut self, _ctx: &mut SyncContext<'_>, _elapsed: Duration) -> SyncResult {
        Ok(Transition::Stay)
    }
}

fn unexpected(
    ctx: &mut SyncContext<'_>,
    peer_id: PeerId,
    phase: SyncPhase,
    what: &str,
) -> SyncResult {
    ctx.report(
        peer_id,
        EventType::UnexpectedMessage,
        format!("Unexpected {what} received while {}", phase.as_str()),
    );
    Ok(Transition::Stay)
}

/// The active sync state.
#[derive(Debug)]
pub enum SyncState {
    WaitingForPeers(WaitingForPeers),
    PeerAndModeDeciding(PeerAndModeDeciding),
    CheckingBestHeader(CheckingBestHeader),
    FindingConnectionPoint(FindingConnectionPoint),
    DownloadingSkeleton(DownloadingSkeleton),
    DownloadingHeaders(DownloadingHeaders),
    DownloadingBodies(DownloadingBodies),
    DownloadingBackwardsHeaders(DownloadingBackwardsHeaders),
    DownloadingBackwardsBodies(DownloadingBackwardsBodies),
    SnapCapablePeerSelection(SnapCapablePeerSelection),
    SnapSync(SnapSync),
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::WaitingForPeers(WaitingForPeers::default())
    }
}

impl SyncState {
    pub fn phase(&self) -> SyncPhase {
        self.handler().phase()
    }

    pub fn handler(&self) -> &dyn SyncStateHandler {
        match self {
            SyncState::WaitingForPeers(state) => state,
            SyncState::PeerAndModeDeciding(state) => state,
            SyncState::CheckingBestHeader(state) => state,
            SyncState::FindingConnectionPoint(state) => state,
            SyncState::DownloadingSkeleton(state) => state,
            SyncState::DownloadingHeaders(state) => state,
            SyncState::DownloadingBodies(state) => state,
            SyncState::DownloadingBackwardsHeaders(state) => state,
            SyncState::DownloadingBackwardsBodies(state) => state,
            SyncState::SnapCapablePeerSelection(state) => state,
            SyncState::SnapSync(state) => state,
        }
    }

    pub fn handler_mut(&mut self) -> &mut dyn SyncStateHandler {
        match self {
            SyncState::WaitingForPeers(state) => state,
            SyncState::PeerAndModeDeciding(state) => state,
            SyncState::CheckingBestHeader(state) => state,
            SyncState::FindingConnectionPoint(state) => state,
            SyncState::DownloadingSkeleton(state) => state,
            SyncState::DownloadingHeaders(state) => state,
            SyncState::DownloadingBodies(state) => state,
            SyncState::DownloadingBackwardsHeaders(state) => state,
            SyncState::DownloadingBackwardsBodies(state) => state,
            SyncState::SnapCapablePeerSelection(state) => state,
            SyncState::SnapSync(state) => state,
        }
    }

    /// Blocks waiting in the forward import cache, if any.
    pub fn cached_blocks(&self) -> usize {
        match self {
            SyncState::DownloadingBodies(state) => state.cached_blocks(),
            _ => 0,
        }
    }
}
