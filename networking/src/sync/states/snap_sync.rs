use std::time::Duration;

use chain::EventType;
use containers::BlockHeader;
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};

/// Hands the transfer to the snapshot processor and waits for it to report
/// back. Silence for longer than the request timeout ends the attempt.
#[derive(Debug)]
pub struct SnapSync {
    peer_id: PeerId,
    checkpoint: Option<BlockHeader>,
    time_elapsed: Duration,
}

impl SnapSync {
    pub fn new(peer_id: PeerId, checkpoint: Option<BlockHeader>) -> Self {
        Self {
            peer_id,
            checkpoint,
            time_elapsed: Duration::ZERO,
        }
    }

    fn is_from_transfer_peer(&self, peer_id: &PeerId) -> bool {
        if *peer_id != self.peer_id {
            debug!(peer = %peer_id, expected = %self.peer_id, "Ignoring snap event from another peer");
            return false;
        }
        true
    }
}

impl SyncStateHandler for SnapSync {
    fn phase(&self) -> SyncPhase {
        SyncPhase::SnapSync
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        info!(
            peer = %self.peer_id,
            checkpoint = ?self.checkpoint.as_ref().map(|header| header.number),
            "Starting snap sync"
        );
        match ctx.snapshot.start_syncing(self.peer_id, self.checkpoint.clone()) {
            Ok(()) => Ok(Transition::Stay),
            Err(err) => Ok(Transition::issue(
                self.peer_id,
                format!("snapshot transfer could not start: {err}"),
            )),
        }
    }

    fn snap_progress(&mut self, _ctx: &mut SyncContext<'_>, peer_id: PeerId) -> SyncResult {
        if self.is_from_transfer_peer(&peer_id) {
            self.time_elapsed = Duration::ZERO;
        }
        Ok(Transition::Stay)
    }

    fn snap_finished(&mut self, _ctx: &mut SyncContext<'_>, peer_id: PeerId) -> SyncResult {
        if !self.is_from_transfer_peer(&peer_id) {
            return Ok(Transition::Stay);
        }
        info!(peer = %peer_id, "Snap sync finished");
        Ok(Transition::StopSyncing)
    }

    fn snap_failed(
        &mut self,
        _ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        event: EventType,
        reason: String,
    ) -> SyncResult {
        if !self.is_from_transfer_peer(&peer_id) {
            return Ok(Transition::Stay);
        }
        Ok(Transition::error(peer_id, event, reason))
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() {
            return Ok(Transition::Stay);
        }
        Ok(Transition::error(
            self.peer_id,
            EventType::TimeoutMessage,
            "timeout waiting for snap sync progress",
        ))
    }
}
