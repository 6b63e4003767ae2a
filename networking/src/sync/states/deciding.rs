use std::time::Duration;

use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};

/// Picks a peer and a sync mode.
///
/// Snap sync is tried first when enabled and the gap is large enough, then
/// forward sync, then backward sync to fill local history down to genesis.
/// With no usable peer the state stays and retries on the next status or tick.
#[derive(Debug, Default)]
pub struct PeerAndModeDeciding;

impl PeerAndModeDeciding {
    pub fn new() -> Self {
        Self
    }

    fn decide(&self, ctx: &SyncContext<'_>) -> Transition {
        if let Some(transition) = self.try_snap_sync(ctx) {
            return transition;
        }
        if let Some(transition) = self.try_forward_sync(ctx) {
            return transition;
        }
        if let Some(transition) = self.try_backward_sync(ctx) {
            return transition;
        }
        debug!("No suitable peer to sync with");
        Transition::Stay
    }

    fn distance_to(&self, ctx: &SyncContext<'_>, peer_id: &PeerId) -> u64 {
        let local_best = ctx.store.best_block().number();
        ctx.peers
            .get_peer(peer_id)
            .and_then(|peer| peer.best_block_number())
            .map_or(0, |best| best.saturating_sub(local_best))
    }

    fn try_snap_sync(&self, ctx: &SyncContext<'_>) -> Option<Transition> {
        if !ctx.config.snap_client_enabled {
            return None;
        }
        let peer_id = ctx.peers.best_snap_peer(ctx.local_total_difficulty())?;
        let distance = self.distance_to(ctx, &peer_id);
        if distance <= ctx.config.snap_sync_limit {
            return None;
        }
        info!(peer = %peer_id, distance, "Starting snap sync peer selection");
        Some(Transition::StartSnapCapablePeerSelection)
    }

    fn try_forward_sync(&self, ctx: &SyncContext<'_>) -> Option<Transition> {
        let peer_id = ctx.peers.best_peer(ctx.local_total_difficulty())?;
        let distance = self.distance_to(ctx, &peer_id);
        let history_complete = ctx.store.min_stored_number() == 0;
        if distance <= ctx.config.long_sync_limit && !history_complete {
            return None;
        }
        info!(peer = %peer_id, distance, "Starting forward sync");
        Some(Transition::StartSyncing(peer_id))
    }

    fn try_backward_sync(&self, ctx: &SyncContext<'_>) -> Option<Transition> {
        if ctx.store.min_stored_number() == 0 {
            return None;
        }
        let peer_id = ctx.peers.best_or_equal_peer(ctx.local_total_difficulty())?;
        info!(
            peer = %peer_id,
            lowest = ctx.store.min_stored_number(),
            "Starting backward sync"
        );
        Some(Transition::BackwardSyncing(peer_id))
    }
}

impl SyncStateHandler for PeerAndModeDeciding {
    fn phase(&self) -> SyncPhase {
        SyncPhase::PeerAndModeDeciding
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        Ok(self.decide(ctx))
    }

    fn new_peer_status(&mut self, ctx: &mut SyncContext<'_>, _peer_id: PeerId) -> SyncResult {
        Ok(self.decide(ctx))
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, _elapsed: Duration) -> SyncResult {
        Ok(self.decide(ctx))
    }
}
