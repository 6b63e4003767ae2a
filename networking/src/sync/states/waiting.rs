use std::time::Duration;

use libp2p_identity::PeerId;
use tracing::debug;

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};

/// Idle state: collects peer statuses until there are enough to pick from.
///
/// Deciding starts as soon as `expected_peers` fresh statuses are known, or
/// once `timeout_waiting_peers` has passed with at least one.
#[derive(Debug, Default)]
pub struct WaitingForPeers {
    time_elapsed: Duration,
}

impl WaitingForPeers {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_start(&self, ctx: &SyncContext<'_>) -> Transition {
        let known = ctx.peers.count();
        if known == 0 {
            return Transition::Stay;
        }
        if known >= ctx.config.expected_peers
            || self.time_elapsed >= ctx.config.timeout_waiting_peers
        {
            debug!(known, waited = ?self.time_elapsed, "Enough peers to decide");
            return Transition::StartDeciding;
        }
        Transition::Stay
    }
}

impl SyncStateHandler for WaitingForPeers {
    fn phase(&self) -> SyncPhase {
        SyncPhase::WaitingForPeers
    }

    fn new_peer_status(&mut self, ctx: &mut SyncContext<'_>, _peer_id: PeerId) -> SyncResult {
        Ok(self.try_start(ctx))
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        Ok(self.try_start(ctx))
    }
}
