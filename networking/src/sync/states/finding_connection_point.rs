use std::time::Duration;

use chain::EventType;
use containers::Bytes32;
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::connection_point::ConnectionPointFinder;

/// Binary search over block heights for the last block shared with the peer.
#[derive(Debug)]
pub struct FindingConnectionPoint {
    peer_id: PeerId,
    finder: Option<ConnectionPointFinder>,
    request_id: Option<RequestId>,
    time_elapsed: Duration,
}

impl FindingConnectionPoint {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            finder: None,
            request_id: None,
            time_elapsed: Duration::ZERO,
        }
    }

    fn next_step(&mut self, ctx: &mut SyncContext<'_>) -> Transition {
        let Some(finder) = self.finder.as_ref() else {
            return Transition::issue(self.peer_id, "connection point search not started");
        };
        if let Some(connection_point) = finder.connection_point() {
            info!(peer = %self.peer_id, connection_point, "Connection point found");
            return Transition::StartDownloadingSkeleton {
                peer_id: self.peer_id,
                connection_point,
            };
        }

        let number = finder.probe();
        match ctx.send(self.peer_id, SyncRequest::BlockHash { number }) {
            Ok(id) => {
                self.request_id = Some(id);
                self.time_elapsed = Duration::ZERO;
                Transition::Stay
            }
            Err(err) => Transition::issue(
                self.peer_id,
                format!("failed to request block hash at {number}: {err}"),
            ),
        }
    }
}

impl SyncStateHandler for FindingConnectionPoint {
    fn phase(&self) -> SyncPhase {
        SyncPhase::FindingConnectionPoint
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let Some(peer_best) = ctx
            .peers
            .get_peer(&self.peer_id)
            .and_then(|peer| peer.best_block_number())
        else {
            return Ok(Transition::issue(self.peer_id, "selected peer has no status"));
        };
        let low = ctx.store.min_stored_number();
        debug!(peer = %self.peer_id, low, high = peer_best, "Searching connection point");
        self.finder = Some(ConnectionPointFinder::new(low, peer_best));
        Ok(self.next_step(ctx))
    }

    fn new_block_hash(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        hash: Bytes32,
    ) -> SyncResult {
        if self.request_id != Some(request_id) {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected block hash");
            return Ok(Transition::Stay);
        }
        self.request_id = None;

        let known = ctx.store.is_block_known(&hash);
        if let Some(finder) = self.finder.as_mut() {
            if known {
                finder.update_found();
            } else {
                finder.update_not_found();
            }
        }
        Ok(self.next_step(ctx))
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() {
            return Ok(Transition::Stay);
        }
        if let Some(id) = self.request_id.take() {
            ctx.retire_request(id);
        }
        Ok(Transition::error(
            self.peer_id,
            EventType::TimeoutMessage,
            "timeout waiting for connection point data",
        ))
    }
}
