use std::time::Duration;

use chain::EventType;
use containers::{BlockHeader, ChunkDescriptor};
use libp2p_identity::PeerId;
use tracing::debug;

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};

/// Asks the selected peer for the header of the tip it claims before any
/// further work is spent on it.
#[derive(Debug)]
pub struct CheckingBestHeader {
    peer_id: PeerId,
    request_id: Option<RequestId>,
    time_elapsed: Duration,
}

impl CheckingBestHeader {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            request_id: None,
            time_elapsed: Duration::ZERO,
        }
    }
}

impl SyncStateHandler for CheckingBestHeader {
    fn phase(&self) -> SyncPhase {
        SyncPhase::CheckingBestHeader
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let Some(status) = ctx
            .peers
            .get_peer(&self.peer_id)
            .and_then(|peer| peer.status.clone())
        else {
            return Ok(Transition::issue(self.peer_id, "selected peer has no status"));
        };

        let request = SyncRequest::BlockHeaders(ChunkDescriptor::new(status.best_block_hash, 1));
        match ctx.send(self.peer_id, request) {
            Ok(id) => {
                self.request_id = Some(id);
                Ok(Transition::Stay)
            }
            Err(err) => Ok(Transition::issue(
                self.peer_id,
                format!("failed to request best header: {err}"),
            )),
        }
    }

    fn new_block_headers(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        headers: Vec<BlockHeader>,
    ) -> SyncResult {
        if self.request_id != Some(request_id) {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected best header");
            return Ok(Transition::Stay);
        }
        self.request_id = None;

        let expected = ctx
            .peers
            .get_peer(&self.peer_id)
            .and_then(|peer| peer.status.as_ref())
            .map(|status| status.best_block_hash);
        let [header] = headers.as_slice() else {
            return Ok(Transition::error(
                peer_id,
                EventType::InvalidMessage,
                format!("expected one best header, got {}", headers.len()),
            ));
        };
        if Some(header.hash()) != expected || !ctx.validators.header.is_valid(header) {
            return Ok(Transition::error(
                peer_id,
                EventType::InvalidHeader,
                format!("invalid best header {}", header.hash()),
            ));
        }

        debug!(peer = %peer_id, number = header.number, "Best header verified");
        Ok(Transition::StartFindingConnectionPoint(peer_id))
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
            "timeout waiting for best header",
        ))
    }
}
