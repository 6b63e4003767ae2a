use std::time::Duration;

use chain::EventType;
use containers::{Block, BlockHeader, ChunkDescriptor};
use libp2p_identity::PeerId;
use tracing::debug;

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::error::SyncError;

/// One backward round: fetch the chunk of headers right below the lowest
/// stored block.
#[derive(Debug)]
pub struct DownloadingBackwardsHeaders {
    peer_id: PeerId,
    child: Option<Block>,
    request: Option<(RequestId, ChunkDescriptor)>,
    time_elapsed: Duration,
}

impl DownloadingBackwardsHeaders {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            child: None,
            request: None,
            time_elapsed: Duration::ZERO,
        }
    }

    fn is_valid_chunk(
        &self,
        ctx: &SyncContext<'_>,
        child: &Block,
        chunk: &ChunkDescriptor,
        headers: &[BlockHeader],
    ) -> bool {
        let Some(newest) = headers.first() else {
            return false;
        };
        headers.len() as u64 == chunk.count
            && newest.hash() == chunk.hash
            && ctx.validators.validate_descending(headers)
            && ctx.validators.dependent.validate(&child.header, newest)
    }
}

impl SyncStateHandler for DownloadingBackwardsHeaders {
    fn phase(&self) -> SyncPhase {
        SyncPhase::DownloadingBackwardsHeaders
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let child = ctx.store.lowest_block().ok_or(SyncError::NoStoredBlocks)?;
        if child.number() == 0 {
            return Ok(Transition::StopSyncing);
        }

        // Only genesis is left below; connecting it needs no download.
        if child.number() <= 1 {
            return Ok(Transition::StartDownloadingBackwardsBodies {
                peer_id: self.peer_id,
                child,
                headers: Vec::new(),
            });
        }

        let count = ctx.config.chunk_size.min(child.number() - 1);
        let chunk = ChunkDescriptor::new(child.parent_hash(), count);
        match ctx.send(self.peer_id, SyncRequest::BlockHeaders(chunk)) {
            Ok(id) => {
                debug!(peer = %self.peer_id, below = child.number(), count, "Requested backward headers");
                self.request = Some((id, chunk));
                self.child = Some(child);
                Ok(Transition::Stay)
            }
            Err(err) => Ok(Transition::issue(
                self.peer_id,
                format!("failed to request backward headers: {err}"),
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
        let (Some((expected_id, chunk)), Some(child)) = (self.request, self.child.as_ref()) else {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected block headers");
            return Ok(Transition::Stay);
        };
        if expected_id != request_id {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected block headers");
            return Ok(Transition::Stay);
        }
        self.request = None;

        if !self.is_valid_chunk(ctx, child, &chunk, &headers) {
            return Ok(Transition::error(
                peer_id,
                EventType::InvalidHeader,
                format!("invalid backward headers below block {}", child.number()),
            ));
        }

        let Some(child) = self.child.take() else {
            return Ok(Transition::Stay);
        };
        Ok(Transition::StartDownloadingBackwardsBodies {
            peer_id,
            child,
            headers,
        })
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() {
            return Ok(Transition::Stay);
        }
        if let Some((id, _)) = self.request.take() {
            ctx.retire_request(id);
        }
        Ok(Transition::error(
            self.peer_id,
            EventType::TimeoutMessage,
            "timeout waiting for backward headers",
        ))
    }
}
