use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chain::EventType;
use containers::{BlockHeader, BlockIdentifier, BlockNumber, ChunkDescriptor};
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::chunks::ChunksDownloadHelper;
use crate::sync::error::SyncError;

/// Downloads header chunks along the selected peer's skeleton, one at a time.
///
/// Each chunk must end at its skeleton link and hang off the newest header of
/// the chunk before it, the first one off the local block at the connection
/// point.
#[derive(Debug)]
pub struct DownloadingHeaders {
    peer_id: PeerId,
    connection_point: BlockNumber,
    skeletons: HashMap<PeerId, Vec<BlockIdentifier>>,
    helper: ChunksDownloadHelper,
    current: Option<(RequestId, ChunkDescriptor)>,
    parent: Option<BlockHeader>,
    pending_headers: Vec<VecDeque<BlockHeader>>,
    time_elapsed: Duration,
}

impl DownloadingHeaders {
    pub fn new(
        peer_id: PeerId,
        connection_point: BlockNumber,
        skeletons: HashMap<PeerId, Vec<BlockIdentifier>>,
    ) -> Self {
        let skeleton = skeletons.get(&peer_id).cloned().unwrap_or_default();
        Self {
            peer_id,
            connection_point,
            skeletons,
            helper: ChunksDownloadHelper::new(skeleton, connection_point),
            current: None,
            parent: None,
            pending_headers: Vec::new(),
            time_elapsed: Duration::ZERO,
        }
    }

    fn request_next_chunk(&mut self, ctx: &mut SyncContext<'_>) -> Transition {
        let Some(chunk) = self.helper.next_chunk() else {
            info!(
                peer = %self.peer_id,
                chunks = self.pending_headers.len(),
                "Headers downloaded"
            );
            return Transition::StartDownloadingBodies {
                peer_id: self.peer_id,
                pending_headers: std::mem::take(&mut self.pending_headers),
                skeletons: std::mem::take(&mut self.skeletons),
            };
        };

        match ctx.send(self.peer_id, SyncRequest::BlockHeaders(chunk)) {
            Ok(id) => {
                debug!(peer = %self.peer_id, hash = %chunk.hash, count = chunk.count, "Requested header chunk");
                self.current = Some((id, chunk));
                self.time_elapsed = Duration::ZERO;
                Transition::Stay
            }
            Err(err) => Transition::issue(
                self.peer_id,
                format!("failed to request header chunk: {err}"),
            ),
        }
    }

    fn is_valid_chunk(
        &self,
        ctx: &SyncContext<'_>,
        chunk: &ChunkDescriptor,
        headers: &[BlockHeader],
    ) -> bool {
        let (Some(newest), Some(oldest), Some(parent)) =
            (headers.first(), headers.last(), self.parent.as_ref())
        else {
            return false;
        };
        headers.len() as u64 == chunk.count
            && newest.hash() == chunk.hash
            && ctx.validators.validate_descending(headers)
            && ctx.validators.dependent.validate(oldest, parent)
    }
}

impl SyncStateHandler for DownloadingHeaders {
    fn phase(&self) -> SyncPhase {
        SyncPhase::DownloadingHeaders
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        if !self.helper.has_next_chunk() {
            return Ok(Transition::issue(self.peer_id, "selected skeleton has no chunks"));
        }
        let parent = ctx
            .store
            .block_by_number(self.connection_point)
            .ok_or(SyncError::NoStoredBlocks)?;
        self.parent = Some(parent.header);
        Ok(self.request_next_chunk(ctx))
    }

    fn new_block_headers(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        headers: Vec<BlockHeader>,
    ) -> SyncResult {
        let Some((expected_id, chunk)) = self.current else {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected block headers");
            return Ok(Transition::Stay);
        };
        if expected_id != request_id {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected block headers");
            return Ok(Transition::Stay);
        }
        self.current = None;

        if !self.is_valid_chunk(ctx, &chunk, &headers) {
            return Ok(Transition::error(
                peer_id,
                EventType::InvalidHeader,
                format!("invalid header chunk ending at {}", chunk.hash),
            ));
        }

        self.parent = headers.first().cloned();
        self.pending_headers.push(headers.into_iter().rev().collect());
        Ok(self.request_next_chunk(ctx))
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() {
            return Ok(Transition::Stay);
        }
        if let Some((id, _)) = self.current.take() {
            ctx.retire_request(id);
        }
        Ok(Transition::error(
            self.peer_id,
            EventType::TimeoutMessage,
            "timeout waiting for block headers",
        ))
    }
}
