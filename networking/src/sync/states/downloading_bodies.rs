use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chain::{EventType, ImportOutcome};
use containers::{Block, BlockBody, BlockHeader, BlockIdentifier};
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{Direction, SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::block_cache::BlockCache;
use crate::sync::chunks::Segments;
use crate::sync::error::SyncError;

#[derive(Debug)]
struct PendingBody {
    request_id: RequestId,
    header: BlockHeader,
    time_elapsed: Duration,
}

/// Downloads bodies for the validated headers from every peer whose skeleton
/// agrees with them, one request in flight per peer.
///
/// A peer that answers badly or too late loses its place; its header and chunk
/// go back to the queue for the remaining peers.
#[derive(Debug)]
pub struct DownloadingBodies {
    peer_id: PeerId,
    pending_headers: Vec<VecDeque<BlockHeader>>,
    segments: Segments,
    suitable_peers: BTreeSet<PeerId>,
    chunk_by_peer: HashMap<PeerId, (usize, usize)>,
    in_flight: HashMap<PeerId, PendingBody>,
    cache: BlockCache,
    imported: u64,
}

impl DownloadingBodies {
    pub fn new(
        peer_id: PeerId,
        pending_headers: Vec<VecDeque<BlockHeader>>,
        skeletons: HashMap<PeerId, Vec<BlockIdentifier>>,
    ) -> Self {
        let segments = Segments::build(&pending_headers, &skeletons);
        let suitable_peers = segments.peers().into_iter().collect();
        Self {
            peer_id,
            pending_headers,
            segments,
            suitable_peers,
            chunk_by_peer: HashMap::new(),
            in_flight: HashMap::new(),
            cache: BlockCache::new(),
            imported: 0,
        }
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    pub fn suitable_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.suitable_peers.iter()
    }

    /// Next header this peer should fetch, moving on to a new chunk when the
    /// current one runs dry. Headers already known are skipped.
    fn next_header(&mut self, ctx: &SyncContext<'_>, peer_id: &PeerId) -> Option<BlockHeader> {
        loop {
            if let Some(&(_, chunk)) = self.chunk_by_peer.get(peer_id) {
                while let Some(header) = self.pending_headers[chunk].pop_front() {
                    let hash = header.hash();
                    if !ctx.store.is_block_known(&hash) && !self.cache.contains(&hash) {
                        return Some(header);
                    }
                }
                self.chunk_by_peer.remove(peer_id);
            }
            let (segment, chunk) = self.segments.take_chunk_for(peer_id)?;
            self.chunk_by_peer.insert(*peer_id, (segment, chunk));
        }
    }

    fn request_body(&mut self, ctx: &mut SyncContext<'_>, peer_id: PeerId) {
        let Some(header) = self.next_header(ctx, &peer_id) else {
            return;
        };
        let hash = header.hash();
        match ctx.send(peer_id, SyncRequest::BlockBody { hash }) {
            Ok(request_id) => {
                self.in_flight.insert(
                    peer_id,
                    PendingBody {
                        request_id,
                        header,
                        time_elapsed: Duration::ZERO,
                    },
                );
            }
            Err(err) => {
                debug!(peer = %peer_id, %err, "Dropping body peer");
                self.requeue(&peer_id, Some(header));
                self.suitable_peers.remove(&peer_id);
            }
        }
    }

    fn start_downloading(&mut self, ctx: &mut SyncContext<'_>) {
        let idle: Vec<PeerId> = self
            .suitable_peers
            .iter()
            .filter(|peer| !self.in_flight.contains_key(peer))
            .copied()
            .collect();
        for peer_id in idle {
            self.request_body(ctx, peer_id);
        }
    }

    fn requeue(&mut self, peer_id: &PeerId, header: Option<BlockHeader>) {
        if let Some((segment, chunk)) = self.chunk_by_peer.remove(peer_id) {
            if let Some(header) = header {
                self.pending_headers[chunk].push_front(header);
            }
            self.segments.requeue(segment, chunk);
        }
    }

    /// Removes a peer from the download, returning its work to the queue.
    fn drop_peer(&mut self, ctx: &mut SyncContext<'_>, peer_id: &PeerId) {
        self.suitable_peers.remove(peer_id);
        let pending = self.in_flight.remove(peer_id);
        if let Some(pending) = pending.as_ref() {
            ctx.retire_request(pending.request_id);
        }
        self.requeue(peer_id, pending.map(|pending| pending.header));
    }

    fn fail_peer(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        event: EventType,
        message: String,
    ) -> Transition {
        ctx.report(peer_id, event, message);
        self.drop_peer(ctx, &peer_id);
        if self.suitable_peers.is_empty() {
            return Transition::issue(self.peer_id, "no peers left to download bodies from");
        }
        self.start_downloading(ctx);
        Transition::Stay
    }

    fn import(&mut self, ctx: &mut SyncContext<'_>, block: Block) -> Result<(), SyncError> {
        self.cache.add_block(block);
        let store = ctx.store;
        let connected = self.cache.drain_connected(|hash| store.is_block_known(hash));

        let mut saved = 0;
        for block in connected {
            if let ImportOutcome::Imported { .. } = store.connect_block(block)? {
                saved += 1;
            }
        }
        self.imported += saved;
        ctx.record_saved(Direction::Forward, saved);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.in_flight.is_empty() && self.pending_headers.iter().all(VecDeque::is_empty)
    }

    fn finish(&self, ctx: &SyncContext<'_>) -> SyncResult {
        ctx.store.flush()?;
        info!(
            peer = %self.peer_id,
            imported = self.imported,
            best = ctx.store.best_block().number(),
            "Completed forward sync"
        );
        Ok(Transition::StopSyncing)
    }
}

impl SyncStateHandler for DownloadingBodies {
    fn phase(&self) -> SyncPhase {
        SyncPhase::DownloadingBodies
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        if self.suitable_peers.is_empty() {
            return Ok(Transition::issue(
                self.peer_id,
                "no peer agrees with the downloaded headers",
            ));
        }
        debug!(
            peers = self.suitable_peers.len(),
            segments = self.segments.segment_count(),
            chunks = self.pending_headers.len(),
            "Starting body download"
        );
        self.start_downloading(ctx);
        if self.is_finished() {
            return self.finish(ctx);
        }
        Ok(Transition::Stay)
    }

    fn new_body(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        body: BlockBody,
    ) -> SyncResult {
        let expected = self
            .in_flight
            .get(&peer_id)
            .is_some_and(|pending| pending.request_id == request_id);
        if !expected {
            return Ok(self.fail_peer(
                ctx,
                peer_id,
                EventType::UnexpectedMessage,
                "Unexpected block body".to_string(),
            ));
        }
        let Some(pending) = self.in_flight.remove(&peer_id) else {
            return Ok(Transition::Stay);
        };

        let number = pending.header.number;
        let block = match Block::new(pending.header.clone(), body) {
            Ok(block) if ctx.validators.block.is_valid(&block) => block,
            Ok(_) | Err(_) => {
                self.in_flight.insert(peer_id, pending);
                return Ok(self.fail_peer(
                    ctx,
                    peer_id,
                    EventType::InvalidMessage,
                    format!("Invalid body for block {number}"),
                ));
            }
        };

        self.import(ctx, block)?;
        self.request_body(ctx, peer_id);
        if self.is_finished() {
            return self.finish(ctx);
        }
        Ok(Transition::Stay)
    }

    fn peer_disconnected(&mut self, ctx: &mut SyncContext<'_>, peer_id: PeerId) -> SyncResult {
        if !self.suitable_peers.contains(&peer_id) {
            return Ok(Transition::Stay);
        }
        self.drop_peer(ctx, &peer_id);
        if self.suitable_peers.is_empty() {
            return Ok(Transition::issue(
                self.peer_id,
                "no peers left to download bodies from",
            ));
        }
        self.start_downloading(ctx);
        Ok(Transition::Stay)
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        let timeout = ctx.timeout();
        let mut expired = Vec::new();
        for (peer_id, pending) in self.in_flight.iter_mut() {
            pending.time_elapsed += elapsed;
            if pending.time_elapsed >= timeout {
                expired.push(*peer_id);
            }
        }
        expired.sort();

        for peer_id in expired {
            ctx.report(peer_id, EventType::TimeoutMessage, "Timeout waiting for block body");
            self.drop_peer(ctx, &peer_id);
        }

        if self.suitable_peers.is_empty() {
            return Ok(Transition::issue(
                self.peer_id,
                "no peers left to download bodies from",
            ));
        }
        self.start_downloading(ctx);
        if self.in_flight.is_empty() {
            if self.is_finished() {
                return self.finish(ctx);
            }
            return Ok(Transition::issue(
                self.peer_id,
                "remaining chunks cannot be served by any peer",
            ));
        }
        Ok(Transition::Stay)
    }
}
