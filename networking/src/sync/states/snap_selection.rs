use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::U256;
use chain::EventType;
use containers::{BlockDifficulty, BlockHeader, BlockNumber, Bytes32, ChunkDescriptor};
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::config::{HEADERS_VALIDATION_COUNT, SyncConfig};

/// Checkpoint height used for a peer at `best`: rounded down to the
/// granularity, then lowered by the confirmation depth.
pub fn snap_checkpoint_number(best: BlockNumber, config: &SyncConfig) -> Option<BlockNumber> {
    let granularity = config.snap_checkpoint_granularity.max(1);
    (best / granularity * granularity).checked_sub(config.snap_confirmation_depth)
}

#[derive(Debug, Clone)]
struct ValidatedCheckpoint {
    header: BlockHeader,
    difficulty: BlockDifficulty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BlockHashes,
    Headers,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::BlockHashes => "checkpoint hash",
            Stage::Headers => "checkpoint headers",
        }
    }
}

/// Picks the peer to snap sync from.
///
/// A configured boot node is trusted outright. Otherwise every candidate is
/// asked for its checkpoint hash and then for the 64 headers ending there;
/// peers whose headers validate compete on their cumulative difficulty.
#[derive(Debug)]
pub struct SnapCapablePeerSelection {
    stage: Stage,
    pending: HashMap<PeerId, RequestId>,
    checkpoint_hashes: HashMap<PeerId, Bytes32>,
    validated: HashMap<PeerId, ValidatedCheckpoint>,
    time_elapsed: Duration,
}

impl Default for SnapCapablePeerSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapCapablePeerSelection {
    pub fn new() -> Self {
        Self {
            stage: Stage::BlockHashes,
            pending: HashMap::new(),
            checkpoint_hashes: HashMap::new(),
            validated: HashMap::new(),
            time_elapsed: Duration::ZERO,
        }
    }

    fn request_block_hashes(
        &mut self,
        ctx: &mut SyncContext<'_>,
        candidates: Vec<PeerId>,
    ) -> Transition {
        for peer_id in candidates {
            let Some(best) = ctx
                .peers
                .get_peer(&peer_id)
                .and_then(|peer| peer.best_block_number())
            else {
                continue;
            };
            let Some(number) = snap_checkpoint_number(best, ctx.config)
                .filter(|number| *number >= HEADERS_VALIDATION_COUNT)
            else {
                debug!(peer = %peer_id, best, "Checkpoint too low for snap sync");
                continue;
            };
            match ctx.send(peer_id, SyncRequest::BlockHash { number }) {
                Ok(id) => {
                    self.pending.insert(peer_id, id);
                }
                Err(err) => debug!(peer = %peer_id, %err, "Skipping snap candidate"),
            }
        }

        if self.pending.is_empty() {
            return no_snap_peer("no usable checkpoint for any snap candidate");
        }
        self.time_elapsed = Duration::ZERO;
        Transition::Stay
    }

    fn request_headers(&mut self, ctx: &mut SyncContext<'_>) -> Transition {
        self.stage = Stage::Headers;
        let mut hashes: Vec<(PeerId, Bytes32)> = self.checkpoint_hashes.drain().collect();
        hashes.sort();
        for (peer_id, hash) in hashes {
            let chunk = ChunkDescriptor::new(hash, HEADERS_VALIDATION_COUNT);
            match ctx.send(peer_id, SyncRequest::BlockHeaders(chunk)) {
                Ok(id) => {
                    self.pending.insert(peer_id, id);
                    self.checkpoint_hashes.insert(peer_id, hash);
                }
                Err(err) => debug!(peer = %peer_id, %err, "Skipping snap candidate"),
            }
        }
        self.time_elapsed = Duration::ZERO;
        if self.pending.is_empty() {
            return self.select_best(ctx);
        }
        Transition::Stay
    }

    fn validate(&self, ctx: &SyncContext<'_>, peer_id: &PeerId, headers: &[BlockHeader]) -> bool {
        headers.len() as u64 == HEADERS_VALIDATION_COUNT
            && headers.first().map(BlockHeader::hash) == self.checkpoint_hashes.get(peer_id).copied()
            && ctx.validators.validate_descending(headers)
    }

    fn select_best(&mut self, ctx: &SyncContext<'_>) -> Transition {
        let mut agreeing: HashMap<Bytes32, u64> = HashMap::new();
        for checkpoint in self.validated.values() {
            *agreeing.entry(checkpoint.header.hash()).or_default() += 1;
        }

        let best = self
            .validated
            .iter()
            .filter_map(|(peer_id, checkpoint)| {
                let total_difficulty = ctx.peers.get_peer(peer_id)?.total_difficulty()?;
                let weight = agreeing
                    .get(&checkpoint.header.hash())
                    .copied()
                    .unwrap_or(1);
                let score = checkpoint.difficulty.0.saturating_mul(U256::from(weight));
                Some(((score, total_difficulty), *peer_id))
            })
            .max();

        let Some((_, peer_id)) = best else {
            return no_snap_peer("no snap candidate passed checkpoint validation");
        };
        let checkpoint = self.validated.remove(&peer_id).map(|checkpoint| checkpoint.header);
        info!(
            peer = %peer_id,
            checkpoint = ?checkpoint.as_ref().map(|header| header.number),
            "Selected snap sync peer"
        );
        Transition::StartSnapSync {
            peer_id,
            checkpoint,
        }
    }
}

fn no_snap_peer(message: &str) -> Transition {
    Transition::SyncIssue {
        peer_id: None,
        message: message.to_string(),
    }
}

impl SyncStateHandler for SnapCapablePeerSelection {
    fn phase(&self) -> SyncPhase {
        SyncPhase::SnapCapablePeerSelection
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let local_td = ctx.local_total_difficulty();
        let candidates: Vec<(PeerId, BlockNumber)> = ctx
            .peers
            .snap_candidates(local_td)
            .into_iter()
            .filter_map(|peer| Some((peer.peer_id, peer.best_block_number()?)))
            .collect();
        if candidates.is_empty() {
            return Ok(no_snap_peer("no snap capable peers found"));
        }

        let boot_node = candidates
            .iter()
            .filter(|(peer_id, _)| ctx.peers.is_snap_boot_node(peer_id))
            .max_by_key(|(peer_id, best)| (*best, *peer_id));
        if let Some((peer_id, _)) = boot_node {
            info!(peer = %peer_id, "Found snap boot node");
            return Ok(Transition::StartSnapSync {
                peer_id: *peer_id,
                checkpoint: None,
            });
        }

        let mut peers: Vec<PeerId> = candidates.into_iter().map(|(peer_id, _)| peer_id).collect();
        peers.sort();
        info!(candidates = peers.len(), "Requesting snap checkpoint hashes");
        Ok(self.request_block_hashes(ctx, peers))
    }

    fn new_block_hash(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        hash: Bytes32,
    ) -> SyncResult {
        if self.stage != Stage::BlockHashes || self.pending.get(&peer_id) != Some(&request_id) {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected checkpoint hash");
            return Ok(Transition::Stay);
        }
        self.pending.remove(&peer_id);
        self.time_elapsed = Duration::ZERO;
        self.checkpoint_hashes.insert(peer_id, hash);

        if self.pending.is_empty() {
            return Ok(self.request_headers(ctx));
        }
        Ok(Transition::Stay)
    }

    fn new_block_headers(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        headers: Vec<BlockHeader>,
    ) -> SyncResult {
        if self.stage != Stage::Headers || self.pending.get(&peer_id) != Some(&request_id) {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected checkpoint headers");
            return Ok(Transition::Stay);
        }
        self.pending.remove(&peer_id);
        self.time_elapsed = Duration::ZERO;

        if self.validate(ctx, &peer_id, &headers) {
            let difficulty = headers.iter().map(|header| header.difficulty).sum();
            if let Some(header) = headers.into_iter().next() {
                debug!(peer = %peer_id, number = header.number, "Checkpoint validated");
                self.validated
                    .insert(peer_id, ValidatedCheckpoint { header, difficulty });
            }
        } else {
            ctx.report(
                peer_id,
                EventType::InvalidMessage,
                format!("Invalid checkpoint headers ({} received)", headers.len()),
            );
        }

        if self.pending.is_empty() {
            return Ok(self.select_best(ctx));
        }
        Ok(Transition::Stay)
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() || self.pending.is_empty() {
            return Ok(Transition::Stay);
        }

        let mut timed_out: Vec<(PeerId, RequestId)> = self.pending.drain().collect();
        timed_out.sort();
        for (peer_id, id) in timed_out {
            ctx.retire_request(id);
            ctx.report(
                peer_id,
                EventType::TimeoutMessage,
                format!("Timeout waiting for {}", self.stage.as_str()),
            );
        }

        match self.stage {
            Stage::BlockHashes if self.checkpoint_hashes.is_empty() => {
                Ok(no_snap_peer("no checkpoint hashes received from any peer"))
            }
            Stage::BlockHashes => Ok(self.request_headers(ctx)),
            Stage::Headers => Ok(self.select_best(ctx)),
        }
    }
}
