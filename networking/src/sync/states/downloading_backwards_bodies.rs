use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use chain::EventType;
use containers::{Block, BlockBody, BlockDifficulty, BlockHeader};
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{Direction, SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::error::SyncError;

/// Orders received blocks so the highest one is connected first.
#[derive(Debug)]
struct ByNumber(Block);

impl PartialEq for ByNumber {
    fn eq(&self, other: &Self) -> bool {
        self.0.number() == other.0.number()
    }
}

impl Eq for ByNumber {}

impl PartialOrd for ByNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.number().cmp(&other.0.number())
    }
}

/// Downloads bodies for a backward header chunk and saves the blocks below
/// the lowest stored one.
///
/// A parent's total difficulty is derived from its child's, so blocks are
/// saved child before parent. When block 1 is reached genesis is connected
/// and backward sync is over; otherwise the next round starts.
#[derive(Debug)]
pub struct DownloadingBackwardsBodies {
    peer_id: PeerId,
    child: Block,
    to_request: VecDeque<BlockHeader>,
    in_flight: HashMap<RequestId, BlockHeader>,
    responses: BinaryHeap<ByNumber>,
    time_elapsed: Duration,
}

impl DownloadingBackwardsBodies {
    pub fn new(peer_id: PeerId, child: Block, headers: Vec<BlockHeader>) -> Self {
        Self {
            peer_id,
            child,
            to_request: headers.into(),
            in_flight: HashMap::new(),
            responses: BinaryHeap::new(),
            time_elapsed: Duration::ZERO,
        }
    }

    fn request_bodies(&mut self, ctx: &mut SyncContext<'_>) -> Option<Transition> {
        while self.in_flight.len() < ctx.config.max_requested_bodies {
            let Some(header) = self.to_request.pop_front() else {
                break;
            };
            let hash = header.hash();
            match ctx.send(self.peer_id, SyncRequest::BlockBody { hash }) {
                Ok(id) => {
                    self.in_flight.insert(id, header);
                }
                Err(err) => {
                    return Some(Transition::issue(
                        self.peer_id,
                        format!("failed to request backward body: {err}"),
                    ));
                }
            }
        }
        None
    }

    /// Saves every received block that is the parent of the current child.
    fn connect_received(&mut self, ctx: &mut SyncContext<'_>) -> Result<u64, SyncError> {
        let mut saved = 0;
        while self
            .responses
            .peek()
            .is_some_and(|top| top.0.is_parent_of(&self.child))
        {
            let Some(ByNumber(parent)) = self.responses.pop() else {
                break;
            };
            let parent_td = self.parent_total_difficulty(ctx)?;
            if let Some(recorded) = ctx.store.total_difficulty(&parent.hash()) {
                if recorded != parent_td {
                    return Err(SyncError::DifficultyMismatch {
                        hash: parent.hash(),
                        recorded,
                        recomputed: parent_td,
                    });
                }
            }
            ctx.store.save_block(parent.clone(), parent_td, true)?;
            saved += 1;
            self.child = parent;
        }
        Ok(saved)
    }

    /// Total difficulty the child's parent must have.
    fn parent_total_difficulty(
        &self,
        ctx: &SyncContext<'_>,
    ) -> Result<BlockDifficulty, SyncError> {
        let child_hash = self.child.hash();
        let child_td = ctx
            .store
            .total_difficulty(&child_hash)
            .ok_or(SyncError::MissingTotalDifficulty { hash: child_hash })?;
        let own = self.child.cumulative_difficulty();
        child_td
            .checked_sub(own)
            .ok_or(SyncError::DifficultyMismatch {
                hash: child_hash,
                recorded: child_td,
                recomputed: own,
            })
    }

    fn connect_genesis(&self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let genesis = ctx.store.genesis();
        if !genesis.is_parent_of(&self.child) {
            return Err(SyncError::GenesisDoesNotConnect {
                number: self.child.number(),
                hash: self.child.hash(),
            });
        }
        let expected = self.parent_total_difficulty(ctx)?;
        let recorded = genesis.cumulative_difficulty();
        if expected != recorded {
            return Err(SyncError::DifficultyMismatch {
                hash: genesis.hash(),
                recorded,
                recomputed: expected,
            });
        }

        ctx.store.save_block(genesis, recorded, true)?;
        ctx.store.flush()?;
        ctx.record_saved(Direction::Backward, 1);
        info!(peer = %self.peer_id, "Backward sync connected genesis");
        Ok(Transition::StopSyncing)
    }

    fn progress(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let saved = self.connect_received(ctx)?;
        ctx.record_saved(Direction::Backward, saved);

        if self.child.number() == 1 {
            return self.connect_genesis(ctx);
        }
        if let Some(transition) = self.request_bodies(ctx) {
            return Ok(transition);
        }
        if self.to_request.is_empty() && self.in_flight.is_empty() {
            ctx.store.flush()?;
            debug!(
                peer = %self.peer_id,
                lowest = self.child.number(),
                "Backward round complete"
            );
            return Ok(Transition::BackwardSyncing(self.peer_id));
        }
        Ok(Transition::Stay)
    }
}

impl SyncStateHandler for DownloadingBackwardsBodies {
    fn phase(&self) -> SyncPhase {
        SyncPhase::DownloadingBackwardsBodies
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        self.progress(ctx)
    }

    fn new_body(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        body: BlockBody,
    ) -> SyncResult {
        let Some(header) = self.in_flight.remove(&request_id) else {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected block body");
            return Ok(Transition::Stay);
        };

        let number = header.number;
        match Block::new(header, body) {
            Ok(block) if ctx.validators.block.is_valid(&block) => {
                self.responses.push(ByNumber(block));
                self.time_elapsed = Duration::ZERO;
                self.progress(ctx)
            }
            Ok(_) | Err(_) => Ok(Transition::error(
                peer_id,
                EventType::InvalidMessage,
                format!("invalid body for block {number}"),
            )),
        }
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() {
            return Ok(Transition::Stay);
        }
        for (id, _) in self.in_flight.drain() {
            ctx.retire_request(id);
        }
        Ok(Transition::error(
            self.peer_id,
            EventType::TimeoutMessage,
            "timeout waiting for backward bodies",
        ))
    }
}
