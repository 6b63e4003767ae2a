use std::collections::HashMap;
use std::time::Duration;

use chain::EventType;
use containers::{BlockIdentifier, BlockNumber};
use libp2p_identity::PeerId;
use tracing::{debug, info};

use super::{SyncContext, SyncPhase, SyncResult, SyncStateHandler, Transition};
use crate::req_resp::{RequestId, SyncRequest};
use crate::sync::chunks::{is_valid_skeleton, trim_skeleton};

/// Requests a skeleton from every candidate peer.
///
/// The selected peer's skeleton drives header download; the others are only
/// used to spread body requests, so a bad or missing one costs just that peer.
#[derive(Debug)]
pub struct DownloadingSkeleton {
    peer_id: PeerId,
    connection_point: BlockNumber,
    pending: HashMap<PeerId, RequestId>,
    skeletons: HashMap<PeerId, Vec<BlockIdentifier>>,
    time_elapsed: Duration,
}

impl DownloadingSkeleton {
    pub fn new(peer_id: PeerId, connection_point: BlockNumber) -> Self {
        Self {
            peer_id,
            connection_point,
            pending: HashMap::new(),
            skeletons: HashMap::new(),
            time_elapsed: Duration::ZERO,
        }
    }

    /// Trims the skeleton to the connection point and the configured length.
    fn accept(
        &self,
        ctx: &SyncContext<'_>,
        skeleton: Vec<BlockIdentifier>,
    ) -> Option<Vec<BlockIdentifier>> {
        let mut skeleton = trim_skeleton(skeleton, self.connection_point);
        let max_links = usize::try_from(ctx.config.max_skeleton_chunks)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        skeleton.truncate(max_links);

        let spaced = skeleton
            .windows(2)
            .all(|pair| pair[1].number.saturating_sub(pair[0].number) <= ctx.config.chunk_size);
        (spaced && is_valid_skeleton(&skeleton, self.connection_point)).then_some(skeleton)
    }

    fn try_finish(&mut self) -> Transition {
        if !self.pending.is_empty() {
            return Transition::Stay;
        }
        if !self.skeletons.contains_key(&self.peer_id) {
            return Transition::issue(self.peer_id, "no skeleton from selected peer");
        }
        info!(
            peer = %self.peer_id,
            peers = self.skeletons.len(),
            connection_point = self.connection_point,
            "Skeletons downloaded"
        );
        Transition::StartDownloadingHeaders {
            peer_id: self.peer_id,
            connection_point: self.connection_point,
            skeletons: std::mem::take(&mut self.skeletons),
        }
    }
}

impl SyncStateHandler for DownloadingSkeleton {
    fn phase(&self) -> SyncPhase {
        SyncPhase::DownloadingSkeleton
    }

    fn on_enter(&mut self, ctx: &mut SyncContext<'_>) -> SyncResult {
        let mut peers = ctx.peers.best_peer_candidates(ctx.local_total_difficulty());
        if !peers.contains(&self.peer_id) {
            peers.push(self.peer_id);
        }

        let request = SyncRequest::Skeleton {
            start_number: self.connection_point,
        };
        for peer_id in peers {
            match ctx.send(peer_id, request.clone()) {
                Ok(id) => {
                    self.pending.insert(peer_id, id);
                }
                Err(err) if peer_id == self.peer_id => {
                    return Ok(Transition::issue(
                        peer_id,
                        format!("failed to request skeleton: {err}"),
                    ));
                }
                Err(err) => debug!(peer = %peer_id, %err, "Skipping skeleton peer"),
            }
        }
        Ok(Transition::Stay)
    }

    fn new_skeleton(
        &mut self,
        ctx: &mut SyncContext<'_>,
        peer_id: PeerId,
        request_id: RequestId,
        skeleton: Vec<BlockIdentifier>,
    ) -> SyncResult {
        if self.pending.get(&peer_id) != Some(&request_id) {
            ctx.report(peer_id, EventType::UnexpectedMessage, "Unexpected skeleton");
            return Ok(Transition::Stay);
        }
        self.pending.remove(&peer_id);
        self.time_elapsed = Duration::ZERO;

        match self.accept(ctx, skeleton) {
            Some(skeleton) => {
                debug!(peer = %peer_id, links = skeleton.len(), "Skeleton accepted");
                self.skeletons.insert(peer_id, skeleton);
            }
            None if peer_id == self.peer_id => {
                return Ok(Transition::error(
                    peer_id,
                    EventType::InvalidMessage,
                    "invalid skeleton from selected peer",
                ));
            }
            None => ctx.report(peer_id, EventType::InvalidMessage, "Invalid skeleton"),
        }
        Ok(self.try_finish())
    }

    fn peer_disconnected(&mut self, ctx: &mut SyncContext<'_>, peer_id: PeerId) -> SyncResult {
        let Some(id) = self.pending.remove(&peer_id) else {
            return Ok(Transition::Stay);
        };
        ctx.retire_request(id);
        if peer_id == self.peer_id {
            return Ok(Transition::issue(peer_id, "selected peer disconnected"));
        }
        Ok(self.try_finish())
    }

    fn tick(&mut self, ctx: &mut SyncContext<'_>, elapsed: Duration) -> SyncResult {
        self.time_elapsed += elapsed;
        if self.time_elapsed < ctx.timeout() || self.pending.is_empty() {
            return Ok(Transition::Stay);
        }

        let mut selected_timed_out = false;
        for (peer_id, id) in std::mem::take(&mut self.pending) {
            ctx.retire_request(id);
            if peer_id == self.peer_id {
                selected_timed_out = true;
            } else {
                ctx.report(peer_id, EventType::TimeoutMessage, "Timeout waiting for skeleton");
            }
        }
        if selected_timed_out {
            return Ok(Transition::error(
                self.peer_id,
                EventType::TimeoutMessage,
                "timeout waiting for skeleton",
            ));
        }
        Ok(self.try_finish())
    }
}
