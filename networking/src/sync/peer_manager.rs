use super::config::{SyncConfig, TIME_LIMIT_FAILURE_RECORD};
use alloy_primitives::U256;
use chain::{EventType, PeerScoring};
use containers::{BlockDifficulty, BlockNumber, Status};
use libp2p_identity::PeerId;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Sync-specific peer state.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub status: Option<Status>,
    pub snap_capable: bool,
    last_update: Instant,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            status: None,
            snap_capable: false,
            last_update: Instant::now(),
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = Some(status);
        self.last_update = Instant::now();
    }

    pub fn is_expired(&self, expiration: Duration) -> bool {
        self.last_update.elapsed() > expiration
    }

    pub fn total_difficulty(&self) -> Option<BlockDifficulty> {
        self.status.as_ref().map(|status| status.total_difficulty)
    }

    pub fn best_block_number(&self) -> Option<BlockNumber> {
        self.status.as_ref().map(|status| status.best_block_number)
    }
}

/// Peer registry for sync operations.
///
/// Tracks each peer's last reported chain status and keeps a short memory of
/// peers whose sync attempt failed. Candidates for sync are peers with a
/// fresh status, a good reputation and a total difficulty strictly above the
/// local chain.
pub struct PeerManager {
    peers: HashMap<PeerId, SyncPeer>,
    failed_peers: HashMap<PeerId, Instant>,
    scoring: Arc<dyn PeerScoring>,
    expiration: Duration,
    top_best: f64,
    snap_boot_nodes: HashSet<PeerId>,
}

impl PeerManager {
    pub fn new(config: &SyncConfig, scoring: Arc<dyn PeerScoring>) -> Self {
        Self {
            peers: HashMap::new(),
            failed_peers: HashMap::new(),
            scoring,
            expiration: config.expiration_time_peer_status,
            top_best: config.top_best,
            snap_boot_nodes: config.snap_boot_nodes.iter().copied().collect(),
        }
    }

    /// Add a peer to the registry.
    pub fn register_peer(&mut self, peer_id: PeerId) -> &mut SyncPeer {
        self.peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id))
    }

    /// Record a peer's chain status, registering the peer if needed.
    pub fn update_status(&mut self, peer_id: PeerId, status: Status, snap_capable: bool) {
        let peer = self.register_peer(peer_id);
        peer.snap_capable = snap_capable;
        peer.set_status(status);
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&SyncPeer> {
        self.peers.get(peer_id)
    }

    pub fn get_all_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.peers.values()
    }

    /// Peers with a non-expired status.
    pub fn count(&self) -> usize {
        self.fresh_peers().count()
    }

    pub fn has_good_reputation(&self, peer_id: &PeerId) -> bool {
        self.scoring.has_good_reputation(peer_id)
    }

    /// Forward a misbehaviour report to peer scoring.
    pub fn report_event(&self, peer_id: &PeerId, event: EventType, message: &str) {
        self.scoring.record_event(peer_id, event, message);
    }

    /// Remember that syncing with this peer failed.
    pub fn process_syncing_error(&mut self, peer_id: &PeerId) {
        self.failed_peers.insert(*peer_id, Instant::now());
    }

    pub fn is_recently_failed(&self, peer_id: &PeerId) -> bool {
        self.failed_peers
            .get(peer_id)
            .is_some_and(|at| at.elapsed() <= TIME_LIMIT_FAILURE_RECORD)
    }

    pub fn clear_old_failed_peers(&mut self) {
        self.failed_peers
            .retain(|_, at| at.elapsed() <= TIME_LIMIT_FAILURE_RECORD);
    }

    /// Drop peers whose status has expired. Returns the removed ids.
    pub fn clean_expired(&mut self) -> Vec<PeerId> {
        let expiration = self.expiration;
        let expired: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_expired(expiration))
            .map(|peer| peer.peer_id)
            .collect();
        for peer_id in &expired {
            self.peers.remove(peer_id);
            debug!(peer = %peer_id, "Removed peer with expired status");
        }
        expired
    }

    fn fresh_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        let expiration = self.expiration;
        self.peers
            .values()
            .filter(move |peer| peer.status.is_some() && !peer.is_expired(expiration))
    }

    fn usable_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.fresh_peers()
            .filter(|peer| self.scoring.has_good_reputation(&peer.peer_id))
    }

    /// Peers ahead of the local chain.
    pub fn candidates(&self, local_td: BlockDifficulty) -> Vec<&SyncPeer> {
        self.usable_peers()
            .filter(|peer| peer.total_difficulty().is_some_and(|td| td > local_td))
            .collect()
    }

    /// All candidate ids, strongest first.
    pub fn best_peer_candidates(&self, local_td: BlockDifficulty) -> Vec<PeerId> {
        let mut candidates = self.candidates(local_td);
        candidates.sort_by(|a, b| b.total_difficulty().cmp(&a.total_difficulty()));
        candidates.into_iter().map(|peer| peer.peer_id).collect()
    }

    /// Pick a candidate within the tolerance band of the strongest one.
    pub fn best_peer(&self, local_td: BlockDifficulty) -> Option<PeerId> {
        self.select_within_band(self.candidates(local_td))
    }

    /// Strongest peer whose chain is at least as heavy as the local one.
    pub fn best_or_equal_peer(&self, local_td: BlockDifficulty) -> Option<PeerId> {
        let candidates: Vec<&SyncPeer> = self
            .usable_peers()
            .filter(|peer| peer.total_difficulty().is_some_and(|td| td >= local_td))
            .collect();
        self.prefer_not_failed(candidates)
            .into_iter()
            .max_by_key(|peer| peer.total_difficulty())
            .map(|peer| peer.peer_id)
    }

    pub fn is_snap_boot_node(&self, peer_id: &PeerId) -> bool {
        self.snap_boot_nodes.contains(peer_id)
    }

    /// Candidates able to serve snap sync: snap-capable or configured boot nodes.
    pub fn snap_candidates(&self, local_td: BlockDifficulty) -> Vec<&SyncPeer> {
        self.candidates(local_td)
            .into_iter()
            .filter(|peer| peer.snap_capable || self.is_snap_boot_node(&peer.peer_id))
            .collect()
    }

    pub fn best_snap_peer(&self, local_td: BlockDifficulty) -> Option<PeerId> {
        self.select_within_band(self.snap_candidates(local_td))
    }

    fn prefer_not_failed<'a>(&self, candidates: Vec<&'a SyncPeer>) -> Vec<&'a SyncPeer> {
        let healthy: Vec<&SyncPeer> = candidates
            .iter()
            .copied()
            .filter(|peer| !self.is_recently_failed(&peer.peer_id))
            .collect();
        if healthy.is_empty() { candidates } else { healthy }
    }

    fn select_within_band(&self, candidates: Vec<&SyncPeer>) -> Option<PeerId> {
        let candidates = self.prefer_not_failed(candidates);
        let difficulties: Vec<U256> = candidates
            .iter()
            .filter_map(|peer| peer.total_difficulty())
            .map(|td| td.0)
            .collect();
        let max = difficulties.iter().max().copied()?;
        let min = difficulties.iter().min().copied()?;
        let threshold = tolerance_threshold(max, min, self.top_best);

        let eligible: Vec<&SyncPeer> = candidates
            .into_iter()
            .filter(|peer| peer.total_difficulty().is_some_and(|td| td.0 >= threshold))
            .collect();
        eligible
            .choose(&mut rand::thread_rng())
            .map(|peer| peer.peer_id)
    }
}

/// `max - top_best% * (max - min)`, rounded up to the next integer difficulty.
pub fn tolerance_threshold(max: U256, min: U256, top_best: f64) -> U256 {
    let basis_points = (top_best.clamp(0.0, 100.0) * 100.0).round() as u64;
    let band = (max - min) * U256::from(basis_points) / U256::from(10_000u64);
    max - band
}
