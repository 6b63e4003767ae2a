use std::sync::Arc;
use std::time::Duration;

use chain::{BlockStore, EventType, SnapshotProcessor, Validators};
use containers::{BlockBody, BlockHeader, BlockIdentifier, BlockNumber, Bytes32, Status};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::{
    config::{SYNC_TICK_INTERVAL_SECS, SyncConfig},
    events::SyncEvent,
    ledger::{LedgerVerdict, RequestLedger},
    peer_manager::PeerManager,
    states::{
        CheckingBestHeader, DownloadingBackwardsBodies, DownloadingBackwardsHeaders,
        DownloadingBodies, DownloadingHeaders, DownloadingSkeleton, FindingConnectionPoint,
        PeerAndModeDeciding, SnapCapablePeerSelection, SnapSync, SyncContext, SyncEffects,
        SyncPhase, SyncResult, SyncState, SyncStateHandler, Transition, WaitingForPeers,
    },
};
use crate::req_resp::{MessageKind, RequestId, SyncResponse};
use crate::types::NetworkRequester;

/// Sync service coordinating all synchronization operations.
///
/// Owns the single active [`SyncState`] and forwards every inbound event to
/// it. States never replace themselves: they return a [`Transition`] and the
/// service builds the next state. Peer reputation is only touched here, from
/// the reports states queue while handling an event.
pub struct SyncService<N: NetworkRequester> {
    state: SyncState,
    config: SyncConfig,
    peer_manager: Arc<Mutex<PeerManager>>,
    store: Arc<dyn BlockStore>,
    validators: Validators,
    snapshot: Arc<dyn SnapshotProcessor>,
    network: N,
    ledger: RequestLedger,
    metrics: Option<SharedMetrics>,
    attempt_started: Option<Instant>,
}

impl<N: NetworkRequester> SyncService<N> {
    pub fn new(
        config: SyncConfig,
        peer_manager: PeerManager,
        store: Arc<dyn BlockStore>,
        snapshot: Arc<dyn SnapshotProcessor>,
        network: N,
    ) -> Self {
        Self {
            state: SyncState::default(),
            config,
            peer_manager: Arc::new(Mutex::new(peer_manager)),
            store,
            validators: Validators::default(),
            snapshot,
            network,
            ledger: RequestLedger::new(),
            metrics: None,
            attempt_started: None,
        }
    }

    pub fn with_validators(mut self, validators: Validators) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        metrics.set_sync_phase(self.phase().id());
        self.metrics = Some(metrics);
        self
    }

    /// Get current sync state.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn phase(&self) -> SyncPhase {
        self.state.phase()
    }

    pub fn is_syncing(&self) -> bool {
        self.phase().is_syncing()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peer_manager(&self) -> Arc<Mutex<PeerManager>> {
        Arc::clone(&self.peer_manager)
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Update peer chain status.
    pub fn new_peer_status(&mut self, peer_id: PeerId, status: Status, snap_capable: bool) {
        debug!(
            peer = %peer_id,
            best = status.best_block_number,
            td = %status.total_difficulty,
            "Updated peer status"
        );
        self.peer_manager
            .lock()
            .update_status(peer_id, status, snap_capable);
        self.dispatch(|state, ctx| state.new_peer_status(ctx, peer_id));
    }

    pub fn peer_disconnected(&mut self, peer_id: PeerId) {
        if self.peer_manager.lock().remove_peer(&peer_id).is_some() {
            info!(peer = %peer_id, "Peer removed from sync service");
        }
        self.dispatch(|state, ctx| state.peer_disconnected(ctx, peer_id));
    }

    pub fn new_block_hash(&mut self, peer_id: PeerId, request_id: RequestId, hash: Bytes32) {
        if self.accept_response(peer_id, request_id, MessageKind::BlockHash) {
            self.dispatch(|state, ctx| state.new_block_hash(ctx, peer_id, request_id, hash));
        }
    }

    pub fn new_block_headers(
        &mut self,
        peer_id: PeerId,
        request_id: RequestId,
        headers: Vec<BlockHeader>,
    ) {
        if self.accept_response(peer_id, request_id, MessageKind::BlockHeaders) {
            self.dispatch(|state, ctx| state.new_block_headers(ctx, peer_id, request_id, headers));
        }
    }

    pub fn new_body(&mut self, peer_id: PeerId, request_id: RequestId, body: BlockBody) {
        if self.accept_response(peer_id, request_id, MessageKind::BlockBody) {
            self.dispatch(|state, ctx| state.new_body(ctx, peer_id, request_id, body));
        }
    }

    pub fn new_skeleton(
        &mut self,
        peer_id: PeerId,
        request_id: RequestId,
        skeleton: Vec<BlockIdentifier>,
    ) {
        if self.accept_response(peer_id, request_id, MessageKind::Skeleton) {
            self.dispatch(|state, ctx| state.new_skeleton(ctx, peer_id, request_id, skeleton));
        }
    }

    /// Route a response to the active state.
    pub fn on_response(&mut self, peer_id: PeerId, request_id: RequestId, response: SyncResponse) {
        match response {
            SyncResponse::BlockHash { hash } => self.new_block_hash(peer_id, request_id, hash),
            SyncResponse::BlockHeaders { headers } => {
                self.new_block_headers(peer_id, request_id, headers)
            }
            SyncResponse::BlockBody { body } => self.new_body(peer_id, request_id, body),
            SyncResponse::Skeleton { identifiers } => {
                self.new_skeleton(peer_id, request_id, identifiers)
            }
        }
    }

    pub fn snap_progress(&mut self, peer_id: PeerId) {
        self.dispatch(|state, ctx| state.snap_progress(ctx, peer_id));
    }

    pub fn snap_finished(&mut self, peer_id: PeerId) {
        self.dispatch(|state, ctx| state.snap_finished(ctx, peer_id));
    }

    pub fn snap_failed(&mut self, peer_id: PeerId, event: EventType, reason: String) {
        self.dispatch(|state, ctx| state.snap_failed(ctx, peer_id, event, reason));
    }

    /// Periodic tick for sync service.
    ///
    /// Expires stale peer data and old ledger entries, then lets the active
    /// state account for the elapsed time.
    pub fn tick(&mut self, elapsed: Duration) {
        {
            let mut peer_manager = self.peer_manager.lock();
            peer_manager.clean_expired();
            peer_manager.clear_old_failed_peers();
        }
        self.ledger.purge(self.config.timeout_waiting_request * 2);
        self.update_peer_metrics();
        self.dispatch(|state, ctx| state.tick(ctx, elapsed));
    }

    /// Start syncing with a peer, honouring the best-header check setting.
    pub fn start_syncing(&mut self, peer_id: PeerId) {
        self.drive(Ok(Transition::StartSyncing(peer_id)));
    }

    /// Abandon the current attempt and go back to waiting for peers.
    pub fn stop_syncing(&mut self) {
        self.drive(Ok(Transition::StopSyncing));
    }

    /// Peer-attributable failure: report the peer, remember the failure and stop.
    pub fn on_error_syncing(&mut self, peer_id: PeerId, event: EventType, message: &str) {
        self.drive(Ok(Transition::error(peer_id, event, message)));
    }

    /// Local trouble unrelated to peer behaviour: stop without reporting anyone.
    pub fn on_sync_issue(&mut self, peer_id: Option<PeerId>, message: &str) {
        self.drive(Ok(Transition::issue(peer_id, message)));
    }

    pub fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::PeerStatus {
                peer_id,
                status,
                snap_capable,
            } => self.new_peer_status(peer_id, status, snap_capable),
            SyncEvent::PeerDisconnected { peer_id } => self.peer_disconnected(peer_id),
            SyncEvent::Response {
                peer_id,
                request_id,
                response,
            } => self.on_response(peer_id, request_id, response),
            SyncEvent::SnapProgress { peer_id } => self.snap_progress(peer_id),
            SyncEvent::SnapFinished { peer_id } => self.snap_finished(peer_id),
            SyncEvent::SnapFailed {
                peer_id,
                event,
                reason,
            } => self.snap_failed(peer_id, event, reason),
        }
    }

    /// Consume events until the channel closes, ticking once per interval.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SyncEvent>) {
        let period = Duration::from_secs(SYNC_TICK_INTERVAL_SECS);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        info!(phase = self.phase().as_str(), "Sync service started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Sync event channel closed, stopping sync service");
                        break;
                    }
                },
                now = ticker.tick() => {
                    let elapsed = now.saturating_duration_since(last_tick);
                    last_tick = now;
                    self.tick(elapsed);
                }
            }
        }
    }

    /// Get sync statistics.
    pub fn stats(&self) -> SyncStats {
        let local_td = self.store.best_total_difficulty();
        let (known_peers, candidate_peers) = {
            let peer_manager = self.peer_manager.lock();
            (peer_manager.count(), peer_manager.candidates(local_td).len())
        };
        SyncStats {
            phase: self.phase(),
            known_peers,
            candidate_peers,
            local_best_number: self.store.best_block().number(),
            cached_blocks: self.state.cached_blocks(),
            in_flight_requests: self.ledger.in_flight(),
        }
    }

    /// Check a response against the ledger. Returns whether the active state
    /// should see it.
    fn accept_response(
        &mut self,
        peer_id: PeerId,
        request_id: RequestId,
        kind: MessageKind,
    ) -> bool {
        let verdict = self
            .ledger
            .check(request_id, &peer_id, kind, self.config.timeout_waiting_request);
        let message = match verdict {
            LedgerVerdict::Accepted(_) => return true,
            LedgerVerdict::Stale { late: false } => {
                debug!(
                    peer = %peer_id,
                    request_id,
                    kind = kind.as_str(),
                    "Ignoring response for a finished phase"
                );
                return false;
            }
            LedgerVerdict::Stale { late: true } => {
                format!("Late {} response (id={request_id})", kind.as_str())
            }
            LedgerVerdict::Unknown => {
                format!("Unrequested {} response (id={request_id})", kind.as_str())
            }
            LedgerVerdict::WrongPeer { expected } => {
                format!("Response id={request_id} was requested from {expected}")
            }
            LedgerVerdict::WrongKind { expected } => format!(
                "Expected {} for id={request_id}, got {}",
                expected.as_str(),
                kind.as_str()
            ),
        };
        self.report(&peer_id, EventType::UnexpectedMessage, &message);
        false
    }

    fn report(&self, peer_id: &PeerId, event: EventType, message: &str) {
        self.peer_manager.lock().report_event(peer_id, event, message);
        if let Some(metrics) = &self.metrics {
            metrics.inc_peer_report(event.as_str());
            if event == EventType::TimeoutMessage {
                metrics.inc_request_timeout(self.phase().as_str());
            }
        }
    }

    /// Run one handler of the active state with a fresh context.
    fn run_handler<F>(&mut self, handler: F) -> SyncResult
    where
        F: FnOnce(&mut dyn SyncStateHandler, &mut SyncContext<'_>) -> SyncResult,
    {
        let (result, effects) = {
            let mut peer_manager = self.peer_manager.lock();
            let mut ctx = SyncContext::new(
                &self.config,
                &mut *peer_manager,
                self.store.as_ref(),
                &self.validators,
                self.snapshot.as_ref(),
                &self.network,
                &mut self.ledger,
            );
            let result = handler(self.state.handler_mut(), &mut ctx);
            (result, ctx.into_effects())
        };
        self.apply_effects(effects);
        result
    }

    fn dispatch<F>(&mut self, handler: F)
    where
        F: FnOnce(&mut dyn SyncStateHandler, &mut SyncContext<'_>) -> SyncResult,
    {
        let result = self.run_handler(handler);
        self.drive(result);
    }

    fn apply_effects(&self, effects: SyncEffects) {
        for report in &effects.reports {
            self.report(&report.peer_id, report.event, &report.message);
        }
        if let Some(metrics) = &self.metrics {
            if effects.saved_forward > 0 {
                metrics.inc_blocks_saved("forward", effects.saved_forward);
            }
            if effects.saved_backward > 0 {
                metrics.inc_blocks_saved("backward", effects.saved_backward);
            }
        }
    }

    /// Apply transitions until a state settles.
    fn drive(&mut self, mut result: SyncResult) {
        loop {
            let transition = match result {
                Ok(transition) => transition,
                Err(err) => {
                    error!(phase = self.phase().as_str(), %err, "Sync attempt aborted");
                    self.finish_attempt("aborted");
                    Transition::StopSyncing
                }
            };
            let Some(next) = self.build_state(transition) else {
                return;
            };
            if !self.phase().can_transition_to(next.phase()) {
                warn!(
                    from = self.phase().as_str(),
                    to = next.phase().as_str(),
                    "Invalid state transition attempted"
                );
                return;
            }
            self.enter(next);
            result = self.run_handler(|state, ctx| state.on_enter(ctx));
        }
    }

    /// Map a transition to the state it leads to, handling its side effects.
    fn build_state(&mut self, transition: Transition) -> Option<SyncState> {
        let state = match transition {
            Transition::Stay => return None,
            Transition::StartDeciding => {
                SyncState::PeerAndModeDeciding(PeerAndModeDeciding::new())
            }
            Transition::StartSyncing(peer_id) if self.config.check_best_header => {
                SyncState::CheckingBestHeader(CheckingBestHeader::new(peer_id))
            }
            Transition::StartSyncing(peer_id) | Transition::StartFindingConnectionPoint(peer_id) => {
                SyncState::FindingConnectionPoint(FindingConnectionPoint::new(peer_id))
            }
            Transition::StartDownloadingSkeleton {
                peer_id,
                connection_point,
            } => SyncState::DownloadingSkeleton(DownloadingSkeleton::new(peer_id, connection_point)),
            Transition::StartDownloadingHeaders {
                peer_id,
                connection_point,
                skeletons,
            } => SyncState::DownloadingHeaders(DownloadingHeaders::new(
                peer_id,
                connection_point,
                skeletons,
            )),
            Transition::StartDownloadingBodies {
                peer_id,
                pending_headers,
                skeletons,
            } => SyncState::DownloadingBodies(DownloadingBodies::new(
                peer_id,
                pending_headers,
                skeletons,
            )),
            Transition::BackwardSyncing(peer_id) => {
                SyncState::DownloadingBackwardsHeaders(DownloadingBackwardsHeaders::new(peer_id))
            }
            Transition::StartDownloadingBackwardsBodies {
                peer_id,
                child,
                headers,
            } => SyncState::DownloadingBackwardsBodies(DownloadingBackwardsBodies::new(
                peer_id, child, headers,
            )),
            Transition::StartSnapCapablePeerSelection => {
                SyncState::SnapCapablePeerSelection(SnapCapablePeerSelection::new())
            }
            Transition::StartSnapSync {
                peer_id,
                checkpoint,
            } => SyncState::SnapSync(SnapSync::new(peer_id, checkpoint)),
            Transition::StopSyncing => {
                self.finish_attempt("completed");
                SyncState::WaitingForPeers(WaitingForPeers::new())
            }
            Transition::ErrorSyncing {
                peer_id,
                event,
                message,
            } => {
                warn!(peer = %peer_id, %event, reason = %message, "Sync attempt failed");
                self.report(&peer_id, event, &message);
                self.peer_manager.lock().process_syncing_error(&peer_id);
                self.finish_attempt("failed");
                SyncState::WaitingForPeers(WaitingForPeers::new())
            }
            Transition::SyncIssue { peer_id, message } => {
                match peer_id {
                    Some(peer_id) => warn!(peer = %peer_id, reason = %message, "Sync issue"),
                    None => warn!(reason = %message, "Sync issue"),
                }
                self.finish_attempt("issue");
                SyncState::WaitingForPeers(WaitingForPeers::new())
            }
        };
        Some(state)
    }

    fn enter(&mut self, next: SyncState) {
        let from = self.phase();
        let to = next.phase();
        self.state = next;
        self.ledger.advance_generation();
        if to.is_syncing() && self.attempt_started.is_none() {
            self.attempt_started = Some(Instant::now());
        }

        info!(from = from.as_str(), to = to.as_str(), "Sync state transition");
        if let Some(metrics) = &self.metrics {
            metrics.inc_state_transition(to.as_str());
            metrics.set_sync_phase(to.id());
        }
    }

    fn finish_attempt(&mut self, outcome: &str) {
        let Some(started) = self.attempt_started.take() else {
            return;
        };
        let seconds = started.elapsed().as_secs_f64();
        info!(outcome, seconds, "Sync attempt finished");
        if let Some(metrics) = &self.metrics {
            metrics.observe_sync_attempt(outcome, seconds);
        }
    }

    fn update_peer_metrics(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let local_td = self.store.best_total_difficulty();
        let peer_manager = self.peer_manager.lock();
        metrics.set_peers(
            peer_manager.count() as i64,
            peer_manager.candidates(local_td).len() as i64,
        );
    }
}

/// Statistics about the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub phase: SyncPhase,
    pub known_peers: usize,
    pub candidate_peers: usize,
    pub local_best_number: BlockNumber,
    pub cached_blocks: usize,
    pub in_flight_requests: usize,
}
