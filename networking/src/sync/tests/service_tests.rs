use std::sync::Arc;
use std::time::Duration;

use chain::{BlockStore, EventType, MemoryBlockStore, ReputationTable};
use containers::{Block, BlockDifficulty, BlockHeader, Bytes32, ChunkDescriptor, Status};
use libp2p_identity::PeerId;
use metrics::Metrics;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::fixtures::{
    RecordingNetwork, RecordingSnapshot, answer, build_chain, empty_body, header_run,
    headers_ending_at, status_at, total_difficulty, uncommitted_body,
};
use crate::req_resp::{SyncRequest, SyncResponse};
use crate::sync::config::{HEADERS_VALIDATION_COUNT, SyncConfig};
use crate::sync::states::snap_checkpoint_number;
use crate::sync::{PeerManager, SyncEvent, SyncPhase, SyncService};
use crate::types::OutboundSyncRequest;

struct Harness {
    service: SyncService<RecordingNetwork>,
    store: Arc<MemoryBlockStore>,
    reputation: Arc<ReputationTable>,
    snapshot: Arc<RecordingSnapshot>,
}

impl Harness {
    fn new(config: SyncConfig, store: MemoryBlockStore) -> Self {
        let store = Arc::new(store);
        let reputation = Arc::new(ReputationTable::new());
        let snapshot = Arc::new(RecordingSnapshot::default());
        let peer_manager = PeerManager::new(&config, reputation.clone());
        let service = SyncService::new(
            config,
            peer_manager,
            store.clone(),
            snapshot.clone(),
            RecordingNetwork::default(),
        );
        Self {
            service,
            store,
            reputation,
            snapshot,
        }
    }

    fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        Self {
            service: self.service.with_metrics(metrics),
            ..self
        }
    }

    fn sent(&self) -> Vec<OutboundSyncRequest> {
        self.service.network().take()
    }

    /// Answer every outstanding request from `chain` until the service stops asking.
    fn serve(&mut self, chain: &[Block]) -> usize {
        let chunk_size = self.service.config().chunk_size;
        self.serve_with(|outbound| answer(chain, chunk_size, &outbound.request))
    }

    /// Like `serve`, but `respond` decides each answer; `None` leaves the
    /// request unanswered.
    fn serve_with<F>(&mut self, mut respond: F) -> usize
    where
        F: FnMut(&OutboundSyncRequest) -> Option<SyncResponse>,
    {
        let mut answered = 0;
        for _ in 0..10_000 {
            let requests = self.sent();
            if requests.is_empty() {
                return answered;
            }
            for outbound in requests {
                if let Some(response) = respond(&outbound) {
                    self.service
                        .on_response(outbound.peer_id, outbound.request_id, response);
                    answered += 1;
                }
            }
        }
        panic!("sync did not settle");
    }

    fn events(&self, peer_id: &PeerId, event: EventType) -> u32 {
        self.reputation.event_count(peer_id, event)
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        expected_peers: 1,
        chunk_size: 10,
        ..SyncConfig::default()
    }
}

fn genesis_store(chain: &[Block]) -> MemoryBlockStore {
    MemoryBlockStore::new(chain[0].clone())
}

/// Brings a single-peer service into `CheckingBestHeader` and returns the
/// pending best-header request.
fn checking_best_header(chain: &[Block]) -> (Harness, PeerId, OutboundSyncRequest) {
    let mut harness = Harness::new(config(), genesis_store(chain));
    let peer = PeerId::random();
    let best = chain.len() as u64 - 1;
    harness
        .service
        .new_peer_status(peer, status_at(chain, best), false);
    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);

    let mut sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let request = sent.remove(0);
    (harness, peer, request)
}

#[tokio::test]
async fn test_waits_for_expected_peers() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 2,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));

    let first = PeerId::random();
    harness
        .service
        .new_peer_status(first, status_at(&chain, 40), false);
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert!(harness.sent().is_empty());

    let second = PeerId::random();
    harness
        .service
        .new_peer_status(second, status_at(&chain, 40), false);
    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert!([first, second].contains(&sent[0].peer_id));
    assert_eq!(
        sent[0].request,
        SyncRequest::BlockHeaders(ChunkDescriptor::new(chain[40].hash(), 1))
    );
}

#[tokio::test]
async fn test_single_peer_is_used_after_waiting_timeout() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 5,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 40), false);

    harness.service.tick(Duration::from_secs(59));
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);

    harness.service.tick(Duration::from_secs(1));
    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);
}

#[tokio::test]
async fn test_forward_sync_downloads_full_chain() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 2,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let peers = [PeerId::random(), PeerId::random()];
    for peer in peers {
        harness
            .service
            .new_peer_status(peer, status_at(&chain, 40), false);
    }

    assert!(harness.serve(&chain) > 40);

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.store.best_block().number(), 40);
    assert_eq!(harness.store.len(), 41);
    assert_eq!(
        harness.store.best_total_difficulty(),
        total_difficulty(&chain, 40)
    );
    assert!(harness.store.flush_count() >= 1);
    for peer in peers {
        assert_eq!(harness.reputation.total_events(&peer), 0);
    }
    assert_eq!(harness.service.stats().in_flight_requests, 0);
}

#[tokio::test]
async fn test_forward_sync_resumes_from_shared_prefix() {
    let chain = build_chain(101);
    let store = genesis_store(&chain);
    for block in &chain[1..=20] {
        store.connect_block(block.clone()).unwrap();
    }
    let config = SyncConfig {
        check_best_header: false,
        ..config()
    };
    let mut harness = Harness::new(config, store);
    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 100), false);
    assert_eq!(harness.service.phase(), SyncPhase::FindingConnectionPoint);

    let first_probe = harness.sent();
    assert_eq!(
        first_probe.iter().map(|r| r.request.clone()).collect::<Vec<_>>(),
        vec![SyncRequest::BlockHash { number: 50 }]
    );
    for outbound in first_probe {
        let response = answer(&chain, 10, &outbound.request).unwrap();
        harness
            .service
            .on_response(outbound.peer_id, outbound.request_id, response);
    }

    harness.serve(&chain);

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.store.best_block().number(), 100);
    assert_eq!(harness.store.len(), 101);
}

#[tokio::test]
async fn test_forged_best_header_fails_attempt() {
    let chain = build_chain(41);
    let (mut harness, peer, request) = checking_best_header(&chain);

    let forged = BlockHeader::new(chain[39].hash(), 40, BlockDifficulty::from(7));
    harness.service.on_response(
        peer,
        request.request_id,
        SyncResponse::BlockHeaders {
            headers: vec![forged],
        },
    );

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.events(&peer, EventType::InvalidHeader), 1);
    assert!(harness.service.peer_manager().lock().is_recently_failed(&peer));
}

#[tokio::test]
async fn test_unrequested_response_is_reported_once() {
    let chain = build_chain(41);
    let (mut harness, peer, request) = checking_best_header(&chain);
    let best_header = SyncResponse::BlockHeaders {
        headers: vec![chain[40].header.clone()],
    };

    harness
        .service
        .on_response(peer, request.request_id + 100, best_header.clone());
    assert_eq!(harness.events(&peer, EventType::UnexpectedMessage), 1);
    assert_eq!(harness.reputation.total_events(&peer), 1);
    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);

    let intruder = PeerId::random();
    harness
        .service
        .on_response(intruder, request.request_id, best_header.clone());
    assert_eq!(harness.events(&intruder, EventType::UnexpectedMessage), 1);
    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);

    harness
        .service
        .on_response(peer, request.request_id, SyncResponse::BlockBody { body: empty_body() });
    assert_eq!(harness.events(&peer, EventType::UnexpectedMessage), 2);

    harness
        .service
        .on_response(peer, request.request_id, best_header);
    assert_eq!(harness.service.phase(), SyncPhase::FindingConnectionPoint);
    assert_eq!(harness.events(&peer, EventType::UnexpectedMessage), 2);
}

#[tokio::test]
async fn test_request_timeout_fails_attempt_and_late_answer_is_unexpected() {
    let chain = build_chain(41);
    let (mut harness, peer, request) = checking_best_header(&chain);

    harness.service.tick(Duration::from_secs(29));
    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);

    harness.service.tick(Duration::from_secs(1));
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.events(&peer, EventType::TimeoutMessage), 1);
    assert!(harness.service.peer_manager().lock().is_recently_failed(&peer));

    harness.service.on_response(
        peer,
        request.request_id,
        SyncResponse::BlockHeaders {
            headers: vec![chain[40].header.clone()],
        },
    );
    assert_eq!(harness.events(&peer, EventType::UnexpectedMessage), 1);
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
}

#[tokio::test]
async fn test_answer_after_stop_is_ignored() {
    let chain = build_chain(41);
    let (mut harness, peer, request) = checking_best_header(&chain);

    harness.service.stop_syncing();
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);

    harness.service.on_response(
        peer,
        request.request_id,
        SyncResponse::BlockHeaders {
            headers: vec![chain[40].header.clone()],
        },
    );
    assert_eq!(harness.reputation.total_events(&peer), 0);
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
}

#[tokio::test]
async fn test_skeleton_progress_resets_idle_timer() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 2,
        check_best_header: false,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    for peer in [PeerId::random(), PeerId::random()] {
        harness
            .service
            .new_peer_status(peer, status_at(&chain, 40), false);
    }

    let mut selected = None;
    let mut skeleton_requests = Vec::new();
    harness.serve_with(|outbound| match outbound.request {
        SyncRequest::Skeleton { .. } => {
            skeleton_requests.push(outbound.clone());
            None
        }
        SyncRequest::BlockHash { .. } => {
            selected = Some(outbound.peer_id);
            answer(&chain, 10, &outbound.request)
        }
        _ => answer(&chain, 10, &outbound.request),
    });
    assert_eq!(harness.service.phase(), SyncPhase::DownloadingSkeleton);
    assert_eq!(skeleton_requests.len(), 2);
    let selected = selected.unwrap();
    let other = skeleton_requests
        .into_iter()
        .find(|outbound| outbound.peer_id != selected)
        .unwrap();

    harness.service.tick(Duration::from_secs(20));
    let skeleton = answer(&chain, 10, &other.request).unwrap();
    harness
        .service
        .on_response(other.peer_id, other.request_id, skeleton);

    harness.service.tick(Duration::from_secs(15));
    assert_eq!(harness.service.phase(), SyncPhase::DownloadingSkeleton);
    assert_eq!(harness.events(&selected, EventType::TimeoutMessage), 0);

    harness.service.tick(Duration::from_secs(15));
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.events(&selected, EventType::TimeoutMessage), 1);
    assert_eq!(harness.reputation.total_events(&other.peer_id), 0);
}

#[tokio::test]
async fn test_checkpoint_hash_progress_resets_idle_timer() {
    let chain = build_chain(1);
    let config = SyncConfig {
        expected_peers: 2,
        snap_client_enabled: true,
        ..config()
    };
    let metrics = Arc::new(Metrics::new().unwrap());
    let mut harness = Harness::new(config, genesis_store(&chain)).with_metrics(metrics.clone());
    let tip = Bytes32::from([0x12; 32]);
    for peer in [PeerId::random(), PeerId::random()] {
        harness.service.new_peer_status(
            peer,
            Status::new(12_000, tip, BlockDifficulty::from(20_000)),
            true,
        );
    }
    assert_eq!(
        harness.service.phase(),
        SyncPhase::SnapCapablePeerSelection
    );
    let hash_requests = harness.sent();
    assert_eq!(hash_requests.len(), 2);
    let (answered, silent) = (&hash_requests[0], &hash_requests[1]);

    harness.service.tick(Duration::from_secs(20));
    harness.service.on_response(
        answered.peer_id,
        answered.request_id,
        SyncResponse::BlockHash {
            hash: Bytes32::from([0x56; 32]),
        },
    );

    harness.service.tick(Duration::from_secs(15));
    assert_eq!(
        harness.service.phase(),
        SyncPhase::SnapCapablePeerSelection
    );
    assert_eq!(harness.events(&silent.peer_id, EventType::TimeoutMessage), 0);
    assert!(harness.sent().is_empty());

    harness.service.tick(Duration::from_secs(15));
    assert_eq!(harness.events(&silent.peer_id, EventType::TimeoutMessage), 1);
    let header_requests = harness.sent();
    assert_eq!(header_requests.len(), 1);
    assert_eq!(header_requests[0].peer_id, answered.peer_id);

    // No candidate left with a valid checkpoint chain.
    harness.service.on_response(
        answered.peer_id,
        header_requests[0].request_id,
        SyncResponse::BlockHeaders { headers: vec![] },
    );
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.events(&answered.peer_id, EventType::InvalidMessage), 1);
    assert!(harness.snapshot.started().is_empty());
    assert_eq!(metrics.sync_attempts("issue"), 1);
    assert_eq!(metrics.sync_attempts("completed"), 0);
}

#[tokio::test]
async fn test_body_timeout_requeues_chunk_to_other_peer() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 2,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let (slow, fast) = (PeerId::random(), PeerId::random());
    for peer in [slow, fast] {
        harness
            .service
            .new_peer_status(peer, status_at(&chain, 40), false);
    }

    harness.serve_with(|outbound| match outbound.request {
        SyncRequest::BlockBody { .. } if outbound.peer_id == slow => None,
        _ => answer(&chain, 10, &outbound.request),
    });
    assert_eq!(harness.service.phase(), SyncPhase::DownloadingBodies);
    assert!(harness.store.best_block().number() < 40);

    harness.service.tick(Duration::from_secs(30));
    assert_eq!(harness.service.phase(), SyncPhase::DownloadingBodies);
    assert_eq!(harness.events(&slow, EventType::TimeoutMessage), 1);

    harness.serve(&chain);

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.store.best_block().number(), 40);
    assert_eq!(harness.store.len(), 41);
    assert_eq!(harness.reputation.total_events(&slow), 1);
    assert_eq!(harness.reputation.total_events(&fast), 0);
}

#[tokio::test]
async fn test_invalid_body_drops_peer_and_requeues_its_work() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 2,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let (bad, good) = (PeerId::random(), PeerId::random());
    for peer in [bad, good] {
        harness
            .service
            .new_peer_status(peer, status_at(&chain, 40), false);
    }

    harness.serve_with(|outbound| match outbound.request {
        SyncRequest::BlockBody { .. } if outbound.peer_id == bad => Some(SyncResponse::BlockBody {
            body: uncommitted_body(),
        }),
        _ => answer(&chain, 10, &outbound.request),
    });

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.store.best_block().number(), 40);
    assert_eq!(harness.events(&bad, EventType::InvalidMessage), 1);
    assert_eq!(harness.reputation.total_events(&bad), 1);
    assert_eq!(harness.reputation.total_events(&good), 0);
}

#[tokio::test]
async fn test_losing_the_only_body_peer_ends_attempt() {
    let chain = build_chain(21);
    let metrics = Arc::new(Metrics::new().unwrap());
    let mut harness =
        Harness::new(config(), genesis_store(&chain)).with_metrics(metrics.clone());
    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 20), false);

    harness.serve_with(|outbound| match outbound.request {
        SyncRequest::BlockBody { .. } => None,
        _ => answer(&chain, 10, &outbound.request),
    });
    assert_eq!(harness.service.phase(), SyncPhase::DownloadingBodies);

    harness.service.tick(Duration::from_secs(29));
    assert_eq!(harness.service.phase(), SyncPhase::DownloadingBodies);

    harness.service.tick(Duration::from_secs(1));
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.events(&peer, EventType::TimeoutMessage), 1);
    assert_eq!(harness.store.best_block().number(), 0);
    assert_eq!(metrics.sync_attempts("issue"), 1);
    assert_eq!(metrics.sync_attempts("completed"), 0);
}

#[tokio::test]
async fn test_explicit_start_syncing_skips_deciding() {
    let chain = build_chain(41);
    let config = SyncConfig {
        expected_peers: 3,
        check_best_header: false,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 40), false);
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);

    harness.service.start_syncing(peer);
    assert_eq!(harness.service.phase(), SyncPhase::FindingConnectionPoint);

    harness.serve(&chain);
    assert_eq!(harness.store.best_block().number(), 40);
}

#[tokio::test]
async fn test_backward_sync_connects_genesis() {
    let chain = build_chain(26);
    let store = MemoryBlockStore::from_checkpoint(
        chain[0].clone(),
        chain[25].clone(),
        total_difficulty(&chain, 25),
    );
    let config = SyncConfig {
        max_requested_bodies: 4,
        ..config()
    };
    let mut harness = Harness::new(config, store);
    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 25), false);
    assert_eq!(
        harness.service.phase(),
        SyncPhase::DownloadingBackwardsHeaders
    );

    harness.serve(&chain);

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.store.min_stored_number(), 0);
    assert_eq!(harness.store.len(), 26);
    assert_eq!(harness.store.best_block().number(), 25);
    for number in [0, 1, 12, 24] {
        assert_eq!(
            harness.store.total_difficulty(&chain[number as usize].hash()),
            Some(total_difficulty(&chain, number))
        );
    }
}

#[tokio::test]
async fn test_backward_sync_rejects_inconsistent_difficulty() {
    let chain = build_chain(8);
    let inflated = total_difficulty(&chain, 7) + BlockDifficulty::from(5);
    let store = MemoryBlockStore::from_checkpoint(chain[0].clone(), chain[7].clone(), inflated);
    let mut harness = Harness::new(config(), store);
    let peer = PeerId::random();
    let status = Status::new(7, chain[7].hash(), inflated);
    harness.service.new_peer_status(peer, status, false);

    harness.serve(&chain);

    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.store.min_stored_number(), 1);
    assert!(!harness.store.is_block_known(&chain[0].hash()));
}

#[test]
fn test_snap_checkpoint_number() {
    let config = SyncConfig::default();
    assert_eq!(snap_checkpoint_number(12_000, &config), Some(6_160));
    assert_eq!(snap_checkpoint_number(10_000, &config), Some(6_160));
    assert_eq!(snap_checkpoint_number(15_001, &config), Some(11_160));
    assert_eq!(snap_checkpoint_number(4_999, &config), None);
}

#[tokio::test]
async fn test_snap_selection_picks_validated_checkpoint() {
    let chain = build_chain(1);
    let config = SyncConfig {
        expected_peers: 2,
        snap_client_enabled: true,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let run = header_run(6_160 - HEADERS_VALIDATION_COUNT + 1, 6_160);
    let checkpoint = run[run.len() - 1].clone();

    let liar = PeerId::random();
    let honest = PeerId::random();
    let tip = Bytes32::from([0x12; 32]);
    harness.service.new_peer_status(
        liar,
        Status::new(12_000, tip, BlockDifficulty::from(30_000)),
        true,
    );
    harness.service.new_peer_status(
        honest,
        Status::new(12_000, tip, BlockDifficulty::from(20_000)),
        true,
    );
    assert_eq!(
        harness.service.phase(),
        SyncPhase::SnapCapablePeerSelection
    );

    let hash_requests = harness.sent();
    assert_eq!(hash_requests.len(), 2);
    for outbound in hash_requests {
        assert_eq!(outbound.request, SyncRequest::BlockHash { number: 6_160 });
        harness.service.on_response(
            outbound.peer_id,
            outbound.request_id,
            SyncResponse::BlockHash {
                hash: checkpoint.hash(),
            },
        );
    }

    let header_requests = harness.sent();
    assert_eq!(header_requests.len(), 2);
    for outbound in header_requests {
        assert_eq!(
            outbound.request,
            SyncRequest::BlockHeaders(ChunkDescriptor::new(
                checkpoint.hash(),
                HEADERS_VALIDATION_COUNT
            ))
        );
        let mut headers = headers_ending_at(&run, checkpoint.hash(), HEADERS_VALIDATION_COUNT);
        if outbound.peer_id == liar {
            headers.pop();
        }
        harness.service.on_response(
            outbound.peer_id,
            outbound.request_id,
            SyncResponse::BlockHeaders { headers },
        );
    }

    assert_eq!(harness.service.phase(), SyncPhase::SnapSync);
    assert_eq!(harness.snapshot.started(), vec![(honest, Some(checkpoint))]);
    assert_eq!(harness.events(&liar, EventType::InvalidMessage), 1);

    harness.service.snap_progress(honest);
    harness.service.snap_finished(liar);
    assert_eq!(harness.service.phase(), SyncPhase::SnapSync);

    harness.service.snap_finished(honest);
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
}

#[tokio::test]
async fn test_snap_boot_node_skips_checkpoint_validation() {
    let chain = build_chain(1);
    let boot = PeerId::random();
    let config = SyncConfig {
        snap_client_enabled: true,
        snap_boot_nodes: vec![boot],
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let status = Status::new(
        12_000,
        Bytes32::from([0x34; 32]),
        BlockDifficulty::from(50_000),
    );
    harness.service.new_peer_status(boot, status, false);

    assert_eq!(harness.service.phase(), SyncPhase::SnapSync);
    assert_eq!(harness.snapshot.started(), vec![(boot, None)]);
    assert!(harness.sent().is_empty());

    harness
        .service
        .snap_failed(boot, EventType::InvalidStateChunk, "bad state chunk".to_string());
    assert_eq!(harness.service.phase(), SyncPhase::WaitingForPeers);
    assert_eq!(harness.events(&boot, EventType::InvalidStateChunk), 1);
    assert!(harness.service.peer_manager().lock().is_recently_failed(&boot));
}

#[tokio::test]
async fn test_short_distance_does_not_snap_sync() {
    let chain = build_chain(41);
    let config = SyncConfig {
        snap_client_enabled: true,
        ..config()
    };
    let mut harness = Harness::new(config, genesis_store(&chain));
    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 40), true);

    assert_eq!(harness.service.phase(), SyncPhase::CheckingBestHeader);
    assert!(harness.snapshot.started().is_empty());
}

#[tokio::test]
async fn test_run_consumes_events_until_channel_closes() {
    let chain = build_chain(41);
    let network = RecordingNetwork::default();
    let config = config();
    let peer_manager = PeerManager::new(&config, Arc::new(ReputationTable::new()));
    let service = SyncService::new(
        config,
        peer_manager,
        Arc::new(genesis_store(&chain)),
        Arc::new(RecordingSnapshot::default()),
        network.clone(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let peer = PeerId::random();
    tx.send(SyncEvent::PeerStatus {
        peer_id: peer,
        status: status_at(&chain, 40),
        snap_capable: false,
    })
    .unwrap();
    drop(tx);

    service.run(rx).await;

    let sent = network.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].peer_id, peer);
    assert_eq!(
        sent[0].request,
        SyncRequest::BlockHeaders(ChunkDescriptor::new(chain[40].hash(), 1))
    );
}

#[tokio::test]
async fn test_metrics_follow_transitions_and_saved_blocks() {
    let chain = build_chain(21);
    let metrics = Arc::new(Metrics::new().unwrap());
    let mut harness =
        Harness::new(config(), genesis_store(&chain)).with_metrics(metrics.clone());

    let peer = PeerId::random();
    harness
        .service
        .new_peer_status(peer, status_at(&chain, 20), false);
    harness.serve(&chain);

    assert_eq!(harness.store.best_block().number(), 20);
    assert_eq!(metrics.blocks_saved("forward"), 20);
    assert_eq!(metrics.state_transitions("downloading_bodies"), 1);
    assert_eq!(metrics.state_transitions("waiting_for_peers"), 1);
    assert_eq!(metrics.peer_reports("unexpected_message"), 0);
    assert_eq!(metrics.sync_attempts("completed"), 1);
}
