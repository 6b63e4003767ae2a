use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chain::{EventType, PeerScoring, ReputationTable};
use containers::{BlockDifficulty, Bytes32, Status};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::sync::config::{SyncConfig, TIME_LIMIT_FAILURE_RECORD};
use crate::sync::PeerManager;

fn status(best: u64, td: u64) -> Status {
    Status::new(best, Bytes32::from([best as u8; 32]), BlockDifficulty::from(td))
}

fn manager(top_best: f64) -> (PeerManager, Arc<ReputationTable>) {
    let config = SyncConfig {
        top_best,
        ..SyncConfig::default()
    };
    let reputation = Arc::new(ReputationTable::new());
    (PeerManager::new(&config, reputation.clone()), reputation)
}

#[rstest]
#[case(0.0, 5)]
#[case(30.0, 4)]
#[case(60.0, 3)]
#[case(80.0, 2)]
#[case(100.0, 1)]
fn test_best_peer_stays_within_tolerance_band(#[case] top_best: f64, #[case] lowest_td: u64) {
    let (mut manager, _) = manager(top_best);
    let mut td_by_peer = HashMap::new();
    for td in 1..=5u64 {
        let peer = PeerId::random();
        manager.update_status(peer, status(td * 10, td), false);
        td_by_peer.insert(peer, td);
    }

    let mut seen_lowest = u64::MAX;
    for _ in 0..200 {
        let peer = manager.best_peer(BlockDifficulty::ZERO).unwrap();
        let td = td_by_peer[&peer];
        assert!(td >= lowest_td, "picked td {td} below band floor {lowest_td}");
        seen_lowest = seen_lowest.min(td);
    }
    if lowest_td == 5 {
        assert_eq!(seen_lowest, 5);
    }
}

#[test]
fn test_candidates_must_beat_local_difficulty() {
    let (mut manager, _) = manager(0.0);
    let ahead = PeerId::random();
    let equal = PeerId::random();
    let behind = PeerId::random();
    manager.update_status(ahead, status(20, 20), false);
    manager.update_status(equal, status(10, 10), false);
    manager.update_status(behind, status(5, 5), false);

    let local = BlockDifficulty::from(10);
    assert_eq!(manager.best_peer_candidates(local), vec![ahead]);
    assert_eq!(manager.best_peer(local), Some(ahead));
    assert_eq!(manager.best_or_equal_peer(local), Some(ahead));
    assert_eq!(manager.best_peer(BlockDifficulty::from(20)), None);
    assert_eq!(manager.best_or_equal_peer(BlockDifficulty::from(20)), Some(ahead));
}

#[test]
fn test_best_or_equal_accepts_peer_level_with_us() {
    let (mut manager, _) = manager(0.0);
    let level = PeerId::random();
    let behind = PeerId::random();
    manager.update_status(level, status(10, 10), false);
    manager.update_status(behind, status(9, 9), false);

    let local = BlockDifficulty::from(10);
    assert_eq!(manager.best_peer(local), None);
    assert_eq!(manager.best_or_equal_peer(local), Some(level));
}

#[test]
fn test_bad_reputation_excludes_peer() {
    let (mut manager, reputation) = manager(100.0);
    let honest = PeerId::random();
    let cheater = PeerId::random();
    manager.update_status(honest, status(10, 10), false);
    manager.update_status(cheater, status(50, 50), false);

    reputation.record_event(&cheater, EventType::InvalidBlock, "forged block");

    for _ in 0..20 {
        assert_eq!(manager.best_peer(BlockDifficulty::ZERO), Some(honest));
    }
    assert_eq!(manager.count(), 2);
    assert!(!manager.has_good_reputation(&cheater));
}

#[tokio::test(start_paused = true)]
async fn test_recently_failed_peer_is_avoided_while_others_exist() {
    let (mut manager, _) = manager(100.0);
    let failed = PeerId::random();
    let healthy = PeerId::random();
    manager.update_status(failed, status(50, 50), false);
    manager.update_status(healthy, status(40, 40), false);

    manager.process_syncing_error(&failed);
    for _ in 0..20 {
        assert_eq!(manager.best_peer(BlockDifficulty::ZERO), Some(healthy));
    }

    // A failed peer is still better than none.
    manager.remove_peer(&healthy);
    assert_eq!(manager.best_peer(BlockDifficulty::ZERO), Some(failed));

    tokio::time::advance(TIME_LIMIT_FAILURE_RECORD + Duration::from_secs(1)).await;
    manager.clear_old_failed_peers();
    assert!(!manager.is_recently_failed(&failed));
}

#[tokio::test(start_paused = true)]
async fn test_expired_status_is_dropped() {
    let (mut manager, _) = manager(0.0);
    let stale = PeerId::random();
    let fresh = PeerId::random();
    manager.update_status(stale, status(10, 10), false);

    tokio::time::advance(Duration::from_secs(400)).await;
    manager.update_status(fresh, status(10, 10), false);
    tokio::time::advance(Duration::from_secs(201)).await;

    assert_eq!(manager.count(), 1);
    assert_eq!(manager.best_peer_candidates(BlockDifficulty::ZERO), vec![fresh]);
    assert_eq!(manager.clean_expired(), vec![stale]);
    assert!(manager.get_peer(&stale).is_none());
}

#[test]
fn test_snap_candidates_include_boot_nodes() {
    let boot = PeerId::random();
    let config = SyncConfig {
        snap_boot_nodes: vec![boot],
        ..SyncConfig::default()
    };
    let mut manager = PeerManager::new(&config, Arc::new(ReputationTable::new()));
    let capable = PeerId::random();
    let plain = PeerId::random();
    manager.update_status(boot, status(100, 100), false);
    manager.update_status(capable, status(100, 100), true);
    manager.update_status(plain, status(100, 100), false);

    let mut snap: Vec<PeerId> = manager
        .snap_candidates(BlockDifficulty::ZERO)
        .into_iter()
        .map(|peer| peer.peer_id)
        .collect();
    snap.sort();
    let mut expected = vec![boot, capable];
    expected.sort();
    assert_eq!(snap, expected);
    assert!(manager.is_snap_boot_node(&boot));
    assert_ne!(manager.best_snap_peer(BlockDifficulty::ZERO), Some(plain));
}

#[test]
fn test_registered_peer_without_status_is_not_counted() {
    let (mut manager, _) = manager(0.0);
    let peer = PeerId::random();
    manager.register_peer(peer);

    assert!(manager.get_peer(&peer).is_some());
    assert_eq!(manager.count(), 0);
    assert_eq!(manager.best_peer(BlockDifficulty::ZERO), None);
}
