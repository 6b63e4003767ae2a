//! Sync engine configuration.
//!
//! Operational parameters for synchronization: peer admission, timeouts,
//! chunk sizes and snap sync thresholds.
use anyhow::{Context, Result};
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Number of consecutive headers validated before trusting a snap checkpoint.
pub const HEADERS_VALIDATION_COUNT: u64 = 64;

/// How long a failed peer is deprioritized for selection.
pub const TIME_LIMIT_FAILURE_RECORD: Duration = Duration::from_secs(600);

/// Interval between sync ticks (in seconds).
pub const SYNC_TICK_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Peers needed to decide without waiting for the peer timeout.
    pub expected_peers: usize,
    #[serde(with = "duration_secs")]
    pub timeout_waiting_peers: Duration,
    #[serde(with = "duration_secs")]
    pub timeout_waiting_request: Duration,
    /// Statuses older than this are ignored.
    #[serde(with = "duration_secs")]
    pub expiration_time_peer_status: Duration,
    pub max_skeleton_chunks: u64,
    pub chunk_size: u64,
    /// Backward body requests kept in flight.
    pub max_requested_bodies: usize,
    /// Below this distance forward sync only runs once history reaches genesis.
    pub long_sync_limit: u64,
    /// Best-peer tolerance band, in percent of the difficulty spread.
    pub top_best: f64,
    pub check_best_header: bool,
    pub snap_client_enabled: bool,
    pub snap_sync_limit: u64,
    pub snap_checkpoint_granularity: u64,
    pub snap_confirmation_depth: u64,
    pub snap_boot_nodes: Vec<PeerId>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            expected_peers: 5,
            timeout_waiting_peers: Duration::from_secs(60),
            timeout_waiting_request: Duration::from_secs(30),
            expiration_time_peer_status: Duration::from_secs(600),
            max_skeleton_chunks: 20,
            chunk_size: 192,
            max_requested_bodies: 20,
            long_sync_limit: 64,
            top_best: 0.0,
            check_best_header: true,
            snap_client_enabled: false,
            snap_sync_limit: 10_000,
            snap_checkpoint_granularity: 5_000,
            snap_confirmation_depth: 3_840,
            snap_boot_nodes: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open sync config {}", path.display()))?;
        let config: SyncConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse sync config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(self.max_skeleton_chunks > 0, "max_skeleton_chunks must be positive");
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.top_best),
            "top_best must be within 0..=100, got {}",
            self.top_best
        );
        anyhow::ensure!(
            self.snap_checkpoint_granularity > 0,
            "snap_checkpoint_granularity must be positive"
        );
        Ok(())
    }

    pub fn is_snap_boot_node(&self, peer_id: &PeerId) -> bool {
        self.snap_boot_nodes.contains(peer_id)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
