use anyhow::{Result, bail};
use containers::BlockHeader;
use libp2p_identity::PeerId;

/// State snapshot transfer. Progress is reported back to the synchronizer as events.
pub trait SnapshotProcessor: Send + Sync {
    /// Starts a transfer from `peer` anchored at `checkpoint`. A trusted boot
    /// peer is started without a checkpoint.
    fn start_syncing(&self, peer_id: PeerId, checkpoint: Option<BlockHeader>) -> Result<()>;
}

/// Used when the node has no snapshot transport.
pub struct DisabledSnapshotProcessor;

impl SnapshotProcessor for DisabledSnapshotProcessor {
    fn start_syncing(&self, peer_id: PeerId, _checkpoint: Option<BlockHeader>) -> Result<()> {
        bail!("snapshot transfer from {peer_id} requested but not available")
    }
}
