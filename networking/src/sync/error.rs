use chain::StoreError;
use containers::{BlockDifficulty, BlockNumber, Bytes32};
use thiserror::Error;

/// Local-state violations that end the current sync attempt.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("genesis does not connect to block {number} ({hash})")]
    GenesisDoesNotConnect { number: BlockNumber, hash: Bytes32 },
    #[error(
        "total difficulty mismatch for block {hash}: recorded {recorded}, recomputed {recomputed}"
    )]
    DifficultyMismatch {
        hash: Bytes32,
        recorded: BlockDifficulty,
        recomputed: BlockDifficulty,
    },
    #[error("block {hash} has no recorded total difficulty")]
    MissingTotalDifficulty { hash: Bytes32 },
    #[error("block store holds no blocks")]
    NoStoredBlocks,
    #[error("local block {0} is missing")]
    MissingLocalBlock(Bytes32),
    #[error("block store failure: {0}")]
    Store(#[from] StoreError),
}
