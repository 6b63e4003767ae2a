use crate::{BlockDifficulty, BlockNumber, Bytes32};
use serde::{Deserialize, Serialize};

/// A peer's self-reported chain tip.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub best_block_number: BlockNumber,
    pub best_block_hash: Bytes32,
    pub total_difficulty: BlockDifficulty,
}

impl Status {
    pub fn new(
        best_block_number: BlockNumber,
        best_block_hash: Bytes32,
        total_difficulty: BlockDifficulty,
    ) -> Self {
        Self {
            best_block_number,
            best_block_hash,
            total_difficulty,
        }
    }
}
