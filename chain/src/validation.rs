use containers::block::{transactions_root, uncles_hash};
use containers::{Block, BlockDifficulty, BlockHeader};
use std::sync::Arc;

/// Context-free header check.
pub trait HeaderValidationRule: Send + Sync {
    fn is_valid(&self, header: &BlockHeader) -> bool;
}

/// Header check against its parent header.
pub trait DependentHeaderRule: Send + Sync {
    fn validate(&self, header: &BlockHeader, parent: &BlockHeader) -> bool;
}

/// Check of an assembled block.
pub trait BlockValidationRule: Send + Sync {
    fn is_valid(&self, block: &Block) -> bool;
}

pub struct NonZeroDifficultyRule;

impl HeaderValidationRule for NonZeroDifficultyRule {
    fn is_valid(&self, header: &BlockHeader) -> bool {
        header.difficulty > BlockDifficulty::ZERO
    }
}

pub struct ParentLinkRule;

impl DependentHeaderRule for ParentLinkRule {
    fn validate(&self, header: &BlockHeader, parent: &BlockHeader) -> bool {
        parent.is_parent_of(header) && header.timestamp >= parent.timestamp
    }
}

pub struct BodyCommitmentRule;

impl BlockValidationRule for BodyCommitmentRule {
    fn is_valid(&self, block: &Block) -> bool {
        transactions_root(&block.body.transactions) == block.header.transactions_root
            && uncles_hash(&block.body.uncles) == block.header.uncles_hash
    }
}

#[derive(Clone)]
pub struct Validators {
    pub header: Arc<dyn HeaderValidationRule>,
    pub dependent: Arc<dyn DependentHeaderRule>,
    pub block: Arc<dyn BlockValidationRule>,
}

impl Default for Validators {
    fn default() -> Self {
        Self {
            header: Arc::new(NonZeroDifficultyRule),
            dependent: Arc::new(ParentLinkRule),
            block: Arc::new(BodyCommitmentRule),
        }
    }
}

impl Validators {
    /// Validates a run of headers ordered newest first.
    pub fn validate_descending(&self, headers: &[BlockHeader]) -> bool {
        headers.iter().all(|h| self.header.is_valid(h))
            && headers
                .windows(2)
                .all(|pair| self.dependent.validate(&pair[0], &pair[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use containers::{BlockBody, Bytes32, Transaction};

    fn descending(len: u64) -> Vec<BlockHeader> {
        let mut headers = vec![BlockHeader::genesis(BlockDifficulty::from(1))];
        for n in 1..len {
            let parent = headers[(n - 1) as usize].hash();
            headers.push(BlockHeader::new(parent, n, BlockDifficulty::from(1)));
        }
        headers.reverse();
        headers
    }

    #[test]
    fn descending_run_is_valid() {
        let validators = Validators::default();
        assert!(validators.validate_descending(&descending(5)));
    }

    #[test]
    fn broken_link_is_rejected() {
        let validators = Validators::default();
        let mut headers = descending(5);
        headers[2].extra_data = vec![7];
        assert!(!validators.validate_descending(&headers));
    }

    #[test]
    fn zero_difficulty_is_rejected() {
        let header = BlockHeader::new(Bytes32::ZERO, 1, BlockDifficulty::ZERO);
        assert!(!NonZeroDifficultyRule.is_valid(&header));
    }

    #[test]
    fn body_commitment_is_checked() {
        let header = BlockHeader::new(Bytes32::ZERO, 1, BlockDifficulty::from(1));
        let forged = Block {
            header,
            body: BlockBody::new(vec![Transaction(vec![1])], vec![]),
        };
        assert!(!BodyCommitmentRule.is_valid(&forged));
    }
}
