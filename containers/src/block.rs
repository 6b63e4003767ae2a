use crate::{BlockDifficulty, BlockNumber, Bytes32};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Opaque transaction payload. The sync layer only needs its hash.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Transaction {
    pub fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(&self.0);
        finalize(hasher)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: Bytes32,
    pub number: BlockNumber,
    pub difficulty: BlockDifficulty,
    pub timestamp: u64,
    pub transactions_root: Bytes32,
    pub uncles_hash: Bytes32,
    #[serde(with = "hex_bytes", default)]
    pub extra_data: Vec<u8>,
}

impl BlockHeader {
    /// Header committing to an empty body.
    pub fn new(parent_hash: Bytes32, number: BlockNumber, difficulty: BlockDifficulty) -> Self {
        Self {
            parent_hash,
            number,
            difficulty,
            timestamp: number,
            transactions_root: transactions_root(&[]),
            uncles_hash: uncles_hash(&[]),
            extra_data: Vec::new(),
        }
    }

    pub fn genesis(difficulty: BlockDifficulty) -> Self {
        Self::new(Bytes32::ZERO, 0, difficulty)
    }

    pub fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_hash.as_slice());
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.transactions_root.as_slice());
        hasher.update(self.uncles_hash.as_slice());
        hasher.update(&self.extra_data);
        finalize(hasher)
    }

    pub fn identifier(&self) -> BlockIdentifier {
        BlockIdentifier::new(self.hash(), self.number)
    }

    pub fn is_parent_of(&self, child: &BlockHeader) -> bool {
        child.parent_hash == self.hash() && child.number == self.number + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn new(transactions: Vec<Transaction>, uncles: Vec<BlockHeader>) -> Self {
        Self { transactions, uncles }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("transactions root mismatch for block {number}")]
    TransactionsRootMismatch { number: BlockNumber },
    #[error("uncles hash mismatch for block {number}")]
    UnclesHashMismatch { number: BlockNumber },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Assembles a block, rejecting bodies that the header does not commit to.
    pub fn new(header: BlockHeader, body: BlockBody) -> Result<Self, BlockError> {
        if transactions_root(&body.transactions) != header.transactions_root {
            return Err(BlockError::TransactionsRootMismatch {
                number: header.number,
            });
        }
        if uncles_hash(&body.uncles) != header.uncles_hash {
            return Err(BlockError::UnclesHashMismatch {
                number: header.number,
            });
        }
        Ok(Self { header, body })
    }

    /// Block with an empty body.
    pub fn empty(header: BlockHeader) -> Self {
        Self {
            header,
            body: BlockBody::default(),
        }
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent_hash(&self) -> Bytes32 {
        self.header.parent_hash
    }

    /// Difficulty this block adds to the chain total, uncles included.
    pub fn cumulative_difficulty(&self) -> BlockDifficulty {
        self.header.difficulty + self.body.uncles.iter().map(|u| u.difficulty).sum()
    }

    pub fn is_parent_of(&self, child: &Block) -> bool {
        self.header.is_parent_of(&child.header)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentifier {
    pub hash: Bytes32,
    pub number: BlockNumber,
}

impl BlockIdentifier {
    pub fn new(hash: Bytes32, number: BlockNumber) -> Self {
        Self { hash, number }
    }
}

pub fn transactions_root(transactions: &[Transaction]) -> Bytes32 {
    let mut hasher = Sha256::new();
    for tx in transactions {
        hasher.update(tx.hash().as_slice());
    }
    finalize(hasher)
}

pub fn uncles_hash(uncles: &[BlockHeader]) -> Bytes32 {
    let mut hasher = Sha256::new();
    for uncle in uncles {
        hasher.update(uncle.hash().as_slice());
    }
    finalize(hasher)
}

fn finalize(hasher: Sha256) -> Bytes32 {
    let bytes: [u8; 32] = hasher.finalize().into();
    Bytes32::from(bytes)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn child_of(parent: &BlockHeader, difficulty: u64) -> BlockHeader {
        BlockHeader::new(parent.hash(), parent.number + 1, BlockDifficulty::from(difficulty))
    }

    #[test]
    fn parent_relation_checks_hash_and_number() {
        let genesis = BlockHeader::genesis(BlockDifficulty::from(1));
        let one = child_of(&genesis, 2);
        assert!(genesis.is_parent_of(&one));
        assert!(!one.is_parent_of(&genesis));

        let mut skipped = one.clone();
        skipped.number = 5;
        assert!(!genesis.is_parent_of(&skipped));
    }

    #[test]
    fn hash_changes_with_contents() {
        let genesis = BlockHeader::genesis(BlockDifficulty::from(1));
        let mut other = genesis.clone();
        other.extra_data = vec![1];
        assert_ne!(genesis.hash(), other.hash());
    }

    #[test]
    fn block_rejects_body_not_committed_by_header() {
        let header = BlockHeader::new(Bytes32::ZERO, 1, BlockDifficulty::from(1));
        let body = BlockBody::new(vec![Transaction(vec![0xde, 0xad])], vec![]);
        assert_eq!(
            Block::new(header.clone(), body.clone()),
            Err(BlockError::TransactionsRootMismatch { number: 1 })
        );

        let mut committed = header;
        committed.transactions_root = transactions_root(&body.transactions);
        let block = Block::new(committed, body).unwrap();
        assert_eq!(block.body.transactions.len(), 1);
    }

    #[test]
    fn cumulative_difficulty_includes_uncles() {
        let uncle = BlockHeader::new(Bytes32::ZERO, 1, BlockDifficulty::from(4));
        let mut header = BlockHeader::new(Bytes32::ZERO, 2, BlockDifficulty::from(10));
        header.uncles_hash = uncles_hash(std::slice::from_ref(&uncle));
        let block = Block::new(header, BlockBody::new(vec![], vec![uncle])).unwrap();
        assert_eq!(block.cumulative_difficulty(), BlockDifficulty::from(14));
    }

    #[test]
    fn header_serializes_extra_data_as_hex() {
        let mut header = BlockHeader::genesis(BlockDifficulty::from(1));
        header.extra_data = vec![0xab, 0xcd];
        let json = serde_json::to_string(&header).unwrap();
        assert!(json.contains("\"0xabcd\""));
        let back: BlockHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back, header);
    }
}
