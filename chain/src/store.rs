use containers::{Block, BlockDifficulty, BlockNumber, Bytes32};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("parent {parent} of block {number} is not stored")]
    UnknownParent { parent: Bytes32, number: BlockNumber },
    #[error("store write failed: {0}")]
    Write(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    AlreadyKnown,
    Imported { best: bool },
}

/// Local block storage as seen by the synchronizer.
pub trait BlockStore: Send + Sync {
    fn genesis(&self) -> Block;

    fn best_block(&self) -> Block;

    fn block_by_hash(&self, hash: &Bytes32) -> Option<Block>;

    fn block_by_number(&self, number: BlockNumber) -> Option<Block>;

    fn is_block_known(&self, hash: &Bytes32) -> bool {
        self.block_by_hash(hash).is_some()
    }

    /// Lowest block number held on the main chain. Zero when genesis is stored.
    fn min_stored_number(&self) -> BlockNumber;

    fn total_difficulty(&self, hash: &Bytes32) -> Option<BlockDifficulty>;

    fn save_block(
        &self,
        block: Block,
        total_difficulty: BlockDifficulty,
        main_chain: bool,
    ) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError>;

    fn lowest_block(&self) -> Option<Block> {
        self.block_by_number(self.min_stored_number())
    }

    fn best_total_difficulty(&self) -> BlockDifficulty {
        let best = self.best_block();
        self.total_difficulty(&best.hash()).unwrap_or_default()
    }

    /// Connects a block on top of a stored parent, deriving its total difficulty.
    fn connect_block(&self, block: Block) -> Result<ImportOutcome, StoreError> {
        if self.is_block_known(&block.hash()) {
            return Ok(ImportOutcome::AlreadyKnown);
        }
        let parent_td =
            self.total_difficulty(&block.parent_hash())
                .ok_or(StoreError::UnknownParent {
                    parent: block.parent_hash(),
                    number: block.number(),
                })?;
        let td = parent_td + block.cumulative_difficulty();
        let best = td > self.best_total_difficulty();
        self.save_block(block, td, best)?;
        Ok(ImportOutcome::Imported { best })
    }
}

struct StoredBlock {
    block: Block,
    total_difficulty: BlockDifficulty,
}

struct Inner {
    blocks: HashMap<Bytes32, StoredBlock>,
    main_chain: BTreeMap<BlockNumber, Bytes32>,
    best: Bytes32,
    flushes: u64,
}

/// In-memory store used by the binary and tests.
pub struct MemoryBlockStore {
    genesis: Block,
    inner: RwLock<Inner>,
}

impl MemoryBlockStore {
    /// Store holding only genesis.
    pub fn new(genesis: Block) -> Self {
        let td = genesis.cumulative_difficulty();
        Self::with_tip(genesis.clone(), genesis, td)
    }

    /// Store that starts from a trusted block above genesis, leaving a gap to backfill.
    pub fn from_checkpoint(
        genesis: Block,
        checkpoint: Block,
        total_difficulty: BlockDifficulty,
    ) -> Self {
        Self::with_tip(genesis, checkpoint, total_difficulty)
    }

    fn with_tip(genesis: Block, tip: Block, total_difficulty: BlockDifficulty) -> Self {
        let hash = tip.hash();
        let mut main_chain = BTreeMap::new();
        main_chain.insert(tip.number(), hash);
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            StoredBlock {
                block: tip,
                total_difficulty,
            },
        );
        Self {
            genesis,
            inner: RwLock::new(Inner {
                blocks,
                main_chain,
                best: hash,
                flushes: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.read().flushes
    }
}

impl BlockStore for MemoryBlockStore {
    fn genesis(&self) -> Block {
        self.genesis.clone()
    }

    fn best_block(&self) -> Block {
        let inner = self.inner.read();
        inner
            .blocks
            .get(&inner.best)
            .map(|stored| stored.block.clone())
            .unwrap_or_else(|| self.genesis.clone())
    }

    fn block_by_hash(&self, hash: &Bytes32) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .get(hash)
            .map(|stored| stored.block.clone())
    }

    fn block_by_number(&self, number: BlockNumber) -> Option<Block> {
        let inner = self.inner.read();
        let hash = inner.main_chain.get(&number)?;
        inner.blocks.get(hash).map(|stored| stored.block.clone())
    }

    fn min_stored_number(&self) -> BlockNumber {
        self.inner
            .read()
            .main_chain
            .keys()
            .next()
            .copied()
            .unwrap_or_default()
    }

    fn total_difficulty(&self, hash: &Bytes32) -> Option<BlockDifficulty> {
        self.inner
            .read()
            .blocks
            .get(hash)
            .map(|stored| stored.total_difficulty)
    }

    fn save_block(
        &self,
        block: Block,
        total_difficulty: BlockDifficulty,
        main_chain: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let hash = block.hash();
        let number = block.number();

        let best_td = inner
            .blocks
            .get(&inner.best)
            .map(|stored| stored.total_difficulty)
            .unwrap_or_default();
        if total_difficulty > best_td {
            inner.best = hash;
        }
        if main_chain {
            inner.main_chain.insert(number, hash);
        }
        inner.blocks.insert(
            hash,
            StoredBlock {
                block,
                total_difficulty,
            },
        );
        debug!(number, hash = %hash, td = %total_difficulty, "Stored block");
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.write().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use containers::BlockHeader;
    use pretty_assertions::assert_eq;

    fn chain(len: u64) -> Vec<Block> {
        let mut blocks = vec![Block::empty(BlockHeader::genesis(BlockDifficulty::from(1)))];
        for n in 1..len {
            let parent = blocks[(n - 1) as usize].header.hash();
            blocks.push(Block::empty(BlockHeader::new(
                parent,
                n,
                BlockDifficulty::from(n + 1),
            )));
        }
        blocks
    }

    #[test]
    fn connect_block_accumulates_difficulty() {
        let blocks = chain(4);
        let store = MemoryBlockStore::new(blocks[0].clone());

        for block in &blocks[1..] {
            assert_eq!(
                store.connect_block(block.clone()),
                Ok(ImportOutcome::Imported { best: true })
            );
        }

        assert_eq!(store.best_block().number(), 3);
        assert_eq!(
            store.total_difficulty(&blocks[3].hash()),
            Some(BlockDifficulty::from(1 + 2 + 3 + 4))
        );
        assert_eq!(store.min_stored_number(), 0);
    }

    #[test]
    fn connect_block_requires_parent() {
        let blocks = chain(3);
        let store = MemoryBlockStore::new(blocks[0].clone());
        assert_eq!(
            store.connect_block(blocks[2].clone()),
            Err(StoreError::UnknownParent {
                parent: blocks[1].hash(),
                number: 2
            })
        );
    }

    #[test]
    fn connect_block_twice_is_known() {
        let blocks = chain(2);
        let store = MemoryBlockStore::new(blocks[0].clone());
        store.connect_block(blocks[1].clone()).unwrap();
        assert_eq!(
            store.connect_block(blocks[1].clone()),
            Ok(ImportOutcome::AlreadyKnown)
        );
    }

    #[test]
    fn checkpoint_store_reports_gap() {
        let blocks = chain(10);
        let store = MemoryBlockStore::from_checkpoint(
            blocks[0].clone(),
            blocks[9].clone(),
            BlockDifficulty::from(55),
        );

        assert_eq!(store.min_stored_number(), 9);
        assert_eq!(store.lowest_block().map(|b| b.number()), Some(9));
        assert!(!store.is_block_known(&blocks[0].hash()));

        store
            .save_block(blocks[8].clone(), BlockDifficulty::from(45), true)
            .unwrap();
        assert_eq!(store.min_stored_number(), 8);
        assert_eq!(store.best_block().number(), 9);
    }
}
