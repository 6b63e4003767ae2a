/// Block cache for bodies that completed ahead of their parents.
///
/// Forward body downloads run on several peers at once, so a block can be
/// assembled before its parent is stored. Such blocks wait here until the
/// parent lands in the block store, then leave the cache parent-first.
use std::collections::{HashMap, HashSet, VecDeque};

use containers::{Block, BlockNumber, Bytes32};

#[derive(Debug, Default, Clone)]
pub struct BlockCache {
    /// All cached blocks, indexed by block hash
    blocks: HashMap<Bytes32, Block>,

    /// Blocks whose parent is not in the cache
    orphans: HashSet<Bytes32>,

    /// Children of each block (parent hash -> child hashes)
    children: HashMap<Bytes32, HashSet<Bytes32>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block to the cache. Returns the block hash.
    pub fn add_block(&mut self, block: Block) -> Bytes32 {
        let hash = block.hash();
        let parent_hash = block.parent_hash();

        self.blocks.insert(hash, block);
        self.children.entry(parent_hash).or_default().insert(hash);

        if !self.blocks.contains_key(&parent_hash) {
            self.orphans.insert(hash);
        }

        if let Some(children) = self.children.get(&hash) {
            for child in children {
                self.orphans.remove(child);
            }
        }

        hash
    }

    pub fn get_block(&self, hash: &Bytes32) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Check if a block's parent is missing from the cache.
    pub fn is_orphan(&self, hash: &Bytes32) -> bool {
        self.orphans.contains(hash)
    }

    pub fn get_orphans(&self) -> Vec<Bytes32> {
        self.orphans.iter().copied().collect()
    }

    /// Parent hashes that neither the cache nor the caller knows.
    pub fn get_missing_parents(&self) -> Vec<Bytes32> {
        self.orphans
            .iter()
            .filter_map(|hash| self.blocks.get(hash).map(Block::parent_hash))
            .filter(|parent| !self.blocks.contains_key(parent))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get_children(&self, hash: &Bytes32) -> Vec<Bytes32> {
        self.children
            .get(hash)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every block that descends from a parent `is_stored` accepts.
    ///
    /// Blocks come out parent-first, so each one can be imported right after
    /// the one before it.
    pub fn drain_connected(&mut self, is_stored: impl Fn(&Bytes32) -> bool) -> Vec<Block> {
        let mut roots: Vec<(BlockNumber, Bytes32)> = self
            .orphans
            .iter()
            .filter_map(|hash| self.blocks.get(hash))
            .filter(|block| is_stored(&block.parent_hash()))
            .map(|block| (block.number(), block.hash()))
            .collect();
        roots.sort();

        let mut queue: VecDeque<Bytes32> = roots.into_iter().map(|(_, hash)| hash).collect();
        let mut drained = Vec::new();
        while let Some(hash) = queue.pop_front() {
            let mut children = self.get_children(&hash);
            children.sort();
            queue.extend(children);
            if let Some(block) = self.remove_block(&hash) {
                drained.push(block);
            }
        }
        drained
    }

    /// Remove a block from the cache, orphaning its children.
    pub fn remove_block(&mut self, hash: &Bytes32) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        self.orphans.remove(hash);

        let parent_hash = block.parent_hash();
        if let Some(children) = self.children.get_mut(&parent_hash) {
            children.remove(hash);
            if children.is_empty() {
                self.children.remove(&parent_hash);
            }
        }

        if let Some(children) = self.children.get(hash) {
            for child in children {
                if self.blocks.contains_key(child) {
                    self.orphans.insert(*child);
                }
            }
        }

        Some(block)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.orphans.clear();
        self.children.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
