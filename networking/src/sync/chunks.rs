//! Skeleton and chunk bookkeeping for forward downloads.
//!
//! A skeleton is a sparse list of block identifiers at chunk-size intervals.
//! Chunk `i` spans the headers between `skeleton[i]` (exclusive) and
//! `skeleton[i + 1]` (inclusive), clamped below by the connection point.

use std::collections::{BTreeSet, HashMap, VecDeque};

use containers::{BlockHeader, BlockIdentifier, BlockNumber, ChunkDescriptor};
use libp2p_identity::PeerId;

/// Drop leading identifiers that add nothing above the connection point, so
/// that `skeleton[0] <= connection_point < skeleton[1]`.
pub fn trim_skeleton(
    mut skeleton: Vec<BlockIdentifier>,
    connection_point: BlockNumber,
) -> Vec<BlockIdentifier> {
    let redundant = skeleton
        .windows(2)
        .take_while(|pair| pair[1].number <= connection_point)
        .count();
    skeleton.drain(..redundant);
    skeleton
}

/// A usable skeleton has strictly ascending numbers, starts at or below the
/// connection point and reaches above it.
pub fn is_valid_skeleton(skeleton: &[BlockIdentifier], connection_point: BlockNumber) -> bool {
    skeleton.len() >= 2
        && skeleton[0].number <= connection_point
        && skeleton[1].number > connection_point
        && skeleton.windows(2).all(|pair| pair[0].number < pair[1].number)
}

/// Hands out header chunks of the selected peer's skeleton, lowest first.
#[derive(Debug, Clone)]
pub struct ChunksDownloadHelper {
    skeleton: Vec<BlockIdentifier>,
    connection_point: BlockNumber,
    next_link: usize,
}

impl ChunksDownloadHelper {
    pub fn new(skeleton: Vec<BlockIdentifier>, connection_point: BlockNumber) -> Self {
        Self {
            skeleton,
            connection_point,
            next_link: 1,
        }
    }

    pub fn has_next_chunk(&self) -> bool {
        self.next_link < self.skeleton.len()
            && self.skeleton[self.next_link].number > self.connection_point
    }

    pub fn next_chunk(&mut self) -> Option<ChunkDescriptor> {
        if !self.has_next_chunk() {
            return None;
        }
        let chunk = self.chunk_at(self.next_link);
        self.next_link += 1;
        Some(chunk)
    }

    fn chunk_at(&self, link: usize) -> ChunkDescriptor {
        let anchor = self.skeleton[link];
        let previous = self.skeleton[link - 1].number.max(self.connection_point);
        ChunkDescriptor::new(anchor.hash, anchor.number - previous)
    }

    pub fn skeleton(&self) -> &[BlockIdentifier] {
        &self.skeleton
    }
}

/// Partition of header chunks among peers for body download.
///
/// Consecutive chunks that the same set of peers can serve form a segment.
/// A peer assigned to segment `s` can also serve every segment below `s`,
/// since its skeleton agreed with all of them.
#[derive(Debug, Clone, Default)]
pub struct Segments {
    chunks_by_segment: Vec<VecDeque<usize>>,
    segment_by_peer: HashMap<PeerId, usize>,
}

impl Segments {
    pub fn build(
        pending_headers: &[VecDeque<BlockHeader>],
        skeletons: &HashMap<PeerId, Vec<BlockIdentifier>>,
    ) -> Self {
        let mut segments = Segments::default();
        if pending_headers.is_empty() {
            return segments;
        }

        let mut segment_chunks = VecDeque::new();
        let mut segment = 0;
        let mut previous = available_peers(0, pending_headers, skeletons);
        let mut peers = previous.clone();
        segment_chunks.push_front(0);

        for chunk in 1..pending_headers.len() {
            peers = available_peers(chunk, pending_headers, skeletons);
            if peers != previous {
                let dropped: Vec<PeerId> = previous.difference(&peers).copied().collect();
                segments.insert(std::mem::take(&mut segment_chunks), &dropped, segment);
                segment += 1;
                previous = peers.clone();
            }
            segment_chunks.push_front(chunk);
        }

        let last: Vec<PeerId> = peers.into_iter().collect();
        segments.insert(segment_chunks, &last, segment);
        segments
    }

    fn insert(&mut self, chunks: VecDeque<usize>, peers: &[PeerId], segment: usize) {
        self.chunks_by_segment.push(chunks);
        for peer in peers {
            self.segment_by_peer.insert(*peer, segment);
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.segment_by_peer.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn segment_of(&self, peer_id: &PeerId) -> Option<usize> {
        self.segment_by_peer.get(peer_id).copied()
    }

    /// Take the lowest pending chunk the peer can serve, searching from its own
    /// segment downwards.
    pub fn take_chunk_for(&mut self, peer_id: &PeerId) -> Option<(usize, usize)> {
        let top = self.segment_of(peer_id)?;
        (0..=top).rev().find_map(|segment| {
            self.chunks_by_segment
                .get_mut(segment)
                .and_then(VecDeque::pop_back)
                .map(|chunk| (segment, chunk))
        })
    }

    /// Put a chunk back so the next idle peer picks it up first.
    pub fn requeue(&mut self, segment: usize, chunk: usize) {
        if let Some(chunks) = self.chunks_by_segment.get_mut(segment) {
            chunks.push_back(chunk);
        }
    }

    pub fn segment_count(&self) -> usize {
        self.chunks_by_segment.len()
    }

    pub fn chunks_in(&self, segment: usize) -> Vec<usize> {
        self.chunks_by_segment
            .get(segment)
            .map(|chunks| chunks.iter().rev().copied().collect())
            .unwrap_or_default()
    }
}

/// Peers whose skeleton names the newest header of `chunk` as its upper link.
fn available_peers(
    chunk: usize,
    pending_headers: &[VecDeque<BlockHeader>],
    skeletons: &HashMap<PeerId, Vec<BlockIdentifier>>,
) -> BTreeSet<PeerId> {
    let Some(newest) = pending_headers[chunk].back() else {
        return BTreeSet::new();
    };
    let hash = newest.hash();
    skeletons
        .iter()
        .filter(|(_, skeleton)| skeleton.get(chunk + 1).is_some_and(|id| id.hash == hash))
        .map(|(peer, _)| *peer)
        .collect()
}
