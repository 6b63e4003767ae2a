use containers::BlockNumber;

/// Binary search for the highest block number shared with a peer.
///
/// `low` is always a height known to be present on both chains and `high`
/// one known to be absent locally. Each probe halves the range; the search
/// ends when the two bounds are adjacent and the connection point is `low`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPointFinder {
    low: BlockNumber,
    high: BlockNumber,
}

impl ConnectionPointFinder {
    pub fn new(low: BlockNumber, high: BlockNumber) -> Self {
        Self { low, high }
    }

    /// The connection point once the bounds have converged.
    pub fn connection_point(&self) -> Option<BlockNumber> {
        (self.high <= self.low.saturating_add(1)).then_some(self.low)
    }

    /// Next height to ask the peer about.
    pub fn probe(&self) -> BlockNumber {
        self.low + (self.high - self.low) / 2
    }

    /// The probed block is present locally.
    pub fn update_found(&mut self) {
        self.low = self.probe();
    }

    /// The probed block is absent locally.
    pub fn update_not_found(&mut self) {
        self.high = self.probe();
    }

    pub fn bounds(&self) -> (BlockNumber, BlockNumber) {
        (self.low, self.high)
    }
}
