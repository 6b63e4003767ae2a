/// Chain synchronization engine.
///
/// This module brings the local chain up to the heaviest chain known to its
/// peers. It includes:
///
/// - **Peer Manager**: Tracks peer chain status and picks peers to sync from
/// - **Request Ledger**: Matches every response to the request that asked for it
/// - **Connection Point**: Binary search for the last block shared with a peer
/// - **Chunks**: Skeleton trimming, header chunks and body segments
/// - **Block Cache**: Holds bodies that completed before their parents
/// - **States**: One handler per sync phase
/// - **Sync Service**: Routes events to the active state and applies transitions
///
/// ## Architecture
///
/// The sync service operates reactively:
/// 1. Peer statuses, responses and ticks arrive as events on one queue
/// 2. The active state handles each event to completion
/// 3. Requests are sent without waiting; answers come back as new events
/// 4. A state that is done returns a transition and the service builds the next one
///
/// ## Modes
///
/// - **Forward**: connection point, skeleton, headers, then bodies from many peers
/// - **Backward**: header and body rounds below the lowest stored block down to genesis
/// - **Snap**: checkpoint validation, then delegation to the snapshot processor
pub mod block_cache;
pub mod chunks;
pub mod config;
pub mod connection_point;
pub mod error;
pub mod events;
pub mod ledger;
pub mod peer_manager;
pub mod service;
pub mod states;

pub use block_cache::BlockCache;
pub use config::*;
pub use connection_point::ConnectionPointFinder;
pub use error::SyncError;
pub use events::SyncEvent;
pub use ledger::{LedgerVerdict, RequestLedger};
pub use peer_manager::{PeerManager, SyncPeer};
pub use service::{SyncService, SyncStats};
pub use states::{SyncPhase, SyncState, Transition};

#[cfg(test)]
mod tests;
