pub mod block;
pub mod chunk;
pub mod status;
pub mod types;

pub use block::{Block, BlockBody, BlockError, BlockHeader, BlockIdentifier, Transaction};
pub use chunk::ChunkDescriptor;
pub use status::Status;
pub use types::{BlockDifficulty, BlockNumber, Bytes32};
