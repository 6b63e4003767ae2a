use crate::Bytes32;
use serde::{Deserialize, Serialize};

/// Request for `count` consecutive headers ending at `hash`, newest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub hash: Bytes32,
    pub count: u64,
}

impl ChunkDescriptor {
    pub fn new(hash: Bytes32, count: u64) -> Self {
        Self { hash, count }
    }
}
