use containers::{BlockBody, BlockHeader, BlockIdentifier, BlockNumber, Bytes32, ChunkDescriptor};
use std::fmt::{self, Display};

/// Identifier the coordinator assigns to every outbound request.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    BlockHash,
    BlockHeaders,
    BlockBody,
    Skeleton,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::BlockHash => "block_hash",
            MessageKind::BlockHeaders => "block_headers",
            MessageKind::BlockBody => "block_body",
            MessageKind::Skeleton => "skeleton",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Hash of the block at `number` on the peer's best chain.
    BlockHash { number: BlockNumber },
    /// Headers ending at `ChunkDescriptor::hash`, newest first.
    BlockHeaders(ChunkDescriptor),
    BlockBody { hash: Bytes32 },
    /// Block identifiers at chunk-size intervals starting from `start_number`.
    Skeleton { start_number: BlockNumber },
}

impl SyncRequest {
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncRequest::BlockHash { .. } => MessageKind::BlockHash,
            SyncRequest::BlockHeaders(_) => MessageKind::BlockHeaders,
            SyncRequest::BlockBody { .. } => MessageKind::BlockBody,
            SyncRequest::Skeleton { .. } => MessageKind::Skeleton,
        }
    }
}

impl Display for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRequest::BlockHash { number } => write!(f, "BlockHash(number={number})"),
            SyncRequest::BlockHeaders(chunk) => {
                write!(f, "BlockHeaders(hash={}, count={})", chunk.hash, chunk.count)
            }
            SyncRequest::BlockBody { hash } => write!(f, "BlockBody(hash={hash})"),
            SyncRequest::Skeleton { start_number } => {
                write!(f, "Skeleton(start_number={start_number})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResponse {
    BlockHash { hash: Bytes32 },
    BlockHeaders { headers: Vec<BlockHeader> },
    BlockBody { body: BlockBody },
    Skeleton { identifiers: Vec<BlockIdentifier> },
}

impl SyncResponse {
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncResponse::BlockHash { .. } => MessageKind::BlockHash,
            SyncResponse::BlockHeaders { .. } => MessageKind::BlockHeaders,
            SyncResponse::BlockBody { .. } => MessageKind::BlockBody,
            SyncResponse::Skeleton { .. } => MessageKind::Skeleton,
        }
    }
}
