pub mod scoring;
pub mod snapshot;
pub mod store;
pub mod validation;

pub use scoring::{EventType, PeerScoring, ReputationTable};
pub use snapshot::{DisabledSnapshotProcessor, SnapshotProcessor};
pub use store::{BlockStore, ImportOutcome, MemoryBlockStore, StoreError};
pub use validation::{
    BlockValidationRule, BodyCommitmentRule, DependentHeaderRule, HeaderValidationRule,
    NonZeroDifficultyRule, ParentLinkRule, Validators,
};
