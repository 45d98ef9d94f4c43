//! Types shared across the blockplane control plane
mod block;
mod identity;
mod report;

pub use block::{
    blocks_from_flat, blocks_to_flat, Block, BlockSynchronization, ExtendedBlock, FlatReportError,
    LocatedBlock, UpgradeCommand,
};
pub use identity::{NamespaceInfo, WorkerIdentity, WorkerRegistration};
pub use report::{HeartbeatReport, ReceivedDeletedBlockInfo};

/// Uniquely identifies a storage worker across its registration lifetime.
/// The controller is the sole authority for assigning these.
pub type StorageId = String;

/// Identifies a block pool, a namespace partition grouping a subset of blocks
pub type PoolId = String;

/// Identifies a single block within a pool
pub type BlockId = u64;

/// Monotonic version counter for a block's content, used to resolve
/// recovery conflicts
pub type GenerationStamp = u64;

/// Registration epoch, bumped by the controller on every successful
/// registration of a storage id
pub type RegistrationEpoch = u64;
