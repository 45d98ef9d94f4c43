//! The closed set of directives a controller can issue to a worker and the
//! closed set of alarm codes a worker can raise.
//!
//! Commands are only ever delivered piggy-backed on worker-initiated calls;
//! the controller never contacts a worker on its own.
use serde::{Deserialize, Serialize};

use crate::types::{Block, GenerationStamp, PoolId, WorkerIdentity};

/// A directive from the controller, consumed exactly once by the worker
/// that receives it. No ordering is promised between commands in one
/// response batch beyond array order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Placeholder for directives this software version cannot interpret
    Unknown,
    /// Copy the given blocks to the named destination workers
    Transfer {
        /// Pool the blocks belong to
        pool_id: PoolId,
        /// Blocks to copy
        blocks: Vec<Block>,
        /// Destination workers, one list per block
        targets: Vec<Vec<WorkerIdentity>>,
    },
    /// Delete the given local block replicas
    Invalidate {
        /// Pool the blocks belong to
        pool_id: PoolId,
        /// Blocks to delete locally
        blocks: Vec<Block>,
    },
    /// Cease operation
    Shutdown,
    /// Drop all session state and register again before resuming
    /// heartbeats
    Register,
    /// Finalize a previously started distributed upgrade
    Finalize {
        /// Pool to finalize
        pool_id: PoolId,
    },
    /// Lead lease recovery for the given blocks
    RecoverBlock {
        /// Blocks to recover
        recoveries: Vec<BlockRecovery>,
    },
    /// Replace the worker's access keys
    AccessKeyUpdate {
        /// New key material, opaque to the control plane
        keys: Vec<AccessKey>,
    },
    /// Change the bandwidth budget for balancing transfers
    BalancerBandwidthUpdate {
        /// New budget in bytes per second
        bytes_per_second: u64,
    },
}

impl WorkerCommand {
    /// Numeric action code of this command. The code points are fixed
    /// for interoperability and log correlation.
    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Transfer { .. } => 1,
            Self::Invalidate { .. } => 2,
            Self::Shutdown => 3,
            Self::Register => 4,
            Self::Finalize { .. } => 5,
            Self::RecoverBlock { .. } => 6,
            Self::AccessKeyUpdate { .. } => 7,
            Self::BalancerBandwidthUpdate { .. } => 8,
        }
    }
}

/// One block recovery assignment within a [WorkerCommand::RecoverBlock]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockRecovery {
    /// Pool the block belongs to
    pub pool_id: PoolId,
    /// The block left in an inconsistent state
    pub block: Block,
    /// Generation stamp to roll the surviving replicas forward to
    pub new_gen_stamp: GenerationStamp,
    /// Workers believed to hold a replica to recover from
    pub sources: Vec<WorkerIdentity>,
}

/// A single access key, carried opaquely; token mechanics are outside the
/// control plane
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessKey {
    /// Key serial number
    pub serial: u64,
    /// Expiry as milliseconds since the epoch
    pub expiry_ms: u64,
    /// Opaque key material
    pub material: Vec<u8>,
}

/// Fault classes a worker can raise out-of-band via an error report
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmCode {
    /// Informational notice
    Notify,
    /// A volume failed, but valid volumes remain
    DiskError,
    /// The worker detected a corrupt local block
    InvalidBlock,
    /// No usable storage left; the worker is expected to cease normal
    /// operation after sending this
    FatalDiskError,
}

impl AlarmCode {
    /// Numeric code of this alarm, fixed for interoperability
    pub fn code(&self) -> u8 {
        match self {
            Self::Notify => 0,
            Self::DiskError => 1,
            Self::InvalidBlock => 2,
            Self::FatalDiskError => 3,
        }
    }

    /// True if the worker has no usable storage left and should stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalDiskError)
    }
}
