//! Status and block-event reports sent by workers
use serde::{Deserialize, Serialize};

use super::{Block, StorageId};

/// Capacity and load figures carried by every heartbeat.
/// Constructed fresh per call and never persisted by the protocol layer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatReport {
    /// Total storage capacity in bytes
    pub capacity: u64,
    /// Bytes used by the block store
    pub used: u64,
    /// Bytes still available to the block store
    pub remaining: u64,
    /// Bytes used by this worker's block pool
    pub pool_used: u64,
    /// Block transfers currently in flight from this worker
    pub xmits_in_progress: u32,
    /// Active connection-handler count
    pub active_handlers: u32,
    /// Number of storage volumes that have failed
    pub failed_volumes: u32,
}

/// One incremental block event, emitted as soon as a block is written,
/// re-replicated or deleted locally
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ReceivedDeletedBlockInfo {
    /// The worker now holds this block. The optional hint names a
    /// different replica that should be pruned cluster-wide because the
    /// block is now over-replicated.
    Received {
        /// The block received
        block: Block,
        /// Replica preferred for deletion, if any
        delete_hint: Option<StorageId>,
    },
    /// The worker no longer holds this block
    Deleted {
        /// The block deleted
        block: Block,
    },
}

impl ReceivedDeletedBlockInfo {
    /// The block this event concerns
    pub fn block(&self) -> &Block {
        match self {
            Self::Received { block, .. } => block,
            Self::Deleted { block } => block,
        }
    }
}
