//! Block descriptors and the flat paired-integer report encoding
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BlockId, GenerationStamp, PoolId, StorageId, WorkerIdentity};

/// A single block as known to one worker: its id and the generation stamp
/// of the content the worker holds.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    /// Block identifier, unique within a pool
    pub id: BlockId,
    /// Generation stamp of the locally held content
    pub gen_stamp: GenerationStamp,
}

impl Block {
    /// Create a new block descriptor
    pub fn new(id: BlockId, gen_stamp: GenerationStamp) -> Self {
        Self { id, gen_stamp }
    }
}

/// A block qualified with the pool it belongs to
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExtendedBlock {
    /// Pool the block belongs to
    pub pool_id: PoolId,
    /// The block itself
    pub block: Block,
}

/// A block together with the workers currently believed to hold a replica.
/// Used by bad-block reports to name the corrupt replicas.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LocatedBlock {
    /// The block in question
    pub block: ExtendedBlock,
    /// Workers holding a (possibly corrupt) replica
    pub holders: Vec<StorageId>,
}

/// Opaque versioned envelope exchanged symmetrically during distributed
/// upgrades. The control plane routes these without interpreting the
/// payload, so upgrade coordination data can change without protocol
/// changes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpgradeCommand {
    /// Upgrade protocol version the payload was produced for
    pub version: u32,
    /// Coordination data, meaningful only to the upgrade objects on
    /// either end
    pub payload: Vec<u8>,
}

/// One-shot commit finalizing a block's state after lease recovery
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockSynchronization {
    /// The block being finalized
    pub block: ExtendedBlock,
    /// Generation stamp the surviving replicas were rolled forward to
    pub new_gen_stamp: GenerationStamp,
    /// Agreed length of the recovered block
    pub new_length: u64,
    /// Whether the owning file should be closed after the commit
    pub close_file: bool,
    /// Whether the block should be deleted instead of finalized
    pub delete_block: bool,
    /// Replicas holding the block at the new generation stamp
    pub new_targets: Vec<WorkerIdentity>,
}

/// Encode a block list as a flat sequence of paired integers, two per
/// block. Full reports for fleets with very large inventories use this
/// instead of a list of records to bound payload size.
pub fn blocks_to_flat(blocks: &[Block]) -> Vec<u64> {
    blocks
        .iter()
        .flat_map(|b| [b.id, b.gen_stamp])
        .collect()
}

/// Decode a flat paired-integer sequence back into block descriptors
pub fn blocks_from_flat(flat: &[u64]) -> Result<Vec<Block>, FlatReportError> {
    if flat.len() % 2 != 0 {
        return Err(FlatReportError::OddLength(flat.len()));
    }
    Ok(flat
        .iter()
        .tuples()
        .map(|(id, gen_stamp)| Block::new(*id, *gen_stamp))
        .collect())
}

/// Error decoding a flat block report
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlatReportError {
    /// Flat reports carry exactly two integers per block
    #[error("flat block report has odd length {0}")]
    OddLength(usize),
}
