//! Lease-recovery commits and distributed-upgrade pass-through.
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::inventory::BlockDirectory;
use crate::types::{BlockId, BlockSynchronization, GenerationStamp, PoolId, UpgradeCommand};

/// Outcome of a recovery commit
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    /// The commit was applied
    Applied,
    /// The (block, generation stamp) pair was already applied; repeated
    /// delivery, e.g. due to a transport retry, is a no-op
    Duplicate,
}

/// Tracks which (block, generation stamp) pairs have been committed, so
/// a recovery episode can be re-delivered safely.
#[derive(Default)]
pub(crate) struct RecoveryLog {
    applied: Mutex<IndexMap<(PoolId, BlockId), GenerationStamp>>,
}

impl RecoveryLog {
    /// Finalize a block's state after lease recovery. Idempotent with
    /// respect to the (block, new generation stamp) pair: generation
    /// stamps are monotonic, so any commit at or below the recorded stamp
    /// is a re-delivery of an episode already applied and must not roll
    /// the block back.
    pub(crate) async fn commit(
        &self,
        directory: &BlockDirectory,
        sync: &BlockSynchronization,
    ) -> CommitOutcome {
        let key = (sync.block.pool_id.clone(), sync.block.block.id);
        let mut applied = self.applied.lock().await;
        if applied
            .get(&key)
            .is_some_and(|recorded| sync.new_gen_stamp <= *recorded)
        {
            debug!(
                message = "Duplicate recovery commit ignored",
                block = sync.block.block.id,
                gen_stamp = sync.new_gen_stamp,
            );
            return CommitOutcome::Duplicate;
        }

        let pool = directory.pool(&sync.block.pool_id).await;
        let mut state = pool.lock().await;
        if sync.delete_block {
            state.blocks.swap_remove(&sync.block.block.id);
            state.invalidated.insert(sync.block.block.id);
        } else {
            let meta = state.blocks.entry(sync.block.block.id).or_default();
            meta.gen_stamp = sync.new_gen_stamp;
            meta.length = sync.new_length;
            meta.replicas = sync
                .new_targets
                .iter()
                .map(|t| t.storage_id.clone())
                .collect();
            meta.closed |= sync.close_file;
        }
        info!(
            message = "Committed block synchronization",
            pool_id = sync.block.pool_id,
            block = sync.block.block.id,
            gen_stamp = sync.new_gen_stamp,
            deleted = sync.delete_block,
        );
        applied.insert(key, sync.new_gen_stamp);
        CommitOutcome::Applied
    }
}

/// Hook for distributed-upgrade coordination. The control plane routes
/// [UpgradeCommand]s through this without interpreting their payloads, so
/// upgrade logic can evolve without protocol changes.
pub trait UpgradeCoordinator: Send + Sync {
    /// Process one upgrade command from a worker and produce the reply
    fn process(&self, command: UpgradeCommand) -> UpgradeCommand;
}

/// Coordinator used when no distributed upgrade is in progress: replies
/// with an empty payload at the incoming version.
#[derive(Debug, Default)]
pub struct NoUpgrade;

impl UpgradeCoordinator for NoUpgrade {
    fn process(&self, command: UpgradeCommand) -> UpgradeCommand {
        UpgradeCommand {
            version: command.version,
            payload: Vec::new(),
        }
    }
}
