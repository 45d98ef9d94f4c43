//! The controller's cluster-wide block inventory and its reconciliation
//! with worker reports.
//!
//! Pools are locked individually, so reports for one pool serialize while
//! other pools proceed in parallel. A full report is authoritative at the
//! instant its pool lock is held; incremental events processed after that
//! instant take precedence.
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{
    Block, BlockId, GenerationStamp, LocatedBlock, PoolId, ReceivedDeletedBlockInfo, StorageId,
};

/// What the controller knows about one block
#[derive(Debug, Default)]
pub(crate) struct BlockMeta {
    /// Highest generation stamp committed for this block
    pub gen_stamp: GenerationStamp,
    /// Block length, updated by recovery commits
    pub length: u64,
    /// Workers believed to hold a replica
    pub replicas: IndexSet<StorageId>,
    /// True once the owning file was closed after recovery
    pub closed: bool,
}

/// Per-pool inventory state
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    /// All blocks the controller tracks in this pool
    pub blocks: IndexMap<BlockId, BlockMeta>,
    /// Blocks deleted cluster-wide; any replica still reported for these
    /// is obsolete
    pub invalidated: IndexSet<BlockId>,
}

/// An instruction to delete one replica, produced by reconciliation and
/// queued as an Invalidate command for the owning worker
pub(crate) type ReplicaInvalidation = (StorageId, Block);

/// Cluster block map across all pools
#[derive(Default, Clone)]
pub(crate) struct BlockDirectory {
    pools: Arc<Mutex<IndexMap<PoolId, Arc<Mutex<PoolState>>>>>,
}

impl BlockDirectory {
    /// Entry for one pool, created on first touch. The outer lock is held
    /// only for the lookup.
    pub(crate) async fn pool(&self, pool_id: &PoolId) -> Arc<Mutex<PoolState>> {
        let mut pools = self.pools.lock().await;
        Arc::clone(pools.entry(pool_id.clone()).or_default())
    }

    /// Authoritative reset of one worker's inventory for a pool.
    ///
    /// Any block the controller believed this worker held, absent from
    /// the report, is considered lost from that worker. Reported blocks
    /// that are invalidated cluster-wide or carry a stale generation
    /// stamp come back as obsolete, to be deleted locally by the worker.
    pub(crate) async fn full_report(
        &self,
        worker: &StorageId,
        pool_id: &PoolId,
        reported: &[Block],
    ) -> Vec<Block> {
        let pool = self.pool(pool_id).await;
        let mut state = pool.lock().await;

        let reported_ids: IndexSet<BlockId> = reported.iter().map(|b| b.id).collect();
        for (id, meta) in state.blocks.iter_mut() {
            if !reported_ids.contains(id) {
                meta.replicas.swap_remove(worker);
            }
        }

        let mut obsolete = Vec::new();
        for block in reported {
            if state.invalidated.contains(&block.id) {
                obsolete.push(*block);
                continue;
            }
            let meta = state.blocks.entry(block.id).or_default();
            if meta.gen_stamp > block.gen_stamp {
                // replica missed a recovery, the content is stale
                obsolete.push(*block);
                meta.replicas.swap_remove(worker);
            } else {
                meta.gen_stamp = block.gen_stamp;
                meta.replicas.insert(worker.clone());
            }
        }
        // metas left with no replica anywhere would otherwise linger forever
        let PoolState { blocks, invalidated } = &mut *state;
        blocks.retain(|id, meta| !meta.replicas.is_empty() || invalidated.contains(id));
        debug!(
            message = "Processed full block report",
            worker,
            pool_id,
            reported = reported.len(),
            obsolete = obsolete.len(),
        );
        obsolete
    }

    /// Fold incremental received/deleted events into the running
    /// inventory. Returns replica invalidations to queue: deletion hints
    /// for over-replicated blocks and receipts of blocks already deleted
    /// cluster-wide.
    pub(crate) async fn incremental(
        &self,
        worker: &StorageId,
        pool_id: &PoolId,
        events: &[ReceivedDeletedBlockInfo],
    ) -> Vec<ReplicaInvalidation> {
        let pool = self.pool(pool_id).await;
        let mut state = pool.lock().await;

        let mut invalidations = Vec::new();
        for event in events {
            match event {
                ReceivedDeletedBlockInfo::Received { block, delete_hint } => {
                    if state.invalidated.contains(&block.id) {
                        invalidations.push((worker.clone(), *block));
                        continue;
                    }
                    let meta = state.blocks.entry(block.id).or_default();
                    meta.gen_stamp = meta.gen_stamp.max(block.gen_stamp);
                    meta.replicas.insert(worker.clone());
                    if let Some(hint) = delete_hint {
                        meta.replicas.swap_remove(hint);
                        invalidations.push((hint.clone(), *block));
                    }
                }
                ReceivedDeletedBlockInfo::Deleted { block } => {
                    if let Some(meta) = state.blocks.get_mut(&block.id) {
                        meta.replicas.swap_remove(worker);
                    }
                }
            }
        }
        invalidations
    }

    /// Drop the named corrupt replicas and queue their deletion. The
    /// block itself stays valid on its remaining replicas.
    pub(crate) async fn mark_bad(
        &self,
        blocks: &[LocatedBlock],
    ) -> Vec<(PoolId, ReplicaInvalidation)> {
        let mut invalidations = Vec::new();
        for located in blocks {
            let pool = self.pool(&located.block.pool_id).await;
            let mut state = pool.lock().await;
            if let Some(meta) = state.blocks.get_mut(&located.block.block.id) {
                for holder in &located.holders {
                    if meta.replicas.swap_remove(holder) {
                        invalidations.push((
                            located.block.pool_id.clone(),
                            (holder.clone(), located.block.block),
                        ));
                    }
                }
            }
        }
        invalidations
    }

    /// The block ids a worker currently holds in a pool, as reconciled
    pub(crate) async fn worker_blocks(
        &self,
        worker: &StorageId,
        pool_id: &PoolId,
    ) -> IndexSet<BlockId> {
        let pool = self.pool(pool_id).await;
        let state = pool.lock().await;
        state
            .blocks
            .iter()
            .filter(|(_, meta)| meta.replicas.contains(worker))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(id: BlockId, gen_stamp: GenerationStamp) -> ReceivedDeletedBlockInfo {
        ReceivedDeletedBlockInfo::Received {
            block: Block::new(id, gen_stamp),
            delete_hint: None,
        }
    }

    fn deleted(id: BlockId, gen_stamp: GenerationStamp) -> ReceivedDeletedBlockInfo {
        ReceivedDeletedBlockInfo::Deleted {
            block: Block::new(id, gen_stamp),
        }
    }

    #[tokio::test]
    async fn full_report_is_exact_not_additive() {
        let directory = BlockDirectory::default();
        let worker = "BW-1".to_string();
        let pool = "pool0".to_string();

        let obsolete = directory
            .full_report(&worker, &pool, &[Block::new(1, 1), Block::new(2, 1)])
            .await;
        assert!(obsolete.is_empty());
        let held = directory.worker_blocks(&worker, &pool).await;
        assert_eq!(held, IndexSet::from([1, 2]));

        // second report drops 1, adds 3
        let obsolete = directory
            .full_report(&worker, &pool, &[Block::new(2, 1), Block::new(3, 1)])
            .await;
        assert!(obsolete.is_empty());
        let held = directory.worker_blocks(&worker, &pool).await;
        assert_eq!(held, IndexSet::from([2, 3]));
    }

    #[tokio::test]
    async fn full_report_prunes_metas_with_no_replica_left() {
        let directory = BlockDirectory::default();
        let worker = "BW-1".to_string();
        let pool = "pool0".to_string();

        directory
            .full_report(&worker, &pool, &[Block::new(1, 1), Block::new(2, 1)])
            .await;
        // block 1 vanished from its only replica
        directory
            .full_report(&worker, &pool, &[Block::new(2, 1)])
            .await;

        let state = directory.pool(&pool).await;
        let state = state.lock().await;
        assert!(!state.blocks.contains_key(&1));
        assert!(state.blocks.contains_key(&2));
    }

    #[tokio::test]
    async fn full_report_overrides_prior_increments() {
        let directory = BlockDirectory::default();
        let worker = "BW-1".to_string();
        let pool = "pool0".to_string();

        directory
            .incremental(&worker, &pool, &[received(9, 1)])
            .await;
        assert!(directory.worker_blocks(&worker, &pool).await.contains(&9));

        directory
            .full_report(&worker, &pool, &[Block::new(1, 1)])
            .await;
        let held = directory.worker_blocks(&worker, &pool).await;
        assert_eq!(held, IndexSet::from([1]));
    }

    #[tokio::test]
    async fn incremental_delete_is_folded_immediately() {
        let directory = BlockDirectory::default();
        let worker = "BW-1".to_string();
        let pool = "pool0".to_string();

        directory
            .full_report(&worker, &pool, &[Block::new(1, 1), Block::new(2, 1)])
            .await;
        directory
            .incremental(&worker, &pool, &[deleted(1, 1)])
            .await;
        let held = directory.worker_blocks(&worker, &pool).await;
        assert_eq!(held, IndexSet::from([2]));
    }

    #[tokio::test]
    async fn deletion_hint_prunes_the_hinted_replica() {
        let directory = BlockDirectory::default();
        let pool = "pool0".to_string();
        let holder = "BW-old".to_string();
        let receiver = "BW-new".to_string();

        directory
            .full_report(&holder, &pool, &[Block::new(5, 1)])
            .await;
        let invalidations = directory
            .incremental(
                &receiver,
                &pool,
                &[ReceivedDeletedBlockInfo::Received {
                    block: Block::new(5, 1),
                    delete_hint: Some(holder.clone()),
                }],
            )
            .await;
        assert_eq!(invalidations, vec![(holder.clone(), Block::new(5, 1))]);
        assert!(!directory.worker_blocks(&holder, &pool).await.contains(&5));
        assert!(directory.worker_blocks(&receiver, &pool).await.contains(&5));
    }

    #[tokio::test]
    async fn stale_generation_stamp_is_obsolete() {
        let directory = BlockDirectory::default();
        let pool = "pool0".to_string();
        let fresh = "BW-fresh".to_string();
        let stale = "BW-stale".to_string();

        directory
            .full_report(&fresh, &pool, &[Block::new(7, 3)])
            .await;
        let obsolete = directory
            .full_report(&stale, &pool, &[Block::new(7, 2)])
            .await;
        assert_eq!(obsolete, vec![Block::new(7, 2)]);
        assert!(!directory.worker_blocks(&stale, &pool).await.contains(&7));
    }

    #[tokio::test]
    async fn bad_block_report_drops_named_replicas() {
        let directory = BlockDirectory::default();
        let pool = "pool0".to_string();
        let good = "BW-good".to_string();
        let corrupt = "BW-corrupt".to_string();

        directory
            .full_report(&good, &pool, &[Block::new(4, 1)])
            .await;
        directory
            .full_report(&corrupt, &pool, &[Block::new(4, 1)])
            .await;

        let located = LocatedBlock {
            block: crate::types::ExtendedBlock {
                pool_id: pool.clone(),
                block: Block::new(4, 1),
            },
            holders: vec![corrupt.clone()],
        };
        let invalidations = directory.mark_bad(&[located]).await;
        assert_eq!(
            invalidations,
            vec![(pool.clone(), (corrupt.clone(), Block::new(4, 1)))]
        );
        assert!(directory.worker_blocks(&good, &pool).await.contains(&4));
        assert!(!directory.worker_blocks(&corrupt, &pool).await.contains(&4));
    }

    /// Concurrent full and incremental reports may interleave in either
    /// order, but the pool lock serializes them and the later one wins
    /// for the blocks it covers.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_serialize_per_pool() {
        let directory = BlockDirectory::default();
        let worker = "BW-1".to_string();
        let pool = "pool0".to_string();

        directory
            .full_report(&worker, &pool, &[Block::new(1, 1)])
            .await;

        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let directory = directory.clone();
            let worker = worker.clone();
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    directory
                        .full_report(&worker, &pool, &[Block::new(1, 1), Block::new(2, 1)])
                        .await;
                } else {
                    directory
                        .incremental(&worker, &pool, &[received(2, 1)])
                        .await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        // every interleaving converges on the same replica set
        let held = directory.worker_blocks(&worker, &pool).await;
        assert_eq!(held, IndexSet::from([1, 2]));
    }

    proptest::proptest! {
        /// A full report is authoritative: whatever increments preceded
        /// it, the reconciled inventory afterwards is exactly the
        /// reported set.
        #[test]
        fn full_report_is_authoritative(
            increments in proptest::collection::vec(0u64..50, 0..20),
            reported in proptest::collection::hash_set(0u64..50, 0..20),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let held = rt.block_on(async {
                let directory = BlockDirectory::default();
                let worker = "BW-1".to_string();
                let pool = "pool0".to_string();
                let events: Vec<_> =
                    increments.iter().map(|id| received(*id, 1)).collect();
                directory.incremental(&worker, &pool, &events).await;
                let blocks: Vec<_> =
                    reported.iter().map(|id| Block::new(*id, 1)).collect();
                directory.full_report(&worker, &pool, &blocks).await;
                directory.worker_blocks(&worker, &pool).await
            });
            let expected: IndexSet<BlockId> = reported.iter().copied().collect();
            proptest::prop_assert_eq!(held, expected);
        }
    }
}
