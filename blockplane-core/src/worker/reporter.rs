//! Buffering and delivery of incremental block events.
//!
//! Storage machinery pushes received/deleted events through a
//! [BlockEventQueue]; the agent drains them into per-pool batches and
//! delivers them alongside heartbeats. Events survive delivery failure:
//! they stay buffered until the controller acknowledges them.
use flume::{Receiver, Sender};
use itertools::Itertools;
use tracing::warn;

use crate::types::{PoolId, ReceivedDeletedBlockInfo, WorkerIdentity};

use super::client::{ControlClient, ControlError};

/// Handle for enqueueing block events from storage code.
/// Cheap to clone; all clones feed the same reporter.
#[derive(Clone)]
pub struct BlockEventQueue {
    tx: Sender<(PoolId, ReceivedDeletedBlockInfo)>,
}

impl BlockEventQueue {
    /// Record that a block was received or deleted locally
    pub fn push(&self, pool_id: PoolId, event: ReceivedDeletedBlockInfo) {
        // the reporter holds the receiver for the lifetime of the agent
        if let Err(flume::SendError((pool_id, _))) = self.tx.send((pool_id, event)) {
            warn!(
                message = "Dropping block event, the worker agent has shut down",
                pool_id = %pool_id
            );
        }
    }
}

/// Agent-side end of the event queue
pub(crate) struct IncrementalReporter {
    rx: Receiver<(PoolId, ReceivedDeletedBlockInfo)>,
    // delivered only on acknowledgement, so nothing is lost across
    // transient controller failures
    unsent: Vec<(PoolId, ReceivedDeletedBlockInfo)>,
}

impl IncrementalReporter {
    pub(crate) fn new() -> (BlockEventQueue, Self) {
        let (tx, rx) = flume::unbounded();
        (
            BlockEventQueue { tx },
            Self {
                rx,
                unsent: Vec::new(),
            },
        )
    }

    /// True if any events await delivery
    pub(crate) fn has_pending(&self) -> bool {
        !self.unsent.is_empty() || !self.rx.is_empty()
    }

    /// Deliver all buffered events grouped by pool.
    ///
    /// On failure the undelivered events remain buffered in their
    /// original order and the error is returned to the caller.
    pub(crate) async fn flush(
        &mut self,
        client: &ControlClient,
        identity: &WorkerIdentity,
    ) -> Result<(), ControlError> {
        self.unsent.extend(self.rx.drain());
        if self.unsent.is_empty() {
            return Ok(());
        }
        let batches = self
            .unsent
            .iter()
            .cloned()
            .into_group_map()
            .into_iter()
            .collect_vec();
        for (pool_id, events) in batches {
            client
                .incremental_block_report(identity.clone(), pool_id.clone(), events)
                .await?;
            // acknowledged, forget this pool's slice of the buffer
            self.unsent.retain(|(pool, _)| *pool != pool_id);
        }
        Ok(())
    }
}
