//! The central metadata coordinator.
//!
//! The controller never initiates contact with a worker: it learns the
//! physical state of the cluster from worker-initiated calls and
//! piggy-backs every command onto their responses.
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use itertools::Itertools;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::inventory::{BlockDirectory, ReplicaInvalidation};
use super::recovery::{NoUpgrade, RecoveryLog, UpgradeCoordinator};
use super::session::SessionMap;
use crate::command::{AlarmCode, WorkerCommand};
use crate::protocol::{
    ControlRequest, ControlResponse, ProtocolCapabilities, RemoteError,
};
use crate::types::{
    blocks_from_flat, BlockId, HeartbeatReport, NamespaceInfo, PoolId, StorageId, WorkerIdentity,
};

/// The controller half of the control plane. Cheap to clone; all clones
/// share state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    capabilities: ProtocolCapabilities,
    namespace: NamespaceInfo,
    sessions: SessionMap,
    directory: BlockDirectory,
    recovery: RecoveryLog,
    upgrade: Box<dyn UpgradeCoordinator>,
}

impl Controller {
    /// Create a controller with no distributed upgrade in progress
    pub fn new(namespace: NamespaceInfo) -> Self {
        Self::with_upgrade(namespace, Box::new(NoUpgrade))
    }

    /// Create a controller routing upgrade commands through the given
    /// coordinator
    pub fn with_upgrade(namespace: NamespaceInfo, upgrade: Box<dyn UpgradeCoordinator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capabilities: ProtocolCapabilities::current(),
                namespace,
                sessions: SessionMap::default(),
                directory: BlockDirectory::default(),
                recovery: RecoveryLog::default(),
                upgrade,
            }),
        }
    }

    /// Serve worker sessions accepted from the given backend until the
    /// returned task is aborted. Must be called within a Tokio runtime.
    pub fn serve<C>(&self, comm: C) -> tokio::task::JoinHandle<()>
    where
        C: crate::transport::ControllerWorkerComm + Send + Sync + 'static,
    {
        tokio::spawn(super::communication::accept_loop(self.clone(), comm))
    }

    /// Dispatch one worker-initiated call. Each call is independently
    /// atomic; no multi-call transaction is offered.
    pub async fn handle(&self, request: ControlRequest) -> Result<ControlResponse, RemoteError> {
        match request {
            ControlRequest::Handshake(theirs) => self.handshake(theirs),
            ControlRequest::Register(candidate) => {
                let assigned = self
                    .inner
                    .sessions
                    .register(&self.inner.namespace, candidate)
                    .await?;
                Ok(ControlResponse::Registered(assigned))
            }
            ControlRequest::Heartbeat { identity, report } => {
                let commands = self.heartbeat(&identity, report).await?;
                Ok(ControlResponse::Heartbeat(commands))
            }
            ControlRequest::FullBlockReport {
                identity,
                pool_id,
                blocks,
            } => {
                let command = self.full_block_report(&identity, &pool_id, &blocks).await?;
                Ok(ControlResponse::FullBlockReport(command))
            }
            ControlRequest::IncrementalBlockReport {
                identity,
                pool_id,
                events,
            } => {
                self.require_session(&identity).await?;
                let invalidations = self
                    .inner
                    .directory
                    .incremental(&identity.storage_id, &pool_id, &events)
                    .await;
                self.queue_invalidations(&pool_id, invalidations).await;
                Ok(ControlResponse::Ack)
            }
            ControlRequest::ErrorReport {
                identity,
                code,
                message,
            } => {
                self.error_report(&identity, code, &message).await?;
                Ok(ControlResponse::Ack)
            }
            ControlRequest::VersionRequest => {
                Ok(ControlResponse::Version(self.inner.namespace.clone()))
            }
            ControlRequest::ProcessUpgrade { identity, command } => {
                self.require_session(&identity).await?;
                Ok(ControlResponse::Upgrade(self.inner.upgrade.process(command)))
            }
            ControlRequest::ReportBadBlocks { identity, blocks } => {
                self.require_session(&identity).await?;
                warn!(
                    message = "Worker reported corrupt replicas",
                    worker = identity.storage_id,
                    blocks = blocks.len(),
                );
                // bad-block reports may span pools
                let by_pool = self
                    .inner
                    .directory
                    .mark_bad(&blocks)
                    .await
                    .into_iter()
                    .into_group_map();
                for (pool_id, invalidations) in by_pool {
                    self.queue_invalidations(&pool_id, invalidations).await;
                }
                Ok(ControlResponse::Ack)
            }
            ControlRequest::CommitBlockSynchronization { identity, sync } => {
                self.require_session(&identity).await?;
                self.inner
                    .recovery
                    .commit(&self.inner.directory, &sync)
                    .await;
                Ok(ControlResponse::Ack)
            }
        }
    }

    fn handshake(&self, theirs: ProtocolCapabilities) -> Result<ControlResponse, RemoteError> {
        if theirs.version != self.inner.capabilities.version {
            return Err(RemoteError::VersionMismatch {
                controller: self.inner.capabilities.version,
                worker: theirs.version,
            });
        }
        Ok(ControlResponse::Handshake(self.inner.capabilities.clone()))
    }

    async fn heartbeat(
        &self,
        identity: &WorkerIdentity,
        report: HeartbeatReport,
    ) -> Result<Vec<WorkerCommand>, RemoteError> {
        self.inner
            .sessions
            .with_session(&identity.storage_id, |session| {
                if session.reregister_required {
                    // deliver the forced Register once and expire the
                    // session; the next heartbeat fails NotRegistered
                    session.reregister_required = false;
                    session.active = false;
                    return vec![WorkerCommand::Register];
                }
                session.last_heartbeat = Some(Instant::now());
                session.last_report = Some(report);
                std::mem::take(&mut session.pending)
            })
            .await
    }

    async fn full_block_report(
        &self,
        identity: &WorkerIdentity,
        pool_id: &PoolId,
        flat: &[u64],
    ) -> Result<Option<WorkerCommand>, RemoteError> {
        self.require_session(identity).await?;
        let blocks =
            blocks_from_flat(flat).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let obsolete = self
            .inner
            .directory
            .full_report(&identity.storage_id, pool_id, &blocks)
            .await;
        if obsolete.is_empty() {
            Ok(None)
        } else {
            Ok(Some(WorkerCommand::Invalidate {
                pool_id: pool_id.clone(),
                blocks: obsolete,
            }))
        }
    }

    async fn error_report(
        &self,
        identity: &WorkerIdentity,
        code: AlarmCode,
        message: &str,
    ) -> Result<(), RemoteError> {
        // the session stays valid even for fatal alarms; policy may still
        // deliver an explicit Shutdown afterwards
        self.require_session(identity).await?;
        let worker = &identity.storage_id;
        match code {
            AlarmCode::Notify => info!(message, worker, code = code.code()),
            AlarmCode::DiskError | AlarmCode::InvalidBlock => {
                warn!(message, worker, code = code.code())
            }
            AlarmCode::FatalDiskError => {
                error!(
                    message = "Worker has no usable storage left",
                    worker,
                    detail = message,
                )
            }
        }
        Ok(())
    }

    /// Queue replica invalidations as Invalidate commands for their
    /// owning workers, one command per worker. Invalidations for workers
    /// without an active session are dropped; the next full report from
    /// such a worker re-derives them.
    async fn queue_invalidations(&self, pool_id: &PoolId, invalidations: Vec<ReplicaInvalidation>) {
        let per_worker = invalidations.into_iter().into_group_map();
        for (worker, blocks) in per_worker {
            let command = WorkerCommand::Invalidate {
                pool_id: pool_id.clone(),
                blocks,
            };
            if let Err(e) = self.issue(&worker, command).await {
                debug!(
                    message = "Dropping invalidation for unregistered worker",
                    worker,
                    error = %e,
                );
            }
        }
    }

    /// Enqueue a command for delivery on the worker's next heartbeat.
    /// Entry point for external placement and balancing policy.
    pub async fn issue(
        &self,
        storage_id: &StorageId,
        command: WorkerCommand,
    ) -> Result<(), RemoteError> {
        self.inner
            .sessions
            .with_session(storage_id, |session| session.pending.push(command))
            .await
    }

    /// Force a worker to drop its session state and register again.
    /// Its next heartbeat receives a single Register command; heartbeats
    /// after that fail NotRegistered until registration is repeated.
    pub async fn force_reregistration(&self, storage_id: &StorageId) -> Result<(), RemoteError> {
        self.inner.sessions.force_reregistration(storage_id).await
    }

    /// Active workers whose last heartbeat is older than `timeout`.
    /// Marking such workers dead is up to the caller.
    pub async fn stale_workers(&self, timeout: Duration) -> Vec<StorageId> {
        self.inner.sessions.stale_workers(timeout).await
    }

    /// The reconciled block ids a worker holds in a pool
    pub async fn worker_inventory(
        &self,
        storage_id: &StorageId,
        pool_id: &PoolId,
    ) -> IndexSet<BlockId> {
        self.inner
            .directory
            .worker_blocks(storage_id, pool_id)
            .await
    }

    /// Capacity figures from a worker's latest heartbeat, if any
    pub async fn last_report(&self, storage_id: &StorageId) -> Option<HeartbeatReport> {
        self.inner
            .sessions
            .with_session(storage_id, |session| session.last_report)
            .await
            .ok()
            .flatten()
    }

    /// Observe controller-state revisions, e.g. to await a registration
    /// in tests without polling
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.inner.sessions.changed()
    }

    async fn require_session(&self, identity: &WorkerIdentity) -> Result<(), RemoteError> {
        self.inner
            .sessions
            .with_session(&identity.storage_id, |_| ())
            .await
    }
}
