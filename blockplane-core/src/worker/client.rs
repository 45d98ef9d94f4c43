//! Typed client for the worker's single logical session against the
//! controller.
//!
//! Calls are correlated by id, so heartbeat, full-report and incremental
//! report callers may run in independent tasks over the one transport.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::command::{AlarmCode, WorkerCommand};
use crate::protocol::{
    CallId, ControlRequest, ControlResponse, ProtocolCapabilities, RemoteError, RequestEnvelope,
    ResponseEnvelope,
};
use crate::transport::{
    CommunicationBackendError, CommunicationClient, TransportError, WorkerControllerComm,
};
use crate::types::{
    BlockSynchronization, HeartbeatReport, LocatedBlock, NamespaceInfo, PoolId,
    ReceivedDeletedBlockInfo, UpgradeCommand, WorkerIdentity, WorkerRegistration,
};

type PendingCalls = Arc<Mutex<HashMap<CallId, oneshot::Sender<Result<ControlResponse, RemoteError>>>>>;

/// One worker's control session. Cheap to clone; all clones share the
/// underlying transport and call-id space.
#[derive(Clone)]
pub struct ControlClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    comm: Arc<CommunicationClient<RequestEnvelope, ResponseEnvelope>>,
    pending: PendingCalls,
    next_call: AtomicU64,
    pump: tokio::task::JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl ControlClient {
    /// Dial the controller and start the response pump.
    /// Must be called within a Tokio runtime.
    pub fn connect<C: WorkerControllerComm>(backend: &C) -> Result<Self, CommunicationBackendError> {
        let comm = Arc::new(CommunicationClient::worker_to_controller(backend)?);
        let pending: PendingCalls = Arc::default();
        let pump = tokio::spawn(pump_responses(Arc::clone(&comm), Arc::clone(&pending)));
        Ok(Self {
            inner: Arc::new(ClientInner {
                comm,
                pending,
                next_call: AtomicU64::new(0),
                pump,
            }),
        })
    }

    async fn call(&self, request: ControlRequest) -> Result<ControlResponse, ControlError> {
        let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.insert(call_id, tx);
        }
        let envelope = RequestEnvelope { call_id, request };
        if let Err(e) = self.inner.comm.send(envelope) {
            self.inner.pending.lock().unwrap().remove(&call_id);
            return Err(e.into());
        }
        let result = rx.await.map_err(|_| ControlError::SessionClosed)?;
        Ok(result?)
    }

    /// Exchange capability tables; any mismatch is fatal and the caller
    /// must not proceed to registration
    pub async fn handshake(&self) -> Result<ProtocolCapabilities, ControlError> {
        let ours = ProtocolCapabilities::current();
        match self.call(ControlRequest::Handshake(ours.clone())).await? {
            ControlResponse::Handshake(theirs) => {
                ours.check_compatible(&theirs)?;
                Ok(theirs)
            }
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Establish or refresh identity. The returned registration must be
    /// adopted verbatim, including a rewritten storage id.
    pub async fn register(
        &self,
        candidate: WorkerRegistration,
    ) -> Result<WorkerRegistration, ControlError> {
        match self.call(ControlRequest::Register(candidate)).await? {
            ControlResponse::Registered(assigned) => Ok(assigned),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Report liveness and capacity; returns the controller's pending
    /// commands, to be executed after this call returns
    pub async fn heartbeat(
        &self,
        identity: WorkerIdentity,
        report: HeartbeatReport,
    ) -> Result<Vec<WorkerCommand>, ControlError> {
        match self.call(ControlRequest::Heartbeat { identity, report }).await? {
            ControlResponse::Heartbeat(commands) => Ok(commands),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Upload the complete local inventory for one pool, flat-encoded.
    /// Returns the single obsolete-block command, if any.
    pub async fn full_block_report(
        &self,
        identity: WorkerIdentity,
        pool_id: PoolId,
        blocks: Vec<u64>,
    ) -> Result<Option<WorkerCommand>, ControlError> {
        let request = ControlRequest::FullBlockReport {
            identity,
            pool_id,
            blocks,
        };
        match self.call(request).await? {
            ControlResponse::FullBlockReport(command) => Ok(command),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Deliver incremental received/deleted events
    pub async fn incremental_block_report(
        &self,
        identity: WorkerIdentity,
        pool_id: PoolId,
        events: Vec<ReceivedDeletedBlockInfo>,
    ) -> Result<(), ControlError> {
        let request = ControlRequest::IncrementalBlockReport {
            identity,
            pool_id,
            events,
        };
        match self.call(request).await? {
            ControlResponse::Ack => Ok(()),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Fire-and-forget fault notification
    pub async fn error_report(
        &self,
        identity: WorkerIdentity,
        code: AlarmCode,
        message: String,
    ) -> Result<(), ControlError> {
        let request = ControlRequest::ErrorReport {
            identity,
            code,
            message,
        };
        match self.call(request).await? {
            ControlResponse::Ack => Ok(()),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Query the controller's namespace version information
    pub async fn version_request(&self) -> Result<NamespaceInfo, ControlError> {
        match self.call(ControlRequest::VersionRequest).await? {
            ControlResponse::Version(info) => Ok(info),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Opaque upgrade exchange
    pub async fn process_upgrade(
        &self,
        identity: WorkerIdentity,
        command: UpgradeCommand,
    ) -> Result<UpgradeCommand, ControlError> {
        match self
            .call(ControlRequest::ProcessUpgrade { identity, command })
            .await?
        {
            ControlResponse::Upgrade(reply) => Ok(reply),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Report corrupt replicas observed on other workers
    pub async fn report_bad_blocks(
        &self,
        identity: WorkerIdentity,
        blocks: Vec<LocatedBlock>,
    ) -> Result<(), ControlError> {
        match self
            .call(ControlRequest::ReportBadBlocks { identity, blocks })
            .await?
        {
            ControlResponse::Ack => Ok(()),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }

    /// Commit a lease recovery; safe to re-deliver
    pub async fn commit_block_synchronization(
        &self,
        identity: WorkerIdentity,
        sync: BlockSynchronization,
    ) -> Result<(), ControlError> {
        match self
            .call(ControlRequest::CommitBlockSynchronization { identity, sync })
            .await?
        {
            ControlResponse::Ack => Ok(()),
            _ => Err(ControlError::UnexpectedResponse),
        }
    }
}

/// Route responses to their awaiting callers until the transport ends
async fn pump_responses(
    comm: Arc<CommunicationClient<RequestEnvelope, ResponseEnvelope>>,
    pending: PendingCalls,
) {
    loop {
        match comm.recv_async().await {
            Ok(envelope) => {
                let waiter = pending.lock().unwrap().remove(&envelope.call_id);
                match waiter {
                    Some(tx) => {
                        // a dropped receiver means the caller gave up
                        let _ = tx.send(envelope.result);
                    }
                    None => debug!(
                        "Dropping response for unknown call {}",
                        envelope.call_id
                    ),
                }
            }
            Err(e) => {
                debug!("Control session transport ended: {e}");
                // wake all in-flight callers with SessionClosed
                pending.lock().unwrap().clear();
                return;
            }
        }
    }
}

/// Failure of a single control call as seen by the worker
#[derive(Debug, Error)]
pub enum ControlError {
    /// The controller rejected the call
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The transport failed unrecoverably
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The controller answered with a response of the wrong kind
    #[error("controller returned a response of unexpected kind")]
    UnexpectedResponse,
    /// The session ended while a call was in flight
    #[error("control session closed while awaiting a response")]
    SessionClosed,
}

impl ControlError {
    /// True if re-registering and retrying can recover this call
    pub fn needs_reregistration(&self) -> bool {
        matches!(self, Self::Remote(e) if e.needs_reregistration())
    }

    /// True if the worker must stop rather than retry
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_fatal())
    }
}
