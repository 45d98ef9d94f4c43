//! Typed messages workers and the controller send to each other.
//!
//! Every call is a synchronous request/response pair. Requests are tagged
//! with a per-session call id so independent tasks on one worker can
//! interleave calls over a single transport.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{AlarmCode, WorkerCommand};
use crate::protocol::ProtocolCapabilities;
use crate::types::{
    BlockSynchronization, HeartbeatReport, LocatedBlock, NamespaceInfo, PoolId,
    ReceivedDeletedBlockInfo, StorageId, UpgradeCommand, WorkerIdentity, WorkerRegistration,
};

/// Correlates a response with the request it answers, unique per session
pub(crate) type CallId = u64;

/// Wire frame for a worker-initiated call
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct RequestEnvelope {
    pub(crate) call_id: CallId,
    pub(crate) request: ControlRequest,
}

/// Wire frame for the controller's answer
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct ResponseEnvelope {
    pub(crate) call_id: CallId,
    pub(crate) result: Result<ControlResponse, RemoteError>,
}

/// A worker-initiated call. The controller is purely reactive: these are
/// the only occasions on which it can hand out commands.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ControlRequest {
    /// Exchange capability tables before any other call
    Handshake(ProtocolCapabilities),
    /// Establish or refresh this worker's identity
    Register(WorkerRegistration),
    /// Periodic liveness and capacity report
    Heartbeat {
        /// Reporting worker
        identity: WorkerIdentity,
        /// Fresh capacity/load figures
        report: HeartbeatReport,
    },
    /// Authoritative reset of this worker's inventory for one pool.
    /// Blocks are flat paired integers, two per block.
    FullBlockReport {
        /// Reporting worker
        identity: WorkerIdentity,
        /// Pool the report covers
        pool_id: PoolId,
        /// Complete local inventory, flat-encoded
        blocks: Vec<u64>,
    },
    /// Incremental received/deleted block events
    IncrementalBlockReport {
        /// Reporting worker
        identity: WorkerIdentity,
        /// Pool the events concern
        pool_id: PoolId,
        /// Events in occurrence order
        events: Vec<ReceivedDeletedBlockInfo>,
    },
    /// Fire-and-forget fault notification
    ErrorReport {
        /// Reporting worker
        identity: WorkerIdentity,
        /// Fault class
        code: AlarmCode,
        /// Free-text description
        message: String,
    },
    /// Ask for the controller's namespace version information
    VersionRequest,
    /// Opaque distributed-upgrade exchange
    ProcessUpgrade {
        /// Calling worker
        identity: WorkerIdentity,
        /// Upgrade payload, not interpreted by the control plane
        command: UpgradeCommand,
    },
    /// Report corrupt replicas observed on other workers
    ReportBadBlocks {
        /// Reporting worker
        identity: WorkerIdentity,
        /// Corrupt replicas with their holders
        blocks: Vec<LocatedBlock>,
    },
    /// Commit a lease recovery. Idempotent on (block, new generation
    /// stamp); duplicate delivery is a no-op.
    CommitBlockSynchronization {
        /// Worker that led the recovery
        identity: WorkerIdentity,
        /// The finalized state
        sync: BlockSynchronization,
    },
}

/// The controller's answer to a [ControlRequest]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ControlResponse {
    /// The controller's capability table
    Handshake(ProtocolCapabilities),
    /// The registration the worker must adopt verbatim, including a
    /// possibly rewritten storage id
    Registered(WorkerRegistration),
    /// Pending commands in controller-chosen order, possibly empty
    Heartbeat(Vec<WorkerCommand>),
    /// The single obsolete-block command resulting from a full report,
    /// if any blocks need deleting
    FullBlockReport(Option<WorkerCommand>),
    /// Namespace version information
    Version(NamespaceInfo),
    /// Opaque upgrade reply
    Upgrade(UpgradeCommand),
    /// Acknowledgement with no payload
    Ack,
}

/// Failures the controller reports back over the wire.
///
/// Transport failures are not represented here; they surface as
/// [TransportError](crate::transport::TransportError) on the caller.
#[derive(Debug, Serialize, Deserialize, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Fatal: caller and callee do not speak compatible versions.
    /// The worker must not proceed to heartbeating.
    #[error("version mismatch: controller runs {controller}, worker sent {worker}")]
    VersionMismatch {
        /// Version on the controller side
        controller: u32,
        /// Version the worker presented
        worker: u32,
    },
    /// The identity is unknown or its session has been expired.
    /// Recoverable: re-register, then retry.
    #[error("worker {storage_id:?} is not registered")]
    NotRegistered {
        /// The rejected identity
        storage_id: StorageId,
    },
    /// The request was malformed, e.g. an odd-length flat block report
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// True if the caller can recover by registering again
    pub fn needs_reregistration(&self) -> bool {
        matches!(self, Self::NotRegistered { .. })
    }

    /// True if the caller must stop rather than retry
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}
