//! Compile-time-enumerated capability table exchanged at session start.
//!
//! This replaces dynamic signature negotiation: both sides enumerate the
//! methods they support and any mismatch fails fast before partial
//! interoperation can happen.
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::RemoteError;

/// Monotonic version of the control protocol itself
pub const PROTOCOL_VERSION: u32 = 28;

/// Every logical operation of the control protocol
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Identity establishment
    Register,
    /// Liveness and capacity reporting
    Heartbeat,
    /// Bulk inventory reconciliation
    FullBlockReport,
    /// Incremental received/deleted events
    IncrementalBlockReport,
    /// Out-of-band fault notification
    ErrorReport,
    /// Namespace version query
    VersionRequest,
    /// Opaque upgrade exchange
    ProcessUpgrade,
    /// Corrupt replica reporting
    ReportBadBlocks,
    /// Lease recovery commit
    CommitBlockSynchronization,
}

impl Method {
    /// The complete method set of this protocol version
    pub const ALL: [Method; 9] = [
        Method::Register,
        Method::Heartbeat,
        Method::FullBlockReport,
        Method::IncrementalBlockReport,
        Method::ErrorReport,
        Method::VersionRequest,
        Method::ProcessUpgrade,
        Method::ReportBadBlocks,
        Method::CommitBlockSynchronization,
    ];
}

/// Protocol version plus the methods a party supports
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProtocolCapabilities {
    /// Protocol version the party speaks
    pub version: u32,
    /// Methods the party implements at that version
    pub methods: IndexSet<Method>,
}

impl ProtocolCapabilities {
    /// The capability table of this build
    pub fn current() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            methods: Method::ALL.into_iter().collect(),
        }
    }

    /// Verify a remote table is usable from this side: same protocol
    /// version and every method of this build present remotely
    pub fn check_compatible(&self, remote: &Self) -> Result<(), RemoteError> {
        if self.version != remote.version || !self.methods.is_subset(&remote.methods) {
            return Err(RemoteError::VersionMismatch {
                controller: self.version,
                worker: remote.version,
            });
        }
        Ok(())
    }
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self::current()
    }
}
