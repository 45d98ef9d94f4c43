//! Worker identity and registration records
use serde::{Deserialize, Serialize};

use super::{PoolId, RegistrationEpoch, StorageId};

/// Stable identity of a storage worker.
///
/// The storage id is immutable once assigned; address and pool membership
/// are refreshed on re-registration after a restart.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Controller-assigned identifier, or empty on a first-ever start
    pub storage_id: StorageId,
    /// Network address the worker serves block traffic on
    pub address: String,
    /// Block pool this worker is a member of
    pub pool: PoolId,
}

impl WorkerIdentity {
    /// True if this identity still carries the first-start placeholder
    /// and needs a storage id assigned by the controller
    pub fn is_placeholder(&self) -> bool {
        self.storage_id.is_empty()
    }
}

/// Identity plus version information, produced for every `register` call.
/// The controller may rewrite the storage id in its response; the worker
/// must adopt the returned value verbatim.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkerRegistration {
    /// The worker's identity, possibly a placeholder before first
    /// registration
    pub identity: WorkerIdentity,
    /// Software version the worker is running
    pub software_version: u32,
    /// On-disk layout version the worker's storage uses
    pub layout_version: i32,
    /// Epoch assigned by the controller, bumped on every registration
    pub epoch: RegistrationEpoch,
}

/// Namespace version information returned by `version_request`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Identifier of the namespace this controller serves
    pub namespace_id: u64,
    /// Layout version the controller expects workers to use
    pub layout_version: i32,
    /// Software version the controller is running
    pub software_version: u32,
}
