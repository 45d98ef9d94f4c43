//! Worker sessions and the registration manager.
//!
//! The controller is the sole authority for storage-id assignment: a
//! candidate carrying the first-start placeholder gets a fresh id minted,
//! a candidate carrying a previously assigned id gets its address and pool
//! membership refreshed. Every registration bumps the epoch.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::info;

use crate::command::WorkerCommand;
use crate::protocol::RemoteError;
use crate::types::{
    HeartbeatReport, NamespaceInfo, StorageId, WorkerRegistration,
};

/// Controller-side state of one worker's session
#[derive(Debug)]
pub(crate) struct WorkerSession {
    /// Registration currently in force
    pub registration: WorkerRegistration,
    /// False once the session has been expired; every registered call
    /// then fails NotRegistered until registration is repeated
    pub active: bool,
    /// Liveness timestamp, updated by each heartbeat
    pub last_heartbeat: Option<Instant>,
    /// Capacity figures from the latest heartbeat
    pub last_report: Option<HeartbeatReport>,
    /// Commands awaiting the next heartbeat, drained in order
    pub pending: Vec<WorkerCommand>,
    /// Set when the controller wants this worker to drop its session and
    /// register again. The next heartbeat delivers a Register command and
    /// expires the session.
    pub reregister_required: bool,
}

impl WorkerSession {
    fn new(registration: WorkerRegistration) -> Self {
        Self {
            registration,
            active: true,
            last_heartbeat: None,
            last_report: None,
            pending: Vec::new(),
            reregister_required: false,
        }
    }
}

/// Send + Sync map of worker sessions.
///
/// Entries sit behind per-entry locks so mutations for one worker
/// serialize while distinct workers proceed in parallel. Every mutation
/// bumps a revision observable through [SessionMap::changed], so callers
/// can await state changes without polling.
#[derive(Clone)]
pub(crate) struct SessionMap {
    inner: Arc<RwLock<IndexMap<StorageId, Arc<Mutex<WorkerSession>>>>>,
    epochs: Arc<AtomicU64>,
    revision: watch::Sender<u64>,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            epochs: Arc::default(),
            revision: watch::Sender::new(0),
        }
    }
}

impl SessionMap {
    /// Register a worker, validating version compatibility and assigning
    /// a storage id where the candidate carries a placeholder.
    /// Re-registration of a known id replaces any prior session state.
    pub(crate) async fn register(
        &self,
        namespace: &NamespaceInfo,
        mut candidate: WorkerRegistration,
    ) -> Result<WorkerRegistration, RemoteError> {
        if candidate.software_version != namespace.software_version
            || candidate.layout_version != namespace.layout_version
        {
            return Err(RemoteError::VersionMismatch {
                controller: namespace.software_version,
                worker: candidate.software_version,
            });
        }

        if candidate.identity.is_placeholder() {
            candidate.identity.storage_id = mint_storage_id();
        }
        candidate.epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;

        let storage_id = candidate.identity.storage_id.clone();
        info!(
            message = "Registered worker",
            storage_id,
            address = candidate.identity.address,
            epoch = candidate.epoch,
        );
        let session = Arc::new(Mutex::new(WorkerSession::new(candidate.clone())));
        self.inner.write().await.insert(storage_id, session);
        self.bump();
        Ok(candidate)
    }

    /// Run `func` against a worker's session under its entry lock.
    /// Fails NotRegistered for unknown ids and expired sessions.
    pub(crate) async fn with_session<R>(
        &self,
        storage_id: &StorageId,
        func: impl FnOnce(&mut WorkerSession) -> R,
    ) -> Result<R, RemoteError> {
        let entry = self
            .inner
            .read()
            .await
            .get(storage_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotRegistered {
                storage_id: storage_id.clone(),
            })?;
        let mut session = entry.lock().await;
        if !session.active {
            return Err(RemoteError::NotRegistered {
                storage_id: storage_id.clone(),
            });
        }
        let result = func(&mut session);
        drop(session);
        self.bump();
        Ok(result)
    }

    /// Mark a worker for forced re-registration. Its next heartbeat
    /// delivers a single Register command and expires the session;
    /// heartbeats after that fail NotRegistered until registration is
    /// repeated.
    pub(crate) async fn force_reregistration(
        &self,
        storage_id: &StorageId,
    ) -> Result<(), RemoteError> {
        self.with_session(storage_id, |session| {
            session.reregister_required = true;
        })
        .await
    }

    /// Active workers whose last heartbeat is older than `timeout`
    pub(crate) async fn stale_workers(&self, timeout: Duration) -> Vec<StorageId> {
        let entries: Vec<_> = {
            let guard = self.inner.read().await;
            guard
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };
        let mut stale = Vec::new();
        for (id, entry) in entries {
            let session = entry.lock().await;
            if !session.active {
                continue;
            }
            match session.last_heartbeat {
                Some(at) if at.elapsed() <= timeout => {}
                _ => stale.push(id),
            }
        }
        stale
    }

    /// Observe session-state revisions; the value changes on every
    /// mutation
    pub(crate) fn changed(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Mint a fresh storage id for a first-ever registration
fn mint_storage_id() -> StorageId {
    format!("BW-{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_namespace, test_registration};

    #[tokio::test]
    async fn placeholder_gets_fresh_storage_id() {
        let sessions = SessionMap::default();
        let assigned = sessions
            .register(&test_namespace(), test_registration(""))
            .await
            .unwrap();
        assert!(!assigned.identity.storage_id.is_empty());
        assert_eq!(assigned.epoch, 1);
    }

    #[tokio::test]
    async fn existing_storage_id_is_reused() {
        let sessions = SessionMap::default();
        let assigned = sessions
            .register(&test_namespace(), test_registration("BW-keep"))
            .await
            .unwrap();
        assert_eq!(assigned.identity.storage_id, "BW-keep");
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let sessions = SessionMap::default();
        let mut candidate = test_registration("");
        candidate.software_version += 1;
        let err = sessions
            .register(&test_namespace(), candidate)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn expired_session_rejects_calls() {
        let sessions = SessionMap::default();
        let assigned = sessions
            .register(&test_namespace(), test_registration(""))
            .await
            .unwrap();
        let id = assigned.identity.storage_id.clone();

        sessions
            .with_session(&id, |session| session.active = false)
            .await
            .unwrap();
        let err = sessions.with_session(&id, |_| ()).await.unwrap_err();
        assert!(err.needs_reregistration());

        // registering again revives the session with a higher epoch
        let again = sessions
            .register(&test_namespace(), assigned)
            .await
            .unwrap();
        assert_eq!(again.identity.storage_id, id);
        assert_eq!(again.epoch, 2);
        assert!(sessions.with_session(&id, |_| ()).await.is_ok());
    }

    #[tokio::test]
    async fn revision_changes_on_mutation() {
        let sessions = SessionMap::default();
        let mut rev = sessions.changed();
        let before = *rev.borrow_and_update();
        sessions
            .register(&test_namespace(), test_registration(""))
            .await
            .unwrap();
        rev.changed().await.unwrap();
        assert!(*rev.borrow() > before);
    }
}
