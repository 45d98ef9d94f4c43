//! Shared helpers for exercising the control plane in tests
mod communication;

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::command::WorkerCommand;
use crate::protocol::PROTOCOL_VERSION;
use crate::types::{
    Block, HeartbeatReport, NamespaceInfo, PoolId, WorkerIdentity, WorkerRegistration,
};
use crate::worker::{CommandHandler, LocalStorage};

pub(crate) use communication::{FlakyCommunication, NoCommunication, NoCommunicationError};

/// Install a log subscriber so failing tests print their tracing output.
/// Repeated calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Namespace info matching the versions [test_registration] presents
pub(crate) fn test_namespace() -> NamespaceInfo {
    NamespaceInfo {
        namespace_id: 4711,
        layout_version: 0,
        software_version: PROTOCOL_VERSION,
    }
}

/// A registration candidate; pass an empty id for a first-ever start
pub(crate) fn test_registration(storage_id: &str) -> WorkerRegistration {
    WorkerRegistration {
        identity: WorkerIdentity {
            storage_id: storage_id.to_owned(),
            address: "10.0.0.1:50010".to_owned(),
            pool: "pool0".to_owned(),
        },
        software_version: PROTOCOL_VERSION,
        layout_version: 0,
        epoch: 0,
    }
}

/// In-memory block store. Clones share the same inventory, so tests can
/// mutate it while an agent reports from it.
#[derive(Default, Clone)]
pub(crate) struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    pools: IndexMap<PoolId, Vec<Block>>,
    report: HeartbeatReport,
}

impl MemoryStorage {
    pub(crate) fn insert_block(&self, pool_id: &str, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        inner.pools.entry(pool_id.to_owned()).or_default().push(block);
    }

    pub(crate) fn set_report(&self, report: HeartbeatReport) {
        let mut inner = self.inner.lock().unwrap();
        inner.report = report;
    }
}

impl LocalStorage for MemoryStorage {
    fn heartbeat_report(&self) -> HeartbeatReport {
        let inner = self.inner.lock().unwrap();
        inner.report
    }

    fn pools(&self) -> Vec<PoolId> {
        let inner = self.inner.lock().unwrap();
        inner.pools.keys().cloned().collect()
    }

    fn pool_blocks(&self, pool_id: &PoolId) -> Vec<Block> {
        let inner = self.inner.lock().unwrap();
        inner.pools.get(pool_id).cloned().unwrap_or_default()
    }
}

/// Captures every command an agent forwards to its handler
#[derive(Default, Clone)]
pub(crate) struct RecordingHandler {
    commands: Arc<Mutex<Vec<WorkerCommand>>>,
}

impl RecordingHandler {
    pub(crate) fn received(&self) -> Vec<WorkerCommand> {
        let commands = self.commands.lock().unwrap();
        commands.clone()
    }
}

impl CommandHandler for RecordingHandler {
    fn handle(&mut self, command: WorkerCommand) {
        self.commands.lock().unwrap().push(command);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexSet;
    use tokio::time::timeout;

    use super::*;
    use crate::command::AlarmCode;
    use crate::controller::Controller;
    use crate::transport::channel::InterThreadCommunication;
    use crate::types::ReceivedDeletedBlockInfo;
    use crate::worker::{WorkerAgent, WorkerError};

    const E2E_TIMEOUT: Duration = Duration::from_secs(10);

    struct Cluster {
        controller: Controller,
        storage: MemoryStorage,
        handler: RecordingHandler,
        comm: InterThreadCommunication,
        serve: tokio::task::JoinHandle<()>,
    }

    impl Cluster {
        fn start() -> Self {
            init_tracing();
            let comm = InterThreadCommunication::new();
            let controller = Controller::new(test_namespace());
            let serve = controller.serve(comm.clone());
            Self {
                controller,
                storage: MemoryStorage::default(),
                handler: RecordingHandler::default(),
                comm,
                serve,
            }
        }

        fn agent(
            &self,
            storage_id: &str,
        ) -> WorkerAgent<InterThreadCommunication, MemoryStorage, RecordingHandler> {
            WorkerAgent::builder()
                .comm(self.comm.clone())
                .storage(self.storage.clone())
                .handler(self.handler.clone())
                .address("127.0.0.1:50010".to_owned())
                .pool("pool0".to_owned())
                .storage_id(storage_id.to_owned())
                .heartbeat_interval(Duration::from_millis(5))
                .build()
        }

        /// Wait until the worker's latest heartbeat is visible
        async fn await_heartbeat(&self, storage_id: &str) {
            let id = storage_id.to_owned();
            let mut rev = self.controller.changed();
            timeout(E2E_TIMEOUT, async {
                while self.controller.last_report(&id).await.is_none() {
                    rev.changed().await.unwrap();
                }
            })
            .await
            .unwrap();
        }
    }

    impl Drop for Cluster {
        fn drop(&mut self) {
            self.serve.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_session_end_to_end() {
        let cluster = Cluster::start();
        let id = "BW-e2e".to_owned();
        let pool = "pool0".to_owned();
        cluster.storage.insert_block(&pool, Block::new(1, 1));
        cluster.storage.insert_block(&pool, Block::new(2, 1));
        cluster.storage.set_report(HeartbeatReport {
            capacity: 1000,
            used: 2,
            remaining: 998,
            ..HeartbeatReport::default()
        });

        let agent = cluster.agent(&id);
        let events = agent.block_events();
        let running = tokio::spawn(agent.run());

        cluster.await_heartbeat(&id).await;
        assert_eq!(
            cluster.controller.last_report(&id).await.unwrap().capacity,
            1000
        );
        // the initial full report seeded the inventory
        assert_eq!(
            cluster.controller.worker_inventory(&id, &pool).await,
            IndexSet::from([1, 2])
        );

        // an incremental event shows up without a new full report
        events.push(
            pool.clone(),
            ReceivedDeletedBlockInfo::Received {
                block: Block::new(3, 1),
                delete_hint: None,
            },
        );
        let mut rev = cluster.controller.changed();
        timeout(E2E_TIMEOUT, async {
            while !cluster
                .controller
                .worker_inventory(&id, &pool)
                .await
                .contains(&3)
            {
                rev.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // queued commands reach the handler, Shutdown ends the agent
        cluster
            .controller
            .issue(&id, WorkerCommand::Finalize { pool_id: pool.clone() })
            .await
            .unwrap();
        cluster
            .controller
            .issue(&id, WorkerCommand::Shutdown)
            .await
            .unwrap();
        timeout(E2E_TIMEOUT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            cluster.handler.received(),
            vec![WorkerCommand::Finalize { pool_id: pool }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_alarm_is_reported_then_stops_the_agent() {
        let cluster = Cluster::start();
        let id = "BW-alarm".to_owned();

        let agent = cluster.agent(&id);
        let alarms = agent.alarms();
        let running = tokio::spawn(agent.run());
        cluster.await_heartbeat(&id).await;

        alarms.raise(AlarmCode::FatalDiskError, "all volumes failed");
        let result = timeout(E2E_TIMEOUT, running).await.unwrap().unwrap();
        assert!(matches!(result, Err(WorkerError::FatalAlarm(_))));
        // the controller still considers the session registered
        assert!(cluster.controller.last_report(&id).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_recovers_from_forced_reregistration() {
        let cluster = Cluster::start();
        let id = "BW-forced".to_owned();
        let pool = "pool0".to_owned();
        cluster.storage.insert_block(&pool, Block::new(8, 2));

        let agent = cluster.agent(&id);
        let running = tokio::spawn(agent.run());
        cluster.await_heartbeat(&id).await;

        cluster.controller.force_reregistration(&id).await.unwrap();
        // a command issued into the doomed session may be dropped with
        // the session, so re-issue until the fresh session delivers it
        timeout(E2E_TIMEOUT, async {
            loop {
                let _ = cluster
                    .controller
                    .issue(&id, WorkerCommand::Finalize { pool_id: pool.clone() })
                    .await;
                if !cluster.handler.received().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // the re-registered session carries a fresh full report
        assert!(cluster
            .controller
            .worker_inventory(&id, &pool)
            .await
            .contains(&8));

        cluster
            .controller
            .issue(&id, WorkerCommand::Shutdown)
            .await
            .unwrap();
        timeout(E2E_TIMEOUT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_backs_off_through_refused_dials_then_connects() {
        let cluster = Cluster::start();
        let id = "BW-flaky".to_owned();

        let agent = WorkerAgent::builder()
            .comm(FlakyCommunication::new(cluster.comm.clone(), 2))
            .storage(cluster.storage.clone())
            .handler(cluster.handler.clone())
            .address("127.0.0.1:50010".to_owned())
            .pool("pool0".to_owned())
            .storage_id(id.clone())
            .heartbeat_interval(Duration::from_millis(5))
            .build();
        let running = tokio::spawn(agent.run());

        // the refused dials are retried until the backend accepts
        cluster.await_heartbeat(&id).await;
        cluster
            .controller
            .issue(&id, WorkerCommand::Shutdown)
            .await
            .unwrap();
        timeout(E2E_TIMEOUT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn refusing_backend_surfaces_as_connect_failure() {
        let result = crate::worker::ControlClient::connect(&NoCommunication);
        assert!(result.is_err());
    }
}
