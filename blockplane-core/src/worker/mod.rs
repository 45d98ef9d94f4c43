//! Worker-side agent driving the control-plane session.
//!
//! The agent owns the full lifecycle against the controller: handshake,
//! registration, initial full block reports and the heartbeat loop.
//! Block storage itself is behind the [LocalStorage] trait; controller
//! commands other than `Register` and `Shutdown` are executed by a
//! [CommandHandler] supplied by the embedding process.
mod backoff;
mod client;
mod reporter;

use std::time::Duration;

use bon::Builder;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::command::{AlarmCode, WorkerCommand};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::WorkerControllerComm;
use crate::types::{
    blocks_to_flat, Block, HeartbeatReport, PoolId, RegistrationEpoch, StorageId, WorkerIdentity,
    WorkerRegistration,
};

use backoff::RetryPolicy;
use reporter::IncrementalReporter;

pub use client::{ControlClient, ControlError};
pub use reporter::BlockEventQueue;

/// View of the local block store the agent reports from
pub trait LocalStorage: Send {
    /// Fresh capacity and load figures for the next heartbeat
    fn heartbeat_report(&self) -> HeartbeatReport;
    /// Pools this worker stores blocks for
    fn pools(&self) -> Vec<PoolId>;
    /// Complete inventory of one pool
    fn pool_blocks(&self, pool_id: &PoolId) -> Vec<Block>;
}

/// Executes controller commands against the local block store.
///
/// `Register` and `Shutdown` never reach the handler; the agent acts on
/// those itself.
pub trait CommandHandler: Send {
    /// Execute one command. Commands from a single heartbeat arrive in
    /// the order the controller queued them.
    fn handle(&mut self, command: WorkerCommand);
}

/// Handle for raising storage alarms from anywhere in the worker process.
/// A fatal alarm stops the agent after it has been reported.
#[derive(Clone)]
pub struct AlarmSender {
    tx: flume::Sender<(AlarmCode, String)>,
}

impl AlarmSender {
    /// Raise an alarm to be forwarded to the controller
    pub fn raise(&self, code: AlarmCode, message: impl Into<String>) {
        // the agent holds the receiver for its whole lifetime
        let _ = self.tx.send((code, message.into()));
    }
}

/// The worker's control-plane agent.
///
/// Construct via the builder, hand out [WorkerAgent::block_events] and
/// [WorkerAgent::alarms] handles to the storage machinery, then call
/// [WorkerAgent::run] to drive the session until shutdown.
#[derive(Builder)]
pub struct WorkerAgent<C, S, H> {
    comm: C,
    storage: S,
    handler: H,
    /// Address this worker serves block traffic on
    address: String,
    /// Block pool this worker is a member of
    pool: PoolId,
    /// Storage id from a previous run; leave empty on a first-ever start
    /// to have the controller assign one
    #[builder(default)]
    storage_id: StorageId,
    #[builder(default = Duration::from_secs(3))]
    heartbeat_interval: Duration,
    /// Interval for periodic full block reports; reports are also sent
    /// right after every (re-)registration
    #[builder(default = Duration::from_secs(60 * 60))]
    block_report_interval: Duration,
    #[builder(default = PROTOCOL_VERSION)]
    software_version: u32,
    #[builder(default = 0)]
    layout_version: i32,
    #[builder(default)]
    epoch: RegistrationEpoch,
    #[builder(default = flume::unbounded())]
    alarm_channel: (
        flume::Sender<(AlarmCode, String)>,
        flume::Receiver<(AlarmCode, String)>,
    ),
    #[builder(default = IncrementalReporter::new())]
    event_channel: (BlockEventQueue, IncrementalReporter),
}

/// Why a control session ended
enum SessionEnd {
    Shutdown,
    FatalAlarm(String),
}

/// What the agent does with one controller command
enum Dispatch {
    Handled,
    Reregister,
    Shutdown,
}

impl<C, S, H> WorkerAgent<C, S, H>
where
    C: WorkerControllerComm,
    S: LocalStorage,
    H: CommandHandler,
{
    /// Queue for incremental block events; hand this to storage code
    pub fn block_events(&self) -> BlockEventQueue {
        self.event_channel.0.clone()
    }

    /// Alarm handle; hand this to storage code
    pub fn alarms(&self) -> AlarmSender {
        AlarmSender {
            tx: self.alarm_channel.0.clone(),
        }
    }

    /// Storage id currently held; updated once registration succeeds
    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// Drive the control session until the controller orders a shutdown,
    /// a fatal alarm is raised, or an unrecoverable incompatibility is
    /// found. Transport failures are retried with backoff indefinitely.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let mut retry = RetryPolicy::default();
        loop {
            let client = match ControlClient::connect(&self.comm) {
                Ok(client) => client,
                Err(e) => {
                    warn!(message = "Failed to reach controller, backing off", error = %e);
                    tokio::time::sleep(retry.next_delay()).await;
                    continue;
                }
            };
            match self.drive_session(&client, &mut retry).await {
                Ok(SessionEnd::Shutdown) => {
                    info!(message = "Shutting down on controller command");
                    return Ok(());
                }
                Ok(SessionEnd::FatalAlarm(message)) => {
                    error!(message = "Stopping after fatal storage alarm", detail = %message);
                    return Err(WorkerError::FatalAlarm(message));
                }
                Err(e) if e.is_fatal() => return Err(WorkerError::Incompatible(e)),
                Err(e) => {
                    warn!(message = "Control session failed, reconnecting", error = %e);
                    tokio::time::sleep(retry.next_delay()).await;
                }
            }
        }
    }

    async fn drive_session(
        &mut self,
        client: &ControlClient,
        retry: &mut RetryPolicy,
    ) -> Result<SessionEnd, ControlError> {
        client.handshake().await?;
        self.register_with(client).await?;
        // the session is established, a later failure backs off from the base again
        retry.reset();
        if let Some(end) = self.send_full_reports(client).await? {
            return Ok(end);
        }
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report_interval = tokio::time::interval(self.block_report_interval);
        report_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // registration already produced the initial reports
        report_interval.reset();
        loop {
            tokio::select! {
                _ = report_interval.tick() => {
                    if let Some(end) = self.send_full_reports(client).await? {
                        return Ok(end);
                    }
                }
                _ = interval.tick() => {
                    let commands = match client
                        .heartbeat(self.identity(), self.storage.heartbeat_report())
                        .await
                    {
                        Ok(commands) => commands,
                        Err(e) if e.needs_reregistration() => {
                            warn!(message = "Controller no longer knows us, re-registering");
                            self.register_with(client).await?;
                            if let Some(end) = self.send_full_reports(client).await? {
                                return Ok(end);
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    for command in commands {
                        match self.dispatch(command) {
                            Dispatch::Handled => (),
                            Dispatch::Shutdown => return Ok(SessionEnd::Shutdown),
                            Dispatch::Reregister => {
                                self.register_with(client).await?;
                                if let Some(end) = self.send_full_reports(client).await? {
                                    return Ok(end);
                                }
                            }
                        }
                    }
                    if self.event_channel.1.has_pending() {
                        match self.event_channel.1.flush(client, &self.identity()).await {
                            Ok(()) => (),
                            // events stay buffered; the next tick's
                            // re-registration path will retry them
                            Err(e) if e.needs_reregistration() => (),
                            Err(e) => return Err(e),
                        }
                    }
                }
                alarm = self.alarm_channel.1.recv_async() => {
                    // the agent keeps a sender, so the channel never closes
                    let Ok((code, message)) = alarm else { continue };
                    client
                        .error_report(self.identity(), code, message.clone())
                        .await?;
                    if code.is_fatal() {
                        return Ok(SessionEnd::FatalAlarm(message));
                    }
                }
            }
        }
    }

    /// Register and adopt the controller's view of our identity verbatim
    async fn register_with(&mut self, client: &ControlClient) -> Result<(), ControlError> {
        let candidate = WorkerRegistration {
            identity: self.identity(),
            software_version: self.software_version,
            layout_version: self.layout_version,
            epoch: self.epoch,
        };
        let assigned = client.register(candidate).await?;
        if self.storage_id.is_empty() {
            info!(
                message = "Controller assigned storage id",
                storage_id = %assigned.identity.storage_id
            );
        }
        self.storage_id = assigned.identity.storage_id;
        self.epoch = assigned.epoch;
        Ok(())
    }

    /// Upload the complete inventory of every local pool, as done right
    /// after every (re-)registration
    async fn send_full_reports(
        &mut self,
        client: &ControlClient,
    ) -> Result<Option<SessionEnd>, ControlError> {
        for pool_id in self.storage.pools() {
            let flat = blocks_to_flat(&self.storage.pool_blocks(&pool_id));
            let command = client
                .full_block_report(self.identity(), pool_id, flat)
                .await?;
            if let Some(command) = command {
                match self.dispatch(command) {
                    Dispatch::Handled => (),
                    Dispatch::Shutdown => return Ok(Some(SessionEnd::Shutdown)),
                    // just registered, a stale Register here is moot
                    Dispatch::Reregister => (),
                }
            }
        }
        Ok(None)
    }

    fn dispatch(&mut self, command: WorkerCommand) -> Dispatch {
        match command {
            WorkerCommand::Shutdown => Dispatch::Shutdown,
            WorkerCommand::Register => Dispatch::Reregister,
            other => {
                self.handler.handle(other);
                Dispatch::Handled
            }
        }
    }

    fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            storage_id: self.storage_id.clone(),
            address: self.address.clone(),
            pool: self.pool.clone(),
        }
    }
}

/// Unrecoverable worker agent failure
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Controller and worker cannot speak to each other
    #[error("incompatible with controller: {0}")]
    Incompatible(#[source] ControlError),
    /// Local storage raised a fatal alarm
    #[error("fatal storage alarm: {0}")]
    FatalAlarm(String),
}
