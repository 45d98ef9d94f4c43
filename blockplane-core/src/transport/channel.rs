//! In-process transport connecting workers and controller over flume
//! channels. Used by tests and single-process deployments.
use async_trait::async_trait;
use flume::{Receiver, Sender};
use tracing::debug;

use super::{
    BiStreamTransport, CommunicationBackendError, ControllerWorkerComm, TransportError,
    WorkerControllerComm,
};

/// Connects workers and the controller living in the same process.
/// Cloning yields handles onto the same logical network.
#[derive(Clone)]
pub struct InterThreadCommunication {
    accept_tx: Sender<ChannelTransport>,
    accept_rx: Receiver<ChannelTransport>,
}

impl InterThreadCommunication {
    /// Create a new in-process network
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = flume::unbounded();
        Self {
            accept_tx,
            accept_rx,
        }
    }
}

impl Default for InterThreadCommunication {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControllerComm for InterThreadCommunication {
    fn worker_to_controller(
        &self,
    ) -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError> {
        debug!("Creating in-process worker session");
        let (worker_end, controller_end) = ChannelTransport::pair();
        self.accept_tx
            .send(controller_end)
            .map_err(|e| CommunicationBackendError::ClientBuildError(Box::new(e)))?;
        Ok(Box::new(worker_end))
    }
}

#[async_trait]
impl ControllerWorkerComm for InterThreadCommunication {
    async fn accept(&self) -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError> {
        let transport = self
            .accept_rx
            .recv_async()
            .await
            .map_err(|e| CommunicationBackendError::ClientBuildError(Box::new(e)))?;
        Ok(Box::new(transport))
    }
}

/// One end of an in-process bi-directional channel pair
pub(crate) struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Create both ends of a connection
    pub(crate) fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        (Self { tx: a_tx, rx: b_rx }, Self { tx: b_tx, rx: a_rx })
    }
}

#[async_trait]
impl BiStreamTransport for ChannelTransport {
    fn send(&self, msg: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(TransportError::send_error)
    }

    fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(e @ flume::TryRecvError::Disconnected) => Err(TransportError::recv_error(e)),
        }
    }

    async fn recv_async(&self) -> Result<Vec<u8>, TransportError> {
        self.rx
            .recv_async()
            .await
            .map_err(TransportError::recv_error)
    }
}
