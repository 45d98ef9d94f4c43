//! Utilities for testing control-plane communication
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::transport::channel::InterThreadCommunication;
use crate::transport::{
    BiStreamTransport, CommunicationBackendError, ControllerWorkerComm, WorkerControllerComm,
};

/// A communication backend which always fails to produce a transport.
/// Useful for tests which must assert no connection gets made, or which
/// exercise connect-failure handling.
#[derive(Debug, Default)]
pub(crate) struct NoCommunication;

impl WorkerControllerComm for NoCommunication {
    fn worker_to_controller(
        &self,
    ) -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError> {
        Err(CommunicationBackendError::ClientBuildError(Box::new(
            NoCommunicationError::CannotCreateClientError,
        )))
    }
}

#[async_trait]
impl ControllerWorkerComm for NoCommunication {
    async fn accept(&self) -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError> {
        Err(CommunicationBackendError::ClientBuildError(Box::new(
            NoCommunicationError::CannotCreateClientError,
        )))
    }
}

#[derive(Error, Debug)]
pub(crate) enum NoCommunicationError {
    #[error("NoCommunication backend cannot create clients")]
    CannotCreateClientError,
}

/// A worker backend which refuses the first few dials before delegating
/// to a working one, for exercising the agent's reconnect path
pub(crate) struct FlakyCommunication {
    inner: InterThreadCommunication,
    refusals_left: AtomicUsize,
}

impl FlakyCommunication {
    pub(crate) fn new(inner: InterThreadCommunication, refusals: usize) -> Self {
        Self {
            inner,
            refusals_left: AtomicUsize::new(refusals),
        }
    }
}

impl WorkerControllerComm for FlakyCommunication {
    fn worker_to_controller(
        &self,
    ) -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError> {
        let refused = self
            .refusals_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CommunicationBackendError::ClientBuildError(Box::new(
                NoCommunicationError::CannotCreateClientError,
            )));
        }
        self.inner.worker_to_controller()
    }
}
