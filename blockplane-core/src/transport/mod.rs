//! The single transport abstraction all control-plane components talk
//! through. Backends supply bi-directional byte streams; the typed
//! [CommunicationClient] frames serde messages over them.
pub mod channel;

use std::{error::Error, marker::PhantomData};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::errorhandling::ControlFatal;

/// A type which can be sent between a worker and the controller
pub trait Distributable: Serialize + DeserializeOwned {}
impl<T> Distributable for T where T: Serialize + DeserializeOwned {}

/// Backend used by a worker to dial its controller.
///
/// Each worker maintains exactly one logical session; implementors can
/// expect at most one live connection per worker process.
pub trait WorkerControllerComm {
    /// Establish a connection to the controller.
    /// The implementation must not wait for the controller to accept the
    /// stream, i.e. it must be able to buffer outgoing messages.
    fn worker_to_controller(&self)
        -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError>;
}

/// Backend used by the controller to accept worker sessions
#[async_trait]
pub trait ControllerWorkerComm {
    /// Wait for the next incoming worker session
    async fn accept(&self) -> Result<Box<dyn BiStreamTransport>, CommunicationBackendError>;
}

/// Bi-directional streaming transport where each end can send many
/// messages to the other without requiring a response
#[async_trait]
pub trait BiStreamTransport: Send + Sync {
    /// Send a single message to the other end of the transport.
    ///
    /// Fallible transports must implement applicable retry logic
    /// internally; an error should only be returned on **unrecoverable
    /// conditions**.
    fn send(&self, msg: Vec<u8>) -> Result<(), TransportError>;

    /// Receive a single message from the other end of the transport.
    ///
    /// If no message is available at this moment, `Ok(None)` shall be
    /// returned.
    fn recv(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Wait until a message becomes available
    async fn recv_async(&self) -> Result<Vec<u8>, TransportError>;

    /// Receive all currently available messages.
    /// Transports which handle reception more efficiently in bulk may
    /// override this; the default calls [BiStreamTransport::recv]
    /// repeatedly.
    fn recv_all<'a>(&'a self) -> Box<dyn Iterator<Item = Result<Vec<u8>, TransportError>> + 'a> {
        Box::new(std::iter::from_fn(|| self.recv().transpose()))
    }
}

/// Typed client framing request/response messages over one transport
pub struct CommunicationClient<TSend, TRecv> {
    transport: Box<dyn BiStreamTransport>,
    message_type: PhantomData<(TSend, TRecv)>,
}

impl<TSend, TRecv> CommunicationClient<TSend, TRecv> {
    /// Dial the controller from a worker
    pub(crate) fn worker_to_controller(
        backend: &dyn WorkerControllerComm,
    ) -> Result<Self, CommunicationBackendError> {
        debug!("Dialing controller");
        let transport = backend.worker_to_controller()?;
        Ok(Self::from_transport(transport))
    }

    /// Wrap an already established transport, e.g. one just accepted by
    /// the controller
    pub(crate) fn from_transport(transport: Box<dyn BiStreamTransport>) -> Self {
        Self {
            transport,
            message_type: PhantomData,
        }
    }
}

impl<TSend, TRecv> CommunicationClient<TSend, TRecv>
where
    TSend: Distributable,
{
    /// Send one message. Errors are unrecoverable transport failures.
    pub fn send(&self, msg: TSend) -> Result<(), TransportError> {
        self.transport.send(Self::encode(msg))
    }

    pub(crate) fn encode(msg: TSend) -> Vec<u8> {
        // encoding a self-describing message can only fail on a codec bug
        rmp_serde::encode::to_vec(&msg).control_fatal()
    }
}

impl<TSend, TRecv> CommunicationClient<TSend, TRecv>
where
    TRecv: Distributable,
{
    /// Receive one message if any is currently available
    pub fn recv(&self) -> Result<Option<TRecv>, TransportError> {
        let encoded = self.transport.recv()?;
        Ok(encoded.as_deref().map(Self::decode))
    }

    /// Wait for the next message
    pub async fn recv_async(&self) -> Result<TRecv, TransportError> {
        let encoded = self.transport.recv_async().await?;
        Ok(Self::decode(&encoded))
    }

    pub(crate) fn decode(msg: &[u8]) -> TRecv {
        // a frame we cannot decode means the session is corrupt
        rmp_serde::decode::from_slice(msg).control_fatal()
    }
}

/// Error building a communication client for a specific connection
#[derive(thiserror::Error, Debug)]
pub enum CommunicationBackendError {
    /// The backend could not produce a transport
    #[error("Error building client: {0:?}")]
    ClientBuildError(Box<dyn std::error::Error + Send + Sync>),
}

/// Unrecoverable failure of an established transport
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The transport failed to send a message
    #[error("Error sending message: {0}")]
    SendError(Box<dyn std::error::Error + Send + Sync>),

    /// The transport failed to receive a message.
    ///
    /// **NOTE:** no new message being available is **NOT** an error.
    #[error("Error receiving message: {0}")]
    RecvError(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap an error encountered while sending
    pub fn send_error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::SendError(Box::new(err))
    }

    /// Wrap an error encountered while receiving
    pub fn recv_error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::RecvError(Box::new(err))
    }
}
