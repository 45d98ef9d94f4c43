//! The logical RPC surface between workers and the controller: typed
//! requests and responses, the remote error taxonomy and the capability
//! table exchanged at session start.
mod capabilities;
mod messages;

pub use capabilities::{Method, ProtocolCapabilities, PROTOCOL_VERSION};
pub use messages::{ControlRequest, ControlResponse, RemoteError};
pub(crate) use messages::{CallId, RequestEnvelope, ResponseEnvelope};
