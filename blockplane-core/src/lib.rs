//! Blockplane is the control plane of a distributed block store: the
//! wire protocol and both endpoints of the conversation between storage
//! workers and the central metadata controller.
pub mod command;
pub mod controller;
pub mod errorhandling;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
