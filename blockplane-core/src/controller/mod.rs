//! Controller: the central metadata authority coordinating storage
//! workers. Purely reactive; every command rides on a worker-initiated
//! call.
mod communication;
mod controller;
mod inventory;
mod recovery;
mod session;

pub use controller::Controller;
pub use recovery::{NoUpgrade, UpgradeCoordinator};
