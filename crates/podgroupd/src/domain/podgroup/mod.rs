//! Pod group controller and the pieces its worker drives.

pub mod controller;
pub mod error;
pub mod operation;
pub mod pod_controller;
pub mod port_diff;

#[cfg(test)]
pub(crate) mod mock;

pub use controller::ControllerDeps;
pub use controller::PodGroupController;
pub use error::PodGroupError;
pub use operation::Operation;
pub use pod_controller::PodController;
