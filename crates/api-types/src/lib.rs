//! Shared API type definitions
//!
//! This crate contains the data model shared by the pod-group controller, its
//! collaborators and the persisted store format: pod group specs, runtime
//! records, declared stream ports and the events emitted on placement changes.

mod event;
mod ports;
mod runtime;
mod spec;

pub use event::DependencyEvent;
pub use event::DependencyEventType;
pub use event::NotifyKind;
pub use event::NotifySpec;
pub use ports::StreamPort;
pub use ports::StreamPorts;
pub use ports::StreamProc;
pub use runtime::ContainerObservation;
pub use runtime::ContainerPlacement;
pub use runtime::HealthState;
pub use runtime::Pod;
pub use runtime::PodGroup;
pub use runtime::PodGroupWithSpec;
pub use runtime::PodPrevState;
pub use runtime::RunState;
pub use runtime::RuntimeEaglePod;
pub use spec::ContainerSpec;
pub use spec::Dependency;
pub use spec::DependencyPolicy;
pub use spec::PodGroupSpec;
pub use spec::PodSpec;
pub use spec::RestartPolicy;
