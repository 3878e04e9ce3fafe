//! Application module
//!
//! Wires the store, the runtime and the pod group engine together and runs
//! the daemon's background tasks until a shutdown signal arrives.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
