//! Pod group controller daemon
//!
//! Keeps groups of identical pod instances deployed on a container runtime:
//! every group owns an ordered operation queue drained by its own worker,
//! stream ports declared by the groups are kept conflict-free, and snapshots
//! are persisted so a restarted daemon picks up where it left off.

pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod logging;
