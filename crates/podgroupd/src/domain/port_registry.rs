//! Cluster-wide stream port bindings.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::StreamProc;
use once_cell::sync::Lazy;
use tracing::debug;
use tracing::warn;

/// Process-wide registry shared by every pod group of the daemon
pub static GLOBAL_PORT_REGISTRY: Lazy<Arc<PortRegistry>> =
    Lazy::new(|| Arc::new(PortRegistry::new()));

/// Maps a source port to the process that owns it.
///
/// Every call takes the table lock once, so a multi-port registration is
/// atomic with respect to registrations from other groups.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<u16, StreamProc>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<PortRegistry> {
        GLOBAL_PORT_REGISTRY.clone()
    }

    /// Binds every tuple or none of them.
    ///
    /// Returns the requested tuples whose port is held by a different owner.
    /// A tuple already held by the same owner is rebound in place.
    pub fn register(&self, procs: &[StreamProc]) -> Result<(), Vec<StreamProc>> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);

        let conflicts: Vec<StreamProc> = procs
            .iter()
            .filter(|proc| {
                ports
                    .get(&proc.port.src_port)
                    .is_some_and(|owner| !owner.same_owner(proc))
            })
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            return Err(conflicts);
        }

        for proc in procs {
            debug!(port = %proc, "Stream port registered");
            ports.insert(proc.port.src_port, proc.clone());
        }
        Ok(())
    }

    /// Rebinds ports the caller owns to their new target.
    pub fn update(&self, procs: &[StreamProc]) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        for proc in procs {
            match ports.get_mut(&proc.port.src_port) {
                Some(owner) if owner.same_owner(proc) => {
                    debug!(port = %proc, "Stream port updated");
                    *owner = proc.clone();
                }
                Some(owner) => {
                    warn!(port = %proc, owner = %owner, "Refusing to update port held by another process");
                }
                None => {
                    warn!(port = %proc, "Updating unregistered port, registering it");
                    ports.insert(proc.port.src_port, proc.clone());
                }
            }
        }
    }

    /// Releases ports the caller owns.
    pub fn cancel(&self, procs: &[StreamProc]) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        for proc in procs {
            match ports.get(&proc.port.src_port) {
                Some(owner) if owner.same_owner(proc) => {
                    debug!(port = %proc, "Stream port released");
                    ports.remove(&proc.port.src_port);
                }
                Some(owner) => {
                    warn!(port = %proc, owner = %owner, "Refusing to release port held by another process");
                }
                None => {
                    debug!(port = %proc, "Port already released");
                }
            }
        }
    }

    pub fn owner(&self, src_port: u16) -> Option<StreamProc> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&src_port)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
