pub mod engine;
pub mod podgroup;
pub mod port_registry;

pub use engine::EngineError;
pub use engine::GroupKey;
pub use engine::PodGroupEngine;
pub use port_registry::PortRegistry;
