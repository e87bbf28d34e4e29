//! Event/audit processor: resolves each record's kind, evaluates the active
//! policy set, and publishes activity records.

pub mod actor;
pub mod mapping;
pub mod pool;

pub use mapping::MappingCache;
pub use pool::{LifecycleState, Processor, ProcessorConfig, SourceKind};
