pub mod backend;
pub mod error;
pub mod events;
pub mod hash;
pub mod memory;
pub mod metrics;
pub mod store;

pub use backend::ClusterBackend;
pub use error::{BackendError, StoreError};
pub use events::{ClusterEvent, EventCategory, EventRecord, EventSeverity, EventStream};
pub use hash::compute_template_hash;
pub use memory::MemoryBackend;
pub use metrics::{CountersSnapshot, StoreCounters};
pub use store::{ClusterStore, HeartbeatReport};
