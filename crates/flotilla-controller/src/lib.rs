pub mod reconcile;

pub use reconcile::{ControllerConfig, PassStats, WorkloadController};
