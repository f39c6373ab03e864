pub mod engine;

pub use engine::{LeaseConfig, LeaseEngine, PassReport};
