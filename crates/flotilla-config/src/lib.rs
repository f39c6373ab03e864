pub mod error;
pub mod loader;
pub mod raw;

pub use error::ConfigError;
pub use loader::{load, ServerConfig};
pub use loader::{
    ControllerSettings, LeaseSettings, RouterSettings, SchedulerSettings, SessionSettings,
    WeightSettings,
};
