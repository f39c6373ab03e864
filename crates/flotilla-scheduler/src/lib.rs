pub mod queue;
pub mod scheduler;
pub mod score;

pub use queue::PendingQueue;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use score::{score_node, ScoreWeights};
