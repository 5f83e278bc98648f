pub mod aggregate;
pub mod executor;
pub mod rerun;
pub mod scheduler;

pub use executor::{ExecutorConfig, RunExecutor};
pub use scheduler::{Scheduler, SchedulerConfig};
