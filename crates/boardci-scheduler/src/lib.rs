//! Job scheduling for boardci.
//!
//! One job runs at a time. Newer commits of a change supersede older automatic
//! jobs, whether queued or running.

pub mod queue;
pub mod reporter;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use queue::{JobQueue, QueueSnapshot};
pub use reporter::{PersistPolicy, Reporter};
pub use runner::{Definitions, PipelineRunner};
pub use scheduler::{CancelOutcome, Scheduler, SchedulerHandle};
