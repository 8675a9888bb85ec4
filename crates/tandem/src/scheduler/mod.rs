//! Cooperative scheduler
//!
//! A deferred task queue and a reactor are pumped together by the run loop
//! driver. The scheduler coroutine owns the driver and decides, after every
//! pump, whether the process still has a chance to make progress.

mod defer;
mod driver;
#[allow(clippy::module_inception)]
mod scheduler;
mod sentinel;

pub use defer::{DeferredTask, DeferredTaskQueue};
pub use driver::{LoopSources, RunLoopDriver};
pub use scheduler::{SchedulerCoroutine, SchedulerCounters, SchedulerPhase, SchedulerStats};
pub use sentinel::DeadlockSentinel;
