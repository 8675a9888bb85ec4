//! Tandem: event-loop-driven cooperative coroutine scheduler
//!
//! This crate multiplexes stackful, cooperatively scheduled coroutines over
//! the one OS thread that created the runtime:
//! - A reactor (timer readiness) and a FIFO deferred task queue
//! - A run loop driver that pumps both until quiescence
//! - A scheduler coroutine that pumps whenever control is handed to it
//! - A deadlock sentinel that diagnoses stalls and buys one extra round
//!
//! A [`Runtime`] must be shut down explicitly; suspended coroutines are only
//! released by [`Runtime::shutdown`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod coroutine;
pub mod error;
pub mod reactor;
pub mod runtime;
pub mod scheduler;

pub use config::{DeadlockPolicy, RuntimeOptions};
pub use coroutine::{CoroutineId, CoroutineState, Coroutines, StackfulCoroutines};
pub use error::{CoroutineError, DeferError, ErrorCategory, ReactorError, RuntimeError};
pub use reactor::{HandleId, Reactor, TimerReactor};
pub use runtime::Runtime;
pub use scheduler::{DeferredTaskQueue, SchedulerStats};

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static MODULE: OnceCell<Module> = OnceCell::new();

/// Process-wide state shared by every runtime
#[derive(Debug)]
pub struct Module {
    version: &'static str,
    live_runtimes: AtomicUsize,
    next_runtime_id: AtomicU64,
}

impl Module {
    /// Crate version the module was initialized with
    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Runtimes initialized and not yet shut down
    pub fn live_runtimes(&self) -> usize {
        self.live_runtimes.load(Ordering::SeqCst)
    }

    pub(crate) fn register_runtime(&self) -> u64 {
        self.live_runtimes.fetch_add(1, Ordering::SeqCst);
        self.next_runtime_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn release_runtime(&self) {
        let _ = self
            .live_runtimes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Register process-wide state. Safe to call any number of times.
pub fn module_init() -> &'static Module {
    MODULE.get_or_init(|| {
        log::debug!("tandem {} module initialized", VERSION);
        Module {
            version: VERSION,
            live_runtimes: AtomicUsize::new(0),
            next_runtime_id: AtomicU64::new(1),
        }
    })
}
