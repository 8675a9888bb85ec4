//! Scheduler coroutine
//!
//! The distinguished coroutine that owns the run loop. Every time control is
//! handed to it, it pumps the reactor and the deferred queue to quiescence,
//! settles the coroutine that handed control in (release one lock unit, or
//! run the deadlock sentinel) and hands control back to it.

use super::DeadlockSentinel;
use crate::coroutine::{CoroutineEntry, CoroutineId};
use crate::error::{CoroutineError, RuntimeError};
use crate::runtime::Runtime;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Run loop invocations
    pub pumps: u64,

    /// Driver rounds across all pumps
    pub rounds: u64,

    /// Deferred tasks accepted
    pub tasks_deferred: u64,

    /// Deferred tasks run
    pub tasks_executed: u64,

    /// Timer callbacks run
    pub timers_fired: u64,

    /// Deadlock sentinel firings
    pub deadlocks_suspected: u64,
}

/// Live counters behind [`SchedulerStats`]
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    pumps: AtomicU64,
    rounds: AtomicU64,
    timers_fired: AtomicU64,
    deadlocks_suspected: AtomicU64,
}

impl SchedulerCounters {
    /// Count one run loop invocation of `rounds` rounds
    pub fn record_pump(&self, rounds: u64) {
        self.pumps.fetch_add(1, Ordering::Relaxed);
        self.rounds.fetch_add(rounds, Ordering::Relaxed);
    }

    /// Count one timer callback
    pub fn record_timer(&self) {
        self.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one sentinel firing
    pub fn record_deadlock(&self) {
        self.deadlocks_suspected.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot, with the queue totals supplied by the caller
    pub fn snapshot(&self, tasks_deferred: u64, tasks_executed: u64) -> SchedulerStats {
        SchedulerStats {
            pumps: self.pumps.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            tasks_deferred,
            tasks_executed,
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            deadlocks_suspected: self.deadlocks_suspected.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle of the scheduler coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Created, `run` not called yet
    NotStarted,
    /// Registered as the running scheduler
    Pumping,
    /// Exited; the registration is cleared
    Done,
}

/// Clears the scheduler registration when the pump loop ends, whether it
/// returns or unwinds out of a panicking callback
struct Registration<'a> {
    runtime: &'a Runtime,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::error!(
                "runtime {}: scheduler unwound out of a panicking callback",
                self.runtime.id()
            );
        }
        {
            let mut state = self.runtime.state();
            state.running = false;
            state.scheduler = None;
            state.stop_requested = false;
        }
        self.runtime.coroutines().register_scheduler(None);
    }
}

/// Body of the scheduler coroutine
pub struct SchedulerCoroutine {
    runtime: Runtime,
    phase: SchedulerPhase,
    sentinel: DeadlockSentinel,
}

impl SchedulerCoroutine {
    /// Scheduler body for `runtime`, using its deadlock policy
    pub fn new(runtime: Runtime) -> Self {
        let sentinel = DeadlockSentinel::new(runtime.options().deadlock_policy);
        Self {
            runtime,
            phase: SchedulerPhase::NotStarted,
            sentinel,
        }
    }

    /// Entry function handed to the coroutine backend
    pub(crate) fn entry(runtime: Runtime) -> CoroutineEntry {
        Box::new(move || {
            let id = runtime.id();
            match SchedulerCoroutine::new(runtime.clone()).run() {
                Ok(()) => log::debug!("runtime {}: scheduler exited", id),
                Err(err) if err.is_fatal() => runtime.fail(err),
                Err(err) => log::warn!("runtime {}: scheduler refused to run: {}", id, err),
            }
        })
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// Run the scheduler on the current coroutine until it is stopped.
    ///
    /// Fails with `AlreadyRunning` (and does nothing) if a scheduler is
    /// already pumping, and with `Fatal` if the current coroutine is not the
    /// registered scheduler.
    pub fn run(mut self) -> Result<(), RuntimeError> {
        let me = self.runtime.coroutines().current();

        {
            let mut state = self.runtime.state();
            if state.running {
                return Err(RuntimeError::AlreadyRunning);
            }
            if state.scheduler != Some(me) {
                return Err(RuntimeError::Fatal(format!(
                    "coroutine {} is not the registered scheduler",
                    me
                )));
            }
            state.running = true;
        }

        let runtime = self.runtime.clone();
        let registration = Registration { runtime: &runtime };

        self.phase = SchedulerPhase::Pumping;
        log::debug!("runtime {}: scheduler {} pumping", runtime.id(), me);
        let result = self.pump_loop();
        self.phase = SchedulerPhase::Done;

        drop(registration);
        result
    }

    fn pump_loop(&mut self) -> Result<(), RuntimeError> {
        let co = self.runtime.coroutines();

        // Launch: give control straight back to the creator
        let mut resumer = match co.exchange_with_previous() {
            Ok(from) => from,
            Err(CoroutineError::Shutdown) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        loop {
            if self.runtime.stop_requested() {
                break;
            }
            self.runtime.run_until_quiescent();
            if self.runtime.stop_requested() {
                break;
            }

            let subject = self.subject(resumer);
            if co.is_locked(subject) {
                co.unlock(subject);
                self.sentinel.reset();
            } else {
                self.sentinel.trigger(&self.runtime)?;
            }

            match co.exchange(subject) {
                Ok(from) => resumer = from,
                Err(CoroutineError::Shutdown) => break,
                Err(err) => {
                    log::warn!(
                        "runtime {}: scheduler could not hand control to {}: {}",
                        self.runtime.id(),
                        subject,
                        err
                    );
                    resumer = None;
                }
            }
        }

        Ok(())
    }

    /// Coroutine to settle after a pump: the one that handed control in if it
    /// is still alive, otherwise the root
    fn subject(&self, resumer: Option<CoroutineId>) -> CoroutineId {
        let co = self.runtime.coroutines();
        resumer
            .filter(|id| co.state(*id).is_alive())
            .unwrap_or_else(|| co.root())
    }
}
