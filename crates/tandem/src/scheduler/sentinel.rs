//! Deadlock sentinel
//!
//! Fired when a pump reached quiescence and the coroutine that handed control
//! to the scheduler holds no lock, i.e. nothing has promised to resume the
//! scheduler later. The sentinel arms a repeating timer whose deadline can
//! never be reached, so the reactor reports itself alive, and defers a task
//! that stops and closes the timer again. The next pump therefore performs
//! exactly one extra round before quiescence is re-evaluated.

use crate::config::DeadlockPolicy;
use crate::error::RuntimeError;
use crate::reactor::HandleId;
use crate::runtime::Runtime;
use std::time::Duration;

/// Stall detector with an escalation policy
#[derive(Debug)]
pub struct DeadlockSentinel {
    policy: DeadlockPolicy,
    /// Consecutive firings since the last locked resumer
    streak: u32,
}

impl DeadlockSentinel {
    /// Sentinel with no firings recorded
    pub fn new(policy: DeadlockPolicy) -> Self {
        Self { policy, streak: 0 }
    }

    /// Consecutive firings since the last reset
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Forget earlier firings (the resumer was locked this time)
    pub fn reset(&mut self) {
        self.streak = 0;
    }

    /// React to a suspected stall.
    ///
    /// Returns `Deadlock` when the policy escalates, or `Fatal` when the
    /// sentinel timer cannot be armed.
    pub fn trigger(&mut self, runtime: &Runtime) -> Result<(), RuntimeError> {
        self.streak = self.streak.saturating_add(1);
        runtime.counters().record_deadlock();
        log::warn!(
            "runtime {}: all coroutines are asleep (suspected deadlock, {} consecutive)",
            runtime.id(),
            self.streak
        );

        if let DeadlockPolicy::Escalate { after } = self.policy {
            if self.streak > after {
                return Err(RuntimeError::Deadlock {
                    streak: self.streak,
                });
            }
        }

        Self::arm(runtime).map_err(|err| {
            RuntimeError::Fatal(format!("deadlock sentinel could not be armed: {}", err))
        })
    }

    fn arm(runtime: &Runtime) -> Result<(), RuntimeError> {
        let handle = match runtime.deadlock_timer() {
            Some(handle) => handle,
            None => {
                let handle = runtime.timer_init()?;
                runtime.set_deadlock_timer(Some(handle));
                handle
            }
        };

        runtime.timer_start(handle, Duration::MAX, Some(Duration::MAX), |_, _| {})?;
        runtime.defer(Self::disarm, handle)
    }

    /// Deferred teardown queued together with the timer
    fn disarm(runtime: &Runtime, handle: HandleId) {
        if runtime.deadlock_timer() != Some(handle) {
            return;
        }
        runtime.set_deadlock_timer(None);

        if let Err(err) = runtime.timer_stop(handle) {
            log::warn!("failed to stop deadlock timer {}: {}", handle, err);
        }
        if let Err(err) = runtime.close_handle(handle, None) {
            log::warn!("failed to close deadlock timer {}: {}", handle, err);
        }
    }
}
