//! Run loop driver
//!
//! Alternates one reactor tick with one deferred round until both report no
//! work in the same iteration. The reactor alone is not enough: a deferred
//! task can bring a handle back to life after the reactor went idle.
//!
//! Liveness is exactly what the tick reported at the start of the iteration.
//! A handle started by a task of the final round is not looked at again;
//! it is picked up by the next run.

/// Work sources pumped by [`RunLoopDriver`]
pub trait LoopSources {
    /// Poll the reactor once and run due callbacks. Returns whether any
    /// handle is still active.
    fn tick(&self, may_block: bool) -> bool;

    /// Run one deferred round. Returns whether tasks remain.
    fn drain_round(&self) -> bool;

    /// Whether deferred tasks are pending
    fn has_pending(&self) -> bool;

    /// Whether the loop should stop before reaching quiescence
    fn interrupted(&self) -> bool {
        false
    }
}

/// Quiescence detector over a reactor and a deferred queue
pub struct RunLoopDriver<'a, S: LoopSources + ?Sized> {
    sources: &'a S,
}

impl<'a, S: LoopSources + ?Sized> RunLoopDriver<'a, S> {
    /// Driver over `sources`
    pub fn new(sources: &'a S) -> Self {
        Self { sources }
    }

    /// Pump until quiescence (or interruption). Returns the number of rounds.
    pub fn run(&self) -> u64 {
        let mut rounds = 0;

        loop {
            // Never block in the reactor while deferred work is waiting
            let may_block = !self.sources.has_pending();
            let reactor_alive = self.sources.tick(may_block);
            let tasks_pending = self.sources.drain_round();
            rounds += 1;

            log::trace!(
                "round {}: reactor alive={}, tasks pending={}",
                rounds,
                reactor_alive,
                tasks_pending
            );

            if !reactor_alive && !tasks_pending {
                break;
            }
            if self.sources.interrupted() {
                log::trace!("run loop interrupted after {} rounds", rounds);
                break;
            }
        }

        rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DeferredTaskQueue;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted sources: the reactor stays alive for a fixed number of ticks
    struct Script {
        queue: DeferredTaskQueue<Script>,
        alive_ticks: AtomicU32,
        blocking: Mutex<Vec<bool>>,
        stop: AtomicBool,
    }

    impl Script {
        fn new(alive_ticks: u32) -> Self {
            Self {
                queue: DeferredTaskQueue::new(),
                alive_ticks: AtomicU32::new(alive_ticks),
                blocking: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
            }
        }
    }

    impl LoopSources for Script {
        fn tick(&self, may_block: bool) -> bool {
            self.blocking.lock().push(may_block);
            let left = self.alive_ticks.load(Ordering::SeqCst);
            if left == 0 {
                return false;
            }
            self.alive_ticks.store(left - 1, Ordering::SeqCst);
            true
        }

        fn drain_round(&self) -> bool {
            self.queue.drain_one_round(self)
        }

        fn has_pending(&self) -> bool {
            !self.queue.is_empty()
        }

        fn interrupted(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    fn requeue(script: &Script, remaining: u32) {
        if remaining > 0 {
            script.queue.defer(requeue, remaining - 1).unwrap();
        }
    }

    #[test]
    fn test_idle_sources_take_one_round() {
        let script = Script::new(0);
        assert_eq!(RunLoopDriver::new(&script).run(), 1);
        assert_eq!(*script.blocking.lock(), vec![true]);
    }

    #[test]
    fn test_live_reactor_extends_loop() {
        let script = Script::new(3);
        assert_eq!(RunLoopDriver::new(&script).run(), 4);
    }

    #[test]
    fn test_requeuing_task_delays_termination() {
        let script = Script::new(0);
        script.queue.defer(requeue, 5).unwrap();

        assert_eq!(RunLoopDriver::new(&script).run(), 6);
        assert_eq!(script.queue.executed_count(), 6);
    }

    #[test]
    fn test_no_blocking_with_pending_tasks() {
        let script = Script::new(0);
        script.queue.defer(requeue, 1).unwrap();

        RunLoopDriver::new(&script).run();
        assert_eq!(*script.blocking.lock(), vec![false, false]);
    }

    #[test]
    fn test_handle_started_in_final_round_waits_for_next_run() {
        let script = Script::new(0);
        script
            .queue
            .defer(
                |script: &Script, _| script.alive_ticks.store(1, Ordering::SeqCst),
                (),
            )
            .unwrap();

        // The tick of round 1 saw an idle reactor and the queue drained empty
        assert_eq!(RunLoopDriver::new(&script).run(), 1);
        assert_eq!(script.alive_ticks.load(Ordering::SeqCst), 1);

        // The next run sees the handle: one live tick, then one idle tick
        assert_eq!(RunLoopDriver::new(&script).run(), 2);
    }

    #[test]
    fn test_task_keeps_reactor_alive_with_pending_work() {
        let script = Script::new(0);
        script
            .queue
            .defer(
                |script: &Script, _| {
                    script.alive_ticks.store(1, Ordering::SeqCst);
                    script.queue.defer(|_: &Script, _| {}, ()).unwrap();
                },
                (),
            )
            .unwrap();

        // round 1 runs the task, round 2 sees the live reactor and the
        // follow-up task, round 3 is idle
        assert_eq!(RunLoopDriver::new(&script).run(), 3);
    }

    #[test]
    fn test_interrupt_stops_early() {
        let script = Script::new(10);
        script.stop.store(true, Ordering::SeqCst);
        assert_eq!(RunLoopDriver::new(&script).run(), 1);
    }
}
