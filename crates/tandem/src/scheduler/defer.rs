//! Deferred task queue
//!
//! One-shot callbacks drained in FIFO order, one bounded round at a time.
//! A round runs only the tasks present when it started; anything enqueued
//! while the round is in progress waits for the next one, so the reactor is
//! always polled between a self re-enqueuing task's runs.

use crate::error::DeferError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// A queued one-shot callback together with its payload
pub struct DeferredTask<C> {
    callback: Box<dyn FnOnce(&C) + 'static>,
}

impl<C> DeferredTask<C> {
    /// Wrap a callback and the data it will receive
    pub fn new<T, F>(callback: F, data: T) -> Self
    where
        F: FnOnce(&C, T) + 'static,
        T: 'static,
    {
        Self {
            callback: Box::new(move |ctx: &C| callback(ctx, data)),
        }
    }

    /// Run the task, consuming it
    pub fn run(self, ctx: &C) {
        (self.callback)(ctx)
    }
}

/// FIFO queue of deferred tasks
pub struct DeferredTaskQueue<C> {
    tasks: Mutex<VecDeque<DeferredTask<C>>>,
    limit: Option<usize>,
    deferred: AtomicU64,
    executed: AtomicU64,
}

impl<C> DeferredTaskQueue<C> {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Create a queue holding at most `limit` pending tasks
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            limit,
            deferred: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        }
    }

    /// Append `callback(ctx, data)` to the tail of the queue
    pub fn defer<T, F>(&self, callback: F, data: T) -> Result<(), DeferError>
    where
        F: FnOnce(&C, T) + 'static,
        T: 'static,
    {
        self.push(DeferredTask::new(callback, data))
    }

    /// Append an already wrapped task. Nothing is enqueued on error.
    pub fn push(&self, task: DeferredTask<C>) -> Result<(), DeferError> {
        let mut tasks = self.tasks.lock();
        if let Some(limit) = self.limit {
            if tasks.len() >= limit {
                return Err(DeferError::Exhausted { limit });
            }
        }
        tasks
            .try_reserve(1)
            .map_err(|_| DeferError::AllocationFailed)?;
        tasks.push_back(task);
        self.deferred.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Run the tasks present at the start of the round, in order.
    ///
    /// The queue lock is released while each task runs, so tasks may defer
    /// more work. Returns true if tasks remain afterwards.
    pub fn drain_one_round(&self, ctx: &C) -> bool {
        let snapshot = self.tasks.lock().len();

        for _ in 0..snapshot {
            let Some(task) = self.tasks.lock().pop_front() else {
                break;
            };
            task.run(ctx);
            self.executed.fetch_add(1, Ordering::Relaxed);
        }

        !self.is_empty()
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no task is pending
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Total tasks accepted
    pub fn deferred_count(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Total tasks run
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

impl<C> Default for DeferredTaskQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
