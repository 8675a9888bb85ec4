//! Reactor capability
//!
//! A reactor polls readiness sources and reports which callbacks are due.
//! It never runs callbacks itself: `poll` hands them out as [`Fired`] events
//! so the owner can run them without holding the reactor, then give
//! repeating timer callbacks back through [`Reactor::rearm`].
//!
//! The context type `C` is what callbacks receive (the runtime handle in
//! practice).

mod timer;

pub use timer::TimerReactor;

use crate::error::ReactorError;
use std::fmt;
use std::time::Duration;

/// Arena index of a reactor handle
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    /// Create a HandleId from an arena index
    pub fn from_index(index: usize) -> Self {
        HandleId(index as u32)
    }

    /// Get the arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Callback run each time a timer fires
pub type TimerCallback<C> = Box<dyn FnMut(&C, HandleId) + 'static>;

/// Callback run once a handle has finished closing
pub type CloseCallback<C> = Box<dyn FnOnce(&C, HandleId) + 'static>;

/// Event returned by [`Reactor::poll`]
pub enum Fired<C> {
    /// A timer is due. Pass the callback back to `rearm` after running it.
    Timer {
        /// Timer that fired
        handle: HandleId,
        /// Arming the callback belongs to
        generation: u64,
        /// Callback to run, then pass back to `rearm`
        callback: TimerCallback<C>,
    },

    /// A handle finished closing; its arena slot is already released
    Closed {
        /// Handle that finished closing
        handle: HandleId,
        /// Callback given to `close`
        callback: CloseCallback<C>,
    },
}

impl<C> fmt::Debug for Fired<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fired::Timer {
                handle, generation, ..
            } => f
                .debug_struct("Timer")
                .field("handle", handle)
                .field("generation", generation)
                .finish(),
            Fired::Closed { handle, .. } => {
                f.debug_struct("Closed").field("handle", handle).finish()
            }
        }
    }
}

/// Readiness/timer poller driven by the scheduler
pub trait Reactor<C> {
    /// Allocate an idle timer handle
    fn timer_init(&mut self) -> Result<HandleId, ReactorError>;

    /// Start (or restart) a timer. A timeout whose deadline cannot be
    /// represented never fires but keeps the reactor alive.
    fn timer_start(
        &mut self,
        handle: HandleId,
        timeout: Duration,
        repeat: Option<Duration>,
        callback: TimerCallback<C>,
    ) -> Result<(), ReactorError>;

    /// Stop a timer without closing it
    fn timer_stop(&mut self, handle: HandleId) -> Result<(), ReactorError>;

    /// Begin closing a handle. Completion is reported by a later `poll`.
    fn close(
        &mut self,
        handle: HandleId,
        on_close: Option<CloseCallback<C>>,
    ) -> Result<(), ReactorError>;

    /// Close every open handle without callbacks; returns how many were closed
    fn close_all(&mut self) -> usize;

    /// Collect due events. With `may_block` the poll may sleep until the
    /// nearest deadline.
    fn poll(&mut self, may_block: bool) -> Vec<Fired<C>>;

    /// Return a fired timer's callback. Dropped if the timer was stopped,
    /// restarted or closed in the meantime.
    fn rearm(&mut self, handle: HandleId, generation: u64, callback: TimerCallback<C>);

    /// Whether any handle is active or any close is pending
    fn is_alive(&self) -> bool;

    /// Number of open handles, closing ones included
    fn handle_count(&self) -> usize;

    /// Release all resources; fails with `Busy` if handles were still open
    fn shutdown(&mut self) -> Result<(), ReactorError>;
}
