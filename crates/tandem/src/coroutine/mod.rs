//! Coroutine capability set
//!
//! The scheduler decides *when* to resume *whom*; the mechanics of switching
//! stacks live behind the [`Coroutines`] trait. Coroutines are records in an
//! arena addressed by [`CoroutineId`], never owned through pointers.

mod stackful;

pub use stackful::StackfulCoroutines;

use crate::error::CoroutineError;
use std::fmt;

/// Arena index of a coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u32);

impl CoroutineId {
    /// The process root: the host code that created the backend
    pub const ROOT: CoroutineId = CoroutineId(0);

    /// Create a CoroutineId from an arena index
    pub fn from_index(index: usize) -> Self {
        CoroutineId(index as u32)
    }

    /// Get the arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created, never resumed
    Runnable,
    /// Currently executing
    Running,
    /// Suspended after a resume, yield or exchange; may be resumed
    Waiting,
    /// Suspended holding a lock; only `unlock` makes it resumable again
    Locked,
    /// Entry function returned
    Dead,
}

impl CoroutineState {
    /// Whether a coroutine in this state still counts as live
    pub fn is_alive(self) -> bool {
        self != CoroutineState::Dead
    }
}

/// Entry function of a coroutine
pub type CoroutineEntry = Box<dyn FnOnce() + 'static>;

/// Capability set of a coroutine backend.
///
/// Every method acts on behalf of the coroutine currently executing. Transfer
/// rules:
/// - `resume(t)` records the caller as `t`'s previous and suspends the caller;
/// - `yield_current` transfers to the caller's live previous (consuming it), or to
///   the registered scheduler when there is none;
/// - `lock` adds one lock unit to the caller, then transfers like a yield;
/// - `unlock` releases one lock unit and never transfers;
/// - a coroutine whose entry returns transfers to its previous if that one is
///   still alive, otherwise to the root.
pub trait Coroutines {
    /// The process root coroutine
    fn root(&self) -> CoroutineId {
        CoroutineId::ROOT
    }

    /// The coroutine currently executing
    fn current(&self) -> CoroutineId;

    /// Create a coroutine in the `Runnable` state
    fn create(&self, entry: CoroutineEntry) -> Result<CoroutineId, CoroutineError>;

    /// Drop a coroutine that has never run, undoing its creation. Returns
    /// false if `id` is unknown or has already started.
    fn discard(&self, id: CoroutineId) -> bool;

    /// Transfer control to `id`, returning once something transfers back
    fn resume(&self, id: CoroutineId) -> Result<(), CoroutineError>;

    /// Symmetric transfer to `id`. Returns the coroutine that later transfers
    /// control back in.
    fn exchange(&self, id: CoroutineId) -> Result<Option<CoroutineId>, CoroutineError>;

    /// Symmetric transfer to the caller's previous coroutine
    fn exchange_with_previous(&self) -> Result<Option<CoroutineId>, CoroutineError>;

    /// Suspend the caller, handing control to its previous coroutine
    fn yield_current(&self) -> Result<(), CoroutineError>;

    /// Take one lock unit on the caller and suspend it
    fn lock(&self) -> Result<(), CoroutineError>;

    /// Release one lock unit on `id`. Returns false if it was not locked.
    fn unlock(&self, id: CoroutineId) -> bool;

    /// Whether `id` holds at least one lock unit
    fn is_locked(&self, id: CoroutineId) -> bool {
        self.state(id) == CoroutineState::Locked
    }

    /// State of `id` (`Dead` for unknown handles)
    fn state(&self, id: CoroutineId) -> CoroutineState;

    /// The coroutine recorded as having resumed `id`
    fn previous(&self, id: CoroutineId) -> Option<CoroutineId>;

    /// Identity number of `id`, distinct from its arena index
    fn serial(&self, id: CoroutineId) -> Option<u64>;

    /// Next identity number handed out by `create`
    fn next_serial(&self) -> u64;

    /// Overwrite the identity counter
    fn set_next_serial(&self, serial: u64);

    /// Number of live coroutines, root included
    fn active_count(&self) -> usize;

    /// Register the fallback target for yields and locks with no previous
    fn register_scheduler(&self, id: Option<CoroutineId>);

    /// Release every suspended coroutine; their pending transfers fail with
    /// [`CoroutineError::Shutdown`]
    fn shutdown(&self);
}
