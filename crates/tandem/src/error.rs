//! Runtime error types.

use crate::coroutine::CoroutineId;
use crate::reactor::HandleId;

/// Broad class of a [`RuntimeError`], used by embedders to decide whether to
/// report, retry or tear the runtime down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unrecoverable initialization failure; the runtime is terminated
    ConfigurationFatal,
    /// Operation issued in a state where it is not allowed; nothing changed
    Misuse,
    /// Allocation or capacity failure; the operation was aborted
    ResourceExhaustion,
    /// Suspected deadlock escalated by the configured policy
    Deadlock,
}

/// Errors raised when enqueuing deferred work
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeferError {
    /// The configured queue capacity is reached
    #[error("Deferred queue is full ({limit} tasks)")]
    Exhausted {
        /// Configured capacity
        limit: usize,
    },

    /// The queue storage could not grow
    #[error("Deferred queue allocation failed")]
    AllocationFailed,
}

/// Errors raised by a coroutine backend
#[derive(Debug, thiserror::Error)]
pub enum CoroutineError {
    /// The handle does not name a coroutine of this backend
    #[error("Unknown coroutine {0}")]
    Unknown(CoroutineId),

    /// The target has already finished
    #[error("Coroutine {0} is dead")]
    Dead(CoroutineId),

    /// The target holds a lock and may only be released through unlock
    #[error("Coroutine {0} is locked")]
    Locked(CoroutineId),

    /// The target is the coroutine currently executing
    #[error("Coroutine {0} is already running")]
    AlreadyRunning(CoroutineId),

    /// Yield or lock issued with no previous coroutine and no scheduler
    #[error("Coroutine {0} has nowhere to transfer control to")]
    NoTarget(CoroutineId),

    /// The live coroutine limit is reached
    #[error("Coroutine limit reached ({limit} live coroutines)")]
    LimitReached {
        /// Configured limit
        limit: usize,
    },

    /// The backing execution context could not be created
    #[error("Failed to create coroutine: {0}")]
    Spawn(#[from] std::io::Error),

    /// The backend is shutting down
    #[error("Coroutine backend has been shut down")]
    Shutdown,
}

/// Errors raised by a reactor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReactorError {
    /// Reactor construction failed
    #[error("Reactor initialization failed: {0}")]
    Init(String),

    /// The handle does not exist (never created or already closed)
    #[error("Unknown handle {0}")]
    UnknownHandle(HandleId),

    /// The handle is being closed and no longer accepts operations
    #[error("Handle {0} is closing")]
    Closing(HandleId),

    /// The handle limit is reached
    #[error("Reactor handle limit reached ({limit})")]
    HandleLimit {
        /// Configured limit
        limit: usize,
    },

    /// Shutdown was requested while handles were still open
    #[error("Reactor still has {0} open handles")]
    Busy(usize),
}

/// Errors returned by [`crate::Runtime`] operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// `scheduler_start` while a scheduler coroutine is registered
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// `scheduler_stop` or `wait_for_quiescence` without a scheduler
    #[error("No scheduler is registered")]
    NoScheduler,

    /// `wait_for_quiescence` issued by the scheduler coroutine itself
    #[error("Operation cannot be issued from the scheduler coroutine")]
    CalledFromScheduler,

    /// Deferred work could not be enqueued
    #[error("Defer failed: {0}")]
    Defer(#[from] DeferError),

    /// Coroutine backend failure
    #[error("Coroutine error: {0}")]
    Coroutine(#[from] CoroutineError),

    /// Reactor failure
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    /// Unrecoverable configuration failure
    #[error("Fatal: {0}")]
    Fatal(String),

    /// The sentinel fired on consecutive pumps past the escalation limit
    #[error("Deadlock: all coroutines asleep for {streak} consecutive pumps")]
    Deadlock {
        /// Consecutive sentinel firings observed
        streak: u32,
    },

    /// The runtime was terminated by an earlier fatal error or by shutdown
    #[error("Runtime has been terminated")]
    Terminated,
}

impl RuntimeError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::AlreadyRunning
            | RuntimeError::NoScheduler
            | RuntimeError::CalledFromScheduler
            | RuntimeError::Terminated => ErrorCategory::Misuse,
            RuntimeError::Defer(_) => ErrorCategory::ResourceExhaustion,
            RuntimeError::Coroutine(err) => match err {
                CoroutineError::LimitReached { .. } | CoroutineError::Spawn(_) => {
                    ErrorCategory::ResourceExhaustion
                }
                _ => ErrorCategory::Misuse,
            },
            RuntimeError::Reactor(ReactorError::HandleLimit { .. }) => {
                ErrorCategory::ResourceExhaustion
            }
            RuntimeError::Reactor(ReactorError::Init(_)) | RuntimeError::Fatal(_) => {
                ErrorCategory::ConfigurationFatal
            }
            RuntimeError::Reactor(_) => ErrorCategory::Misuse,
            RuntimeError::Deadlock { .. } => ErrorCategory::Deadlock,
        }
    }

    /// Whether this error terminates the runtime
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::ConfigurationFatal | ErrorCategory::Deadlock
        )
    }
}
