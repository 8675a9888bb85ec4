//! Runtime configuration

use std::time::Duration;

/// Default upper bound for one blocking reactor poll
pub const DEFAULT_MAX_POLL_WAIT: Duration = Duration::from_millis(50);

/// Default stack size for each coroutine
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// What the scheduler does when the deadlock sentinel keeps firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlockPolicy {
    /// Warn on every firing and keep buying extra rounds indefinitely
    #[default]
    Warn,

    /// Warn, and once the sentinel has fired on more than `after` consecutive
    /// pumps without a locked resumer in between, terminate the runtime with
    /// [`crate::RuntimeError::Deadlock`]
    Escalate {
        /// Consecutive firings tolerated before escalating
        after: u32,
    },
}

/// Options for a [`crate::Runtime`]
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sentinel escalation policy
    pub deadlock_policy: DeadlockPolicy,

    /// Upper bound for one blocking reactor poll
    pub max_poll_wait: Duration,

    /// Maximum number of queued deferred tasks (None = unlimited)
    pub max_deferred_tasks: Option<usize>,

    /// Maximum number of live coroutines, root included (None = unlimited)
    pub max_coroutines: Option<usize>,

    /// Stack size for each coroutine (None = [`DEFAULT_STACK_SIZE`])
    pub coroutine_stack_size: Option<usize>,

    /// Maximum number of open reactor handles (None = unlimited)
    pub max_handles: Option<usize>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            deadlock_policy: DeadlockPolicy::Warn,
            max_poll_wait: DEFAULT_MAX_POLL_WAIT,
            max_deferred_tasks: None,
            max_coroutines: None,
            coroutine_stack_size: None,
            max_handles: None,
        }
    }
}

impl RuntimeOptions {
    /// Options that escalate a deadlock after `after` consecutive sentinel firings
    pub fn with_deadlock_escalation(after: u32) -> Self {
        Self {
            deadlock_policy: DeadlockPolicy::Escalate { after },
            ..Default::default()
        }
    }

    /// Options with a bounded deferred queue
    pub fn with_queue_limit(max_deferred_tasks: usize) -> Self {
        Self {
            max_deferred_tasks: Some(max_deferred_tasks),
            ..Default::default()
        }
    }

    /// Options with a live coroutine limit
    pub fn with_coroutine_limit(max_coroutines: usize) -> Self {
        Self {
            max_coroutines: Some(max_coroutines),
            ..Default::default()
        }
    }

    /// Options with a reactor handle limit
    pub fn with_handle_limit(max_handles: usize) -> Self {
        Self {
            max_handles: Some(max_handles),
            ..Default::default()
        }
    }
}
