//! Runtime object and scheduler control
//!
//! A [`Runtime`] owns one reactor, one deferred queue and the coroutine
//! backend for its whole life. It is a cheap handle: clones share the same
//! runtime, and every callback and coroutine receives one.
//!
//! The thread that calls [`Runtime::init`] is the root coroutine. Control
//! moves between coroutines only at explicit yield, exchange or lock points,
//! so exactly one of them touches the runtime at any instant.

use crate::config::RuntimeOptions;
use crate::coroutine::{CoroutineId, Coroutines, StackfulCoroutines};
use crate::error::RuntimeError;
use crate::reactor::{CloseCallback, Fired, HandleId, Reactor, TimerReactor};
use crate::scheduler::{
    DeferredTaskQueue, LoopSources, RunLoopDriver, SchedulerCoroutine, SchedulerCounters,
    SchedulerStats,
};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Mutable scheduler bookkeeping of a runtime
#[derive(Debug, Default)]
pub(crate) struct EventLoopState {
    /// A scheduler coroutine is pumping
    pub(crate) running: bool,

    /// The registered scheduler coroutine
    pub(crate) scheduler: Option<CoroutineId>,

    /// `scheduler_stop` was requested
    pub(crate) stop_requested: bool,

    /// Sentinel timer, created on the first suspected stall
    pub(crate) deadlock_timer: Option<HandleId>,

    /// Error that made the scheduler exit
    pub(crate) last_error: Option<RuntimeError>,

    /// A fatal error occurred (or shutdown completed)
    pub(crate) terminated: bool,

    pub(crate) shut_down: bool,
}

struct RuntimeInner {
    id: u64,
    options: RuntimeOptions,
    coroutines: Rc<dyn Coroutines>,
    queue: DeferredTaskQueue<Runtime>,
    reactor: Mutex<Box<dyn Reactor<Runtime>>>,
    state: Mutex<EventLoopState>,
    counters: SchedulerCounters,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if !self.state.get_mut().shut_down {
            self.coroutines.shutdown();
            crate::module_init().release_runtime();
        }
    }
}

/// Handle to a cooperative runtime
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Allocate the reactor, the deferred queue and a stackful
    /// coroutine backend. The calling thread becomes the root coroutine.
    pub fn init(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let reactor = TimerReactor::<Runtime>::new(options.max_poll_wait, options.max_handles)
            .map_err(|err| {
                log::error!("reactor initialization failed: {}", err);
                RuntimeError::from(err)
            })?;
        let coroutines =
            StackfulCoroutines::with_limits(options.coroutine_stack_size, options.max_coroutines);

        Ok(Self::with_parts(options, Rc::new(coroutines), Box::new(reactor)))
    }

    /// Assemble a runtime from an existing backend and reactor
    pub fn with_parts(
        options: RuntimeOptions,
        coroutines: Rc<dyn Coroutines>,
        reactor: Box<dyn Reactor<Runtime>>,
    ) -> Self {
        let id = crate::module_init().register_runtime();
        let queue = DeferredTaskQueue::with_limit(options.max_deferred_tasks);
        log::debug!("runtime {} initialized", id);

        Self {
            inner: Rc::new(RuntimeInner {
                id,
                options,
                coroutines,
                queue,
                reactor: Mutex::new(reactor),
                state: Mutex::new(EventLoopState::default()),
                counters: SchedulerCounters::default(),
            }),
        }
    }

    /// Process-unique runtime id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Options the runtime was created with
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// The coroutine backend
    pub fn coroutines(&self) -> &dyn Coroutines {
        &*self.inner.coroutines
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EventLoopState> {
        self.inner.state.lock()
    }

    pub(crate) fn counters(&self) -> &SchedulerCounters {
        &self.inner.counters
    }

    fn ensure_live(&self) -> Result<(), RuntimeError> {
        if self.state().terminated {
            return Err(RuntimeError::Terminated);
        }
        Ok(())
    }

    /// Record a fatal error and mark the runtime terminated
    pub(crate) fn fail(&self, err: RuntimeError) {
        log::error!("runtime {} terminated: {}", self.id(), err);
        let mut state = self.state();
        state.terminated = true;
        state.last_error = Some(err);
    }

    // ===== Deferred work =====

    /// Queue `callback(runtime, data)` to run in a later round
    pub fn defer<T, F>(&self, callback: F, data: T) -> Result<(), RuntimeError>
    where
        F: FnOnce(&Runtime, T) + 'static,
        T: 'static,
    {
        self.ensure_live()?;
        self.inner.queue.defer(callback, data)?;
        Ok(())
    }

    /// Run one deferred round. Returns whether tasks remain.
    pub fn drain_one_round(&self) -> bool {
        self.inner.queue.drain_one_round(self)
    }

    /// Number of pending deferred tasks
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.len()
    }

    /// Pump the reactor and the deferred queue until both are idle.
    /// Returns the number of rounds.
    pub fn run_until_quiescent(&self) -> u64 {
        let rounds = RunLoopDriver::new(self).run();
        self.inner.counters.record_pump(rounds);
        rounds
    }

    // ===== Scheduler control =====

    /// Whether a scheduler coroutine is currently pumping
    pub fn is_scheduler_running(&self) -> bool {
        self.state().running
    }

    /// The registered scheduler coroutine
    pub fn scheduler(&self) -> Option<CoroutineId> {
        self.state().scheduler
    }

    fn reactor_alive(&self) -> bool {
        self.inner.reactor.lock().is_alive()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state().stop_requested
    }

    /// Create and launch the scheduler coroutine.
    ///
    /// The scheduler does not consume a coroutine serial: the counter is
    /// zeroed while it is created and restored afterwards.
    pub fn scheduler_start(&self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        {
            let state = self.state();
            if state.running || state.scheduler.is_some() {
                return Err(RuntimeError::AlreadyRunning);
            }
        }

        let co = self.coroutines();
        let saved = co.next_serial();
        co.set_next_serial(0);
        let created = co.create(SchedulerCoroutine::entry(self.clone()));
        co.set_next_serial(saved);
        let id = created?;

        self.state().scheduler = Some(id);
        co.register_scheduler(Some(id));
        log::debug!("runtime {}: starting scheduler {}", self.id(), id);

        if let Err(err) = co.resume(id) {
            self.state().scheduler = None;
            co.register_scheduler(None);
            co.discard(id);
            return Err(err.into());
        }

        let mut state = self.state();
        if state.terminated {
            return Err(state.last_error.take().unwrap_or(RuntimeError::Terminated));
        }
        Ok(())
    }

    /// Ask the scheduler coroutine to exit after its current pump
    pub fn scheduler_stop(&self) -> Result<(), RuntimeError> {
        let scheduler = {
            let mut state = self.state();
            let scheduler = state.scheduler.ok_or(RuntimeError::NoScheduler)?;
            state.stop_requested = true;
            scheduler
        };
        log::debug!("runtime {}: stopping scheduler {}", self.id(), scheduler);

        let co = self.coroutines();
        if co.current() == scheduler {
            return Ok(());
        }
        co.resume(scheduler)?;
        Ok(())
    }

    /// Cooperatively wait until only the scheduler and the caller are alive.
    ///
    /// The caller takes a lock (so the scheduler will hand control back to it
    /// after its next pump), then yields until the live coroutine count drops
    /// to two.
    pub fn wait_for_quiescence(&self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        let scheduler = self.scheduler().ok_or(RuntimeError::NoScheduler)?;

        let co = self.coroutines();
        if co.current() == scheduler {
            return Err(RuntimeError::CalledFromScheduler);
        }

        co.lock()?;
        loop {
            if !self.is_scheduler_running() {
                return Err(self.take_scheduler_error().unwrap_or(RuntimeError::NoScheduler));
            }
            if co.active_count() == 2 {
                return Ok(());
            }
            co.yield_current()?;
        }
    }

    /// Error that made the scheduler exit, if any
    pub fn take_scheduler_error(&self) -> Option<RuntimeError> {
        self.state().last_error.take()
    }

    /// Whether a fatal error terminated the runtime
    pub fn is_terminated(&self) -> bool {
        self.state().terminated
    }

    // ===== Coroutine conveniences =====

    /// Create a coroutine and defer its first resume. If the resume cannot
    /// be queued the coroutine is discarded again.
    pub fn spawn<F>(&self, entry: F) -> Result<CoroutineId, RuntimeError>
    where
        F: FnOnce(Runtime) + 'static,
    {
        self.ensure_live()?;
        let runtime = self.clone();
        let co = self.coroutines();
        let id = co.create(Box::new(move || entry(runtime)))?;

        if let Err(err) = self.defer(Self::resume_or_warn, id) {
            co.discard(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Let one round pass, then continue
    pub fn reschedule(&self) -> Result<(), RuntimeError> {
        let me = self.coroutines().current();
        self.defer(Self::resume_or_warn, me)?;
        self.coroutines().yield_current()?;
        Ok(())
    }

    /// Suspend the caller for at least `duration`
    pub fn sleep(&self, duration: Duration) -> Result<(), RuntimeError> {
        let me = self.coroutines().current();
        let handle = self.timer_init()?;

        let started = self.timer_start(handle, duration, None, move |runtime, handle| {
            if let Err(err) = runtime.close_handle(handle, None) {
                log::warn!("failed to close sleep timer {}: {}", handle, err);
            }
            runtime.resume_or_warn(me);
        });
        let result = started.and_then(|()| {
            self.coroutines()
                .yield_current()
                .map_err(RuntimeError::from)
        });

        if result.is_err() {
            if let Err(err) = self.close_handle(handle, None) {
                log::warn!("failed to close sleep timer {}: {}", handle, err);
            }
        }
        result
    }

    fn resume_or_warn(&self, id: CoroutineId) {
        if let Err(err) = self.coroutines().resume(id) {
            log::warn!("runtime {}: deferred resume of {} failed: {}", self.id(), id, err);
        }
    }

    // ===== Reactor handles =====

    /// Allocate an idle timer handle
    pub fn timer_init(&self) -> Result<HandleId, RuntimeError> {
        Ok(self.inner.reactor.lock().timer_init()?)
    }

    /// Start a timer; `repeat` re-arms it after every firing
    pub fn timer_start<F>(
        &self,
        handle: HandleId,
        timeout: Duration,
        repeat: Option<Duration>,
        callback: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnMut(&Runtime, HandleId) + 'static,
    {
        self.inner
            .reactor
            .lock()
            .timer_start(handle, timeout, repeat, Box::new(callback))?;
        Ok(())
    }

    /// Stop a timer without closing it
    pub fn timer_stop(&self, handle: HandleId) -> Result<(), RuntimeError> {
        Ok(self.inner.reactor.lock().timer_stop(handle)?)
    }

    /// Close a handle; `on_close` runs on the next reactor tick
    pub fn close_handle(
        &self,
        handle: HandleId,
        on_close: Option<CloseCallback<Runtime>>,
    ) -> Result<(), RuntimeError> {
        Ok(self.inner.reactor.lock().close(handle, on_close)?)
    }

    /// Number of open reactor handles
    pub fn handle_count(&self) -> usize {
        self.inner.reactor.lock().handle_count()
    }

    pub(crate) fn deadlock_timer(&self) -> Option<HandleId> {
        self.state().deadlock_timer
    }

    pub(crate) fn set_deadlock_timer(&self, handle: Option<HandleId>) {
        self.state().deadlock_timer = handle;
    }

    /// Whether the deadlock sentinel timer currently exists
    pub fn is_sentinel_armed(&self) -> bool {
        self.deadlock_timer().is_some()
    }

    // ===== Lifecycle =====

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot(
            self.inner.queue.deferred_count(),
            self.inner.queue.executed_count(),
        )
    }

    /// Stop the scheduler, close every handle, flush pending deferred tasks
    /// and release the coroutine backend. Close problems are only logged.
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
        }
        log::debug!("runtime {}: shutting down", self.id());

        if self.scheduler().is_some() {
            if let Err(err) = self.scheduler_stop() {
                log::warn!("runtime {}: failed to stop scheduler: {}", self.id(), err);
            }
        }
        self.state().stop_requested = false;

        let closed = self.inner.reactor.lock().close_all();
        if closed > 0 {
            log::debug!("runtime {}: closing {} open handles", self.id(), closed);
        }
        let rounds = self.run_until_quiescent();
        log::trace!("runtime {}: final drain took {} rounds", self.id(), rounds);

        if let Err(err) = self.inner.reactor.lock().shutdown() {
            log::warn!("runtime {}: {}", self.id(), err);
        }
        self.inner.coroutines.shutdown();

        {
            let mut state = self.state();
            state.terminated = true;
            state.deadlock_timer = None;
        }
        crate::module_init().release_runtime();
    }
}

impl LoopSources for Runtime {
    fn tick(&self, may_block: bool) -> bool {
        let fired = self.inner.reactor.lock().poll(may_block);

        // Callbacks run without the reactor lock: they may use the runtime
        for event in fired {
            match event {
                Fired::Timer {
                    handle,
                    generation,
                    mut callback,
                } => {
                    callback(self, handle);
                    self.inner.counters.record_timer();
                    self.inner.reactor.lock().rearm(handle, generation, callback);
                }
                Fired::Closed { handle, callback } => callback(self, handle),
            }
        }

        self.reactor_alive()
    }

    fn drain_round(&self) -> bool {
        self.inner.queue.drain_one_round(self)
    }

    fn has_pending(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    fn interrupted(&self) -> bool {
        self.stop_requested()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("running", &state.running)
            .field("scheduler", &state.scheduler)
            .field("terminated", &state.terminated)
            .finish_non_exhaustive()
    }
}
