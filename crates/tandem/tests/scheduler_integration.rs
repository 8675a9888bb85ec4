//! Integration tests for the scheduler coroutine and its controller

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tandem::config::DEFAULT_MAX_POLL_WAIT;
use tandem::coroutine::CoroutineEntry;
use tandem::scheduler::SchedulerCoroutine;
use tandem::{
    CoroutineError, CoroutineId, CoroutineState, Coroutines, DeferError, ErrorCategory, Runtime,
    RuntimeError, RuntimeOptions, StackfulCoroutines, TimerReactor,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn runtime_with(options: RuntimeOptions) -> Runtime {
    init_logger();
    Runtime::init(options).unwrap()
}

fn runtime() -> Runtime {
    runtime_with(RuntimeOptions::default())
}

#[test]
fn test_start_and_stop() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    let scheduler = rt.scheduler().unwrap();
    assert!(rt.is_scheduler_running());
    assert_eq!(rt.coroutines().active_count(), 2);
    assert_eq!(rt.coroutines().state(scheduler), CoroutineState::Waiting);
    assert_eq!(rt.stats().pumps, 0);

    rt.scheduler_stop().unwrap();
    assert!(!rt.is_scheduler_running());
    assert!(rt.scheduler().is_none());
    assert_eq!(rt.coroutines().state(scheduler), CoroutineState::Dead);
    assert_eq!(rt.coroutines().active_count(), 1);
    assert_eq!(rt.coroutines().current(), CoroutineId::ROOT);

    rt.shutdown();
}

#[test]
fn test_scheduler_does_not_consume_serials() {
    let rt = runtime();
    let co = rt.coroutines();
    assert_eq!(co.next_serial(), 2);

    rt.scheduler_start().unwrap();
    let scheduler = rt.scheduler().unwrap();
    assert_eq!(co.serial(scheduler), Some(0));
    assert_eq!(co.next_serial(), 2);

    let worker = rt.spawn(|_| {}).unwrap();
    assert_eq!(co.serial(worker), Some(2));

    rt.wait_for_quiescence().unwrap();
    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_double_start_is_misuse() {
    let rt = runtime();
    rt.scheduler_start().unwrap();
    let first = rt.scheduler();

    let err = rt.scheduler_start().unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyRunning));
    assert_eq!(err.category(), ErrorCategory::Misuse);
    assert_eq!(rt.scheduler(), first);
    assert_eq!(rt.coroutines().active_count(), 2);

    rt.scheduler_stop().unwrap();
    assert!(matches!(rt.scheduler_stop(), Err(RuntimeError::NoScheduler)));

    // A stopped scheduler can be started again
    rt.scheduler_start().unwrap();
    assert!(rt.is_scheduler_running());
    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_wait_for_quiescence_waits_for_all_workers() {
    const WORKERS: usize = 4;
    const YIELDS: u64 = 3;

    let rt = runtime();
    rt.scheduler_start().unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..WORKERS {
        let finished = Arc::clone(&finished);
        rt.spawn(move |rt| {
            for _ in 0..YIELDS {
                rt.reschedule().unwrap();
            }
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    rt.wait_for_quiescence().unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), WORKERS);
    assert_eq!(rt.coroutines().active_count(), 2);
    assert!(rt.stats().rounds >= YIELDS + 1);
    assert_eq!(rt.stats().deadlocks_suspected, 0);
    assert!(!rt.coroutines().is_locked(CoroutineId::ROOT));

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_wait_for_sleeping_workers() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for i in 0..3u64 {
        let finished = Arc::clone(&finished);
        rt.spawn(move |rt| {
            rt.sleep(Duration::from_millis(2 + i)).unwrap();
            rt.sleep(Duration::from_millis(1)).unwrap();
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    rt.wait_for_quiescence().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(rt.stats().timers_fired, 6);

    // Timers started by the final round wait for the next pump, so the
    // sentinel may still be armed here; one more run tears it down
    rt.scheduler_stop().unwrap();
    rt.run_until_quiescent();
    assert_eq!(rt.handle_count(), 0);
    rt.shutdown();
}

#[test]
fn test_workers_run_on_the_root_thread() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..3 {
        let seen = Rc::clone(&seen);
        rt.spawn(move |rt| {
            seen.borrow_mut().push(thread::current().id());
            rt.reschedule().unwrap();
            seen.borrow_mut().push(thread::current().id());
        })
        .unwrap();
    }
    rt.wait_for_quiescence().unwrap();

    let root = thread::current().id();
    assert_eq!(seen.borrow().len(), 6);
    assert!(seen.borrow().iter().all(|id| *id == root));

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_wait_from_scheduler_is_rejected() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    // Deferred tasks run on the scheduler coroutine
    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    rt.defer(
        move |rt: &Runtime, _: ()| {
            *slot.lock() = Some(rt.wait_for_quiescence());
        },
        (),
    )
    .unwrap();

    rt.wait_for_quiescence().unwrap();
    assert!(matches!(
        outcome.lock().take(),
        Some(Err(RuntimeError::CalledFromScheduler))
    ));

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_stop_requested_from_scheduler() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    rt.defer(|rt: &Runtime, _: ()| rt.scheduler_stop().unwrap(), ())
        .unwrap();
    rt.coroutines().yield_current().unwrap();

    assert!(!rt.is_scheduler_running());
    assert!(rt.scheduler().is_none());
    assert_eq!(rt.coroutines().active_count(), 1);
    rt.shutdown();
}

#[test]
fn test_reentering_scheduler_is_misuse() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    rt.spawn(move |rt| {
        *slot.lock() = Some(SchedulerCoroutine::new(rt.clone()).run());
    })
    .unwrap();

    rt.wait_for_quiescence().unwrap();
    assert!(matches!(
        outcome.lock().take(),
        Some(Err(RuntimeError::AlreadyRunning))
    ));
    assert!(rt.is_scheduler_running());
    assert!(!rt.is_terminated());

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_coroutine_limit_blocks_spawn() {
    let rt = runtime_with(RuntimeOptions::with_coroutine_limit(2));
    rt.scheduler_start().unwrap();

    let err = rt.spawn(|_| {}).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Coroutine(CoroutineError::LimitReached { limit: 2 })
    ));
    assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    assert_eq!(rt.pending_tasks(), 0);

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_spawn_with_full_queue_leaves_no_coroutine() {
    let rt = runtime_with(RuntimeOptions::with_queue_limit(1));
    rt.scheduler_start().unwrap();
    rt.defer(|_, _| {}, ()).unwrap();

    let co = rt.coroutines();
    let err = rt.spawn(|_| unreachable!()).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Defer(DeferError::Exhausted { limit: 1 })
    ));
    assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    assert_eq!(co.active_count(), 2);
    assert_eq!(co.next_serial(), 2);
    assert_eq!(rt.pending_tasks(), 1);

    // Nothing is left behind for the wait to spin on
    rt.wait_for_quiescence().unwrap();
    let worker = rt.spawn(|_| {}).unwrap();
    assert_eq!(co.serial(worker), Some(2));
    rt.wait_for_quiescence().unwrap();

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_panicking_task_clears_scheduler() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    rt.defer(|_: &Runtime, _: ()| panic!("task failed"), ()).unwrap();
    rt.coroutines().yield_current().unwrap();

    assert!(!rt.is_scheduler_running());
    assert!(rt.scheduler().is_none());
    assert_eq!(rt.coroutines().active_count(), 1);
    assert_eq!(rt.coroutines().current(), CoroutineId::ROOT);

    // The scheduler can be started again and keeps working
    rt.scheduler_start().unwrap();
    let finished = Rc::new(Cell::new(false));
    let flag = Rc::clone(&finished);
    rt.spawn(move |_| flag.set(true)).unwrap();
    rt.wait_for_quiescence().unwrap();
    assert!(finished.get());

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_panicking_timer_clears_scheduler() {
    let rt = runtime();
    rt.scheduler_start().unwrap();

    let handle = rt.timer_init().unwrap();
    rt.timer_start(handle, Duration::ZERO, None, |_, _| panic!("timer failed"))
        .unwrap();
    rt.coroutines().yield_current().unwrap();

    assert!(!rt.is_scheduler_running());
    assert!(rt.scheduler().is_none());
    rt.scheduler_start().unwrap();
    assert!(rt.is_scheduler_running());

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

/// Backend that refuses every resume while `refuse` is set
struct RefusingBackend {
    inner: StackfulCoroutines,
    refuse: Cell<bool>,
}

impl Coroutines for RefusingBackend {
    fn current(&self) -> CoroutineId {
        self.inner.current()
    }

    fn create(&self, entry: CoroutineEntry) -> Result<CoroutineId, CoroutineError> {
        self.inner.create(entry)
    }

    fn discard(&self, id: CoroutineId) -> bool {
        self.inner.discard(id)
    }

    fn resume(&self, id: CoroutineId) -> Result<(), CoroutineError> {
        if self.refuse.get() {
            return Err(CoroutineError::Dead(id));
        }
        self.inner.resume(id)
    }

    fn exchange(&self, id: CoroutineId) -> Result<Option<CoroutineId>, CoroutineError> {
        self.inner.exchange(id)
    }

    fn exchange_with_previous(&self) -> Result<Option<CoroutineId>, CoroutineError> {
        self.inner.exchange_with_previous()
    }

    fn yield_current(&self) -> Result<(), CoroutineError> {
        self.inner.yield_current()
    }

    fn lock(&self) -> Result<(), CoroutineError> {
        self.inner.lock()
    }

    fn unlock(&self, id: CoroutineId) -> bool {
        self.inner.unlock(id)
    }

    fn state(&self, id: CoroutineId) -> CoroutineState {
        self.inner.state(id)
    }

    fn previous(&self, id: CoroutineId) -> Option<CoroutineId> {
        self.inner.previous(id)
    }

    fn serial(&self, id: CoroutineId) -> Option<u64> {
        self.inner.serial(id)
    }

    fn next_serial(&self) -> u64 {
        self.inner.next_serial()
    }

    fn set_next_serial(&self, serial: u64) {
        self.inner.set_next_serial(serial)
    }

    fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    fn register_scheduler(&self, id: Option<CoroutineId>) {
        self.inner.register_scheduler(id)
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}

#[test]
fn test_failed_launch_leaves_no_scheduler() {
    init_logger();
    let backend = Rc::new(RefusingBackend {
        inner: StackfulCoroutines::new(),
        refuse: Cell::new(true),
    });
    let reactor = TimerReactor::<Runtime>::new(DEFAULT_MAX_POLL_WAIT, None).unwrap();
    let rt = Runtime::with_parts(RuntimeOptions::default(), backend.clone(), Box::new(reactor));

    let err = rt.scheduler_start().unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Coroutine(CoroutineError::Dead(_))
    ));
    assert!(rt.scheduler().is_none());
    assert!(!rt.is_scheduler_running());
    assert_eq!(rt.coroutines().active_count(), 1);
    assert_eq!(rt.coroutines().next_serial(), 2);

    backend.refuse.set(false);
    rt.scheduler_start().unwrap();
    assert_eq!(rt.coroutines().active_count(), 2);

    rt.scheduler_stop().unwrap();
    rt.shutdown();
}

#[test]
fn test_coroutine_limit_blocks_scheduler() {
    let rt = runtime_with(RuntimeOptions::with_coroutine_limit(1));

    let err = rt.scheduler_start().unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Coroutine(CoroutineError::LimitReached { limit: 1 })
    ));
    assert!(rt.scheduler().is_none());
    assert!(!rt.is_scheduler_running());
    assert_eq!(rt.coroutines().next_serial(), 2);
    rt.shutdown();
}

#[test]
fn test_reschedule_interleaves_workers() {
    let rt = runtime();
    let trace = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
        let trace = Arc::clone(&trace);
        rt.spawn(move |rt| {
            for step in 1..=2 {
                trace.lock().push(format!("{}{}", name, step));
                rt.reschedule().unwrap();
            }
        })
        .unwrap();
    }

    // Without a scheduler the host drives the loop itself
    rt.run_until_quiescent();
    assert_eq!(*trace.lock(), vec!["a1", "b1", "a2", "b2"]);
    assert_eq!(rt.coroutines().active_count(), 1);
    rt.shutdown();
}

#[test]
fn test_shutdown_releases_suspended_coroutines() {
    let rt = runtime();
    let outcome = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&outcome);
    let worker = rt
        .spawn(move |rt| {
            let result = rt.coroutines().yield_current();
            *slot.lock() = Some(matches!(result, Err(CoroutineError::Shutdown)));
        })
        .unwrap();

    rt.run_until_quiescent();
    assert_eq!(rt.coroutines().state(worker), CoroutineState::Waiting);

    rt.shutdown();
    assert_eq!(*outcome.lock(), Some(true));
    assert_eq!(rt.coroutines().state(worker), CoroutineState::Dead);
}

#[test]
fn test_shutdown_stops_running_scheduler() {
    let rt = runtime();
    rt.scheduler_start().unwrap();
    let scheduler = rt.scheduler().unwrap();

    rt.shutdown();
    assert!(!rt.is_scheduler_running());
    assert_eq!(rt.coroutines().state(scheduler), CoroutineState::Dead);
    assert!(matches!(rt.scheduler_start(), Err(RuntimeError::Terminated)));
}
