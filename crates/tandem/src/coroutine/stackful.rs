//! Stackful coroutine backend
//!
//! Every coroutine owns a private stack switched with `corosensei`, and all
//! of them run on the thread that created the backend. The root never
//! suspends: when it hands control away it runs a dispatch loop on its own
//! stack, resuming whichever coroutine currently holds control until control
//! comes back. A coroutine that transfers elsewhere records the target and
//! suspends into that loop.

use super::{CoroutineEntry, CoroutineId, CoroutineState, Coroutines};
use crate::config::DEFAULT_STACK_SIZE;
use crate::error::CoroutineError;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, RefCell, RefMut};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

/// Why a suspended coroutine is resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Run,
    Shutdown,
}

type Body = Coroutine<Wake, (), ()>;

/// Suspension point of a started coroutine; null until its body runs
type YielderCell = Rc<Cell<*const Yielder<Wake, ()>>>;

/// Arena record of one coroutine
struct Slot {
    /// Identity number
    serial: u64,

    /// Current state
    state: CoroutineState,

    /// Coroutine that resumed this one (weak back-reference by index)
    previous: Option<CoroutineId>,

    /// Coroutine that most recently transferred control into this one
    entered_from: Option<CoroutineId>,

    /// Outstanding lock units
    lock_count: u32,

    /// Suspended stack. None for the root, while running, and once finished.
    body: Option<Body>,

    yielder: YielderCell,
}

impl Slot {
    fn new(serial: u64, state: CoroutineState, body: Option<Body>, yielder: YielderCell) -> Self {
        Self {
            serial,
            state,
            previous: None,
            entered_from: None,
            lock_count: 0,
            body,
            yielder,
        }
    }
}

struct Table {
    slots: Vec<Slot>,
    /// Coroutine holding control
    current: CoroutineId,
    /// Live coroutines, root included
    active: usize,
    next_serial: u64,
    scheduler: Option<CoroutineId>,
    shutdown: bool,
}

impl Table {
    fn slot(&self, id: CoroutineId) -> Result<&Slot, CoroutineError> {
        self.slots.get(id.index()).ok_or(CoroutineError::Unknown(id))
    }

    fn check_resumable(&self, id: CoroutineId, caller: CoroutineId) -> Result<(), CoroutineError> {
        if id == caller {
            return Err(CoroutineError::AlreadyRunning(id));
        }
        match self.slot(id)?.state {
            CoroutineState::Dead => Err(CoroutineError::Dead(id)),
            CoroutineState::Locked => Err(CoroutineError::Locked(id)),
            CoroutineState::Running => Err(CoroutineError::AlreadyRunning(id)),
            CoroutineState::Runnable | CoroutineState::Waiting => Ok(()),
        }
    }

    /// Target of a yield or lock issued by `caller`
    fn yield_target(&self, caller: CoroutineId) -> Result<CoroutineId, CoroutineError> {
        let alive = |id: &CoroutineId| {
            self.slots
                .get(id.index())
                .is_some_and(|slot| slot.state.is_alive())
        };
        self.slot(caller)?
            .previous
            .filter(alive)
            .or(self.scheduler.filter(|s| *s != caller))
            .ok_or(CoroutineError::NoTarget(caller))
    }

    fn retire(&mut self, id: CoroutineId) {
        let slot = &mut self.slots[id.index()];
        if slot.state != CoroutineState::Dead {
            slot.state = CoroutineState::Dead;
            slot.lock_count = 0;
            slot.previous = None;
            self.active -= 1;
        }
    }

    /// Hand control to `to`; the caller has already set the leaving
    /// coroutine's state
    fn enter(&mut self, from: CoroutineId, to: CoroutineId) {
        let target = &mut self.slots[to.index()];
        target.entered_from = Some(from);
        target.state = CoroutineState::Running;
        self.current = to;
    }

    /// Control after `id` returned: its previous if still alive, else the root
    fn finish(&mut self, id: CoroutineId) {
        let previous = self.slots[id.index()].previous;
        self.retire(id);

        let target = previous
            .filter(|p| self.slots[p.index()].state.is_alive())
            .unwrap_or(CoroutineId::ROOT);
        let slot = &mut self.slots[target.index()];
        if slot.lock_count > 0 {
            log::warn!(
                "coroutine {} finished with no live resumer; releasing locked coroutine {}",
                id,
                target
            );
            slot.lock_count = 0;
        }
        self.enter(id, target);
    }
}

/// Coroutine backend multiplexing stackful coroutines over the calling thread
pub struct StackfulCoroutines {
    table: RefCell<Table>,
    stack_size: usize,
    max_coroutines: Option<usize>,
}

impl StackfulCoroutines {
    /// Create a backend; the calling code becomes the root coroutine
    pub fn new() -> Self {
        Self::with_limits(None, None)
    }

    /// Create a backend with a per-coroutine stack size and a live
    /// coroutine limit (root included)
    pub fn with_limits(stack_size: Option<usize>, max_coroutines: Option<usize>) -> Self {
        let root = Slot::new(
            1,
            CoroutineState::Running,
            None,
            Rc::new(Cell::new(ptr::null())),
        );

        Self {
            table: RefCell::new(Table {
                slots: vec![root],
                current: CoroutineId::ROOT,
                active: 1,
                next_serial: 2,
                scheduler: None,
                shutdown: false,
            }),
            stack_size: stack_size.unwrap_or(DEFAULT_STACK_SIZE),
            max_coroutines,
        }
    }

    fn live_table(&self) -> Result<RefMut<'_, Table>, CoroutineError> {
        let table = self.table.borrow_mut();
        if table.shutdown {
            return Err(CoroutineError::Shutdown);
        }
        Ok(table)
    }

    /// Move control from `from` to `to` and return once it comes back
    fn transfer(
        &self,
        mut table: RefMut<'_, Table>,
        from: CoroutineId,
        to: CoroutineId,
    ) -> Result<(), CoroutineError> {
        table.enter(from, to);
        let yielder = table.slots[from.index()].yielder.get();
        drop(table);

        if from == CoroutineId::ROOT {
            return self.dispatch();
        }

        debug_assert!(!yielder.is_null(), "transfer from a coroutine that never started");
        // SAFETY: `from` is the coroutine executing right now. Its body set
        // the yielder on entry and clears it only after the entry returned,
        // so the pointee lives in a frame that is still on the current stack.
        match unsafe { &*yielder }.suspend(()) {
            Wake::Run => Ok(()),
            Wake::Shutdown => Err(CoroutineError::Shutdown),
        }
    }

    /// Trampoline on the root stack: resume whoever holds control until the
    /// root does again
    fn dispatch(&self) -> Result<(), CoroutineError> {
        loop {
            let (id, mut body) = {
                let mut table = self.table.borrow_mut();
                let id = table.current;
                if id == CoroutineId::ROOT {
                    return Ok(());
                }
                match table.slots[id.index()].body.take() {
                    Some(body) => (id, body),
                    None => {
                        log::error!("coroutine {} holds control without a stack", id);
                        table.retire(id);
                        table.enter(id, CoroutineId::ROOT);
                        return Ok(());
                    }
                }
            };

            match body.resume(Wake::Run) {
                CoroutineResult::Yield(()) => {
                    self.table.borrow_mut().slots[id.index()].body = Some(body);
                }
                CoroutineResult::Return(()) => {
                    drop(body);
                    let shutting_down = {
                        let mut table = self.table.borrow_mut();
                        table.finish(id);
                        table.shutdown
                    };
                    if shutting_down {
                        self.release_all();
                        return Err(CoroutineError::Shutdown);
                    }
                }
            }
        }
    }

    /// Wake every suspended coroutine with a shutdown signal so its pending
    /// transfer fails and its entry can return. Runs on the root stack.
    fn release_all(&self) {
        loop {
            let next = {
                let mut table = self.table.borrow_mut();
                let found = table
                    .slots
                    .iter_mut()
                    .enumerate()
                    .find_map(|(index, slot)| {
                        slot.body.take().map(|body| (CoroutineId::from_index(index), body))
                    });
                if let Some((id, _)) = &found {
                    let id = *id;
                    table.enter(CoroutineId::ROOT, id);
                }
                found
            };
            let Some((id, mut body)) = next else {
                break;
            };

            if let CoroutineResult::Yield(()) = body.resume(Wake::Shutdown) {
                log::warn!("coroutine {} suspended again during shutdown; leaking its stack", id);
                std::mem::forget(body);
            }
            self.table.borrow_mut().retire(id);
        }

        let mut table = self.table.borrow_mut();
        let root = &mut table.slots[CoroutineId::ROOT.index()];
        root.state = CoroutineState::Running;
        root.lock_count = 0;
        table.current = CoroutineId::ROOT;
    }
}

impl Default for StackfulCoroutines {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StackfulCoroutines {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Coroutines for StackfulCoroutines {
    fn current(&self) -> CoroutineId {
        self.table.borrow().current
    }

    fn create(&self, entry: CoroutineEntry) -> Result<CoroutineId, CoroutineError> {
        let mut table = self.live_table()?;
        if let Some(limit) = self.max_coroutines {
            if table.active >= limit {
                return Err(CoroutineError::LimitReached { limit });
            }
        }

        let stack = DefaultStack::new(self.stack_size)?;
        let id = CoroutineId::from_index(table.slots.len());
        let yielder: YielderCell = Rc::new(Cell::new(ptr::null()));

        let entry_yielder = Rc::clone(&yielder);
        let body = Coroutine::with_stack(stack, move |suspend: &Yielder<Wake, ()>, wake: Wake| {
            if wake == Wake::Shutdown {
                return;
            }
            entry_yielder.set(suspend);
            if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                log::error!("coroutine {} panicked; treating it as finished", id);
            }
            entry_yielder.set(ptr::null());
        });

        let serial = table.next_serial;
        table.next_serial = serial.wrapping_add(1);
        table
            .slots
            .push(Slot::new(serial, CoroutineState::Runnable, Some(body), yielder));
        table.active += 1;
        Ok(id)
    }

    fn discard(&self, id: CoroutineId) -> bool {
        let body = {
            let mut table = self.table.borrow_mut();
            let serial = match table.slots.get(id.index()) {
                Some(slot) if slot.state == CoroutineState::Runnable => slot.serial,
                _ => return false,
            };

            let newest = id.index() + 1 == table.slots.len()
                && table.next_serial == serial.wrapping_add(1);
            if newest {
                let slot = table.slots.pop();
                table.active -= 1;
                table.next_serial = serial;
                slot.and_then(|slot| slot.body)
            } else {
                let body = table.slots[id.index()].body.take();
                table.retire(id);
                body
            }
        };

        // Never started, so dropping only releases the entry and the stack
        drop(body);
        true
    }

    fn resume(&self, id: CoroutineId) -> Result<(), CoroutineError> {
        let mut table = self.live_table()?;
        let from = table.current;
        table.check_resumable(id, from)?;

        table.slots[id.index()].previous = Some(from);
        table.slots[from.index()].state = CoroutineState::Waiting;
        self.transfer(table, from, id)
    }

    fn exchange(&self, id: CoroutineId) -> Result<Option<CoroutineId>, CoroutineError> {
        let mut table = self.live_table()?;
        let from = table.current;
        table.check_resumable(id, from)?;

        table.slots[id.index()].previous = Some(from);
        let slot = &mut table.slots[from.index()];
        slot.previous = None;
        slot.state = CoroutineState::Waiting;

        self.transfer(table, from, id)?;
        Ok(self.table.borrow().slots[from.index()].entered_from)
    }

    fn exchange_with_previous(&self) -> Result<Option<CoroutineId>, CoroutineError> {
        let target = {
            let table = self.live_table()?;
            let from = table.current;
            table.slot(from)?.previous.ok_or(CoroutineError::NoTarget(from))?
        };
        self.exchange(target)
    }

    fn yield_current(&self) -> Result<(), CoroutineError> {
        let mut table = self.live_table()?;
        let from = table.current;
        let to = table.yield_target(from)?;
        table.check_resumable(to, from)?;

        let slot = &mut table.slots[from.index()];
        slot.previous = None;
        slot.state = CoroutineState::Waiting;
        self.transfer(table, from, to)
    }

    fn lock(&self) -> Result<(), CoroutineError> {
        let mut table = self.live_table()?;
        let from = table.current;
        let to = table.yield_target(from)?;
        table.check_resumable(to, from)?;

        let slot = &mut table.slots[from.index()];
        slot.previous = None;
        slot.lock_count += 1;
        slot.state = CoroutineState::Locked;
        self.transfer(table, from, to)
    }

    fn unlock(&self, id: CoroutineId) -> bool {
        let mut table = self.table.borrow_mut();
        match table.slots.get_mut(id.index()) {
            Some(slot) if slot.lock_count > 0 => {
                slot.lock_count -= 1;
                if slot.lock_count == 0 && slot.state == CoroutineState::Locked {
                    slot.state = CoroutineState::Waiting;
                }
                true
            }
            _ => false,
        }
    }

    fn state(&self, id: CoroutineId) -> CoroutineState {
        self.table
            .borrow()
            .slots
            .get(id.index())
            .map(|slot| slot.state)
            .unwrap_or(CoroutineState::Dead)
    }

    fn previous(&self, id: CoroutineId) -> Option<CoroutineId> {
        self.table
            .borrow()
            .slots
            .get(id.index())
            .and_then(|slot| slot.previous)
    }

    fn serial(&self, id: CoroutineId) -> Option<u64> {
        self.table
            .borrow()
            .slots
            .get(id.index())
            .map(|slot| slot.serial)
    }

    fn next_serial(&self) -> u64 {
        self.table.borrow().next_serial
    }

    fn set_next_serial(&self, serial: u64) {
        self.table.borrow_mut().next_serial = serial;
    }

    fn active_count(&self) -> usize {
        self.table.borrow().active
    }

    fn register_scheduler(&self, id: Option<CoroutineId>) {
        self.table.borrow_mut().scheduler = id;
    }

    fn shutdown(&self) {
        let at_root = {
            let mut table = self.table.borrow_mut();
            table.shutdown = true;
            table.current == CoroutineId::ROOT
        };
        // From inside a coroutine, the dispatch loop releases the rest once
        // that coroutine returns
        if at_root {
            self.release_all();
        }
    }
}
