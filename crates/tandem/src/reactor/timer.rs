//! Timer-only reactor
//!
//! Timers live in an arena; due times are kept in a min-heap with lazy
//! deletion. Every start or stop bumps the slot generation, so heap entries
//! left behind by an earlier arming are recognised and skipped.

use super::{CloseCallback, Fired, HandleId, Reactor, TimerCallback};
use crate::error::ReactorError;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread;
use std::time::{Duration, Instant};

/// Entry in the deadline heap
struct TimerEntry {
    deadline: Instant,
    handle: HandleId,
    generation: u64,
}

// Reverse ordering for min-heap (earliest deadline first, then lowest handle)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for TimerEntry {}

enum TimerState<C> {
    /// Initialized or stopped
    Idle,

    /// Started. `deadline` is None when the timeout is not representable.
    /// `callback` is None while the owner is running it.
    Active {
        deadline: Option<Instant>,
        repeat: Option<Duration>,
        callback: Option<TimerCallback<C>>,
    },

    /// Close requested, reported on the next poll
    Closing,
}

struct TimerSlot<C> {
    generation: u64,
    state: TimerState<C>,
}

/// Reactor serving timers only
pub struct TimerReactor<C> {
    slots: Vec<Option<TimerSlot<C>>>,
    free: Vec<usize>,
    heap: BinaryHeap<TimerEntry>,
    closing: Vec<(HandleId, Option<CloseCallback<C>>)>,
    max_poll_wait: Duration,
    max_handles: Option<usize>,
    open: usize,
}

impl<C> TimerReactor<C> {
    /// Create a reactor. `max_handles` of zero is rejected.
    pub fn new(max_poll_wait: Duration, max_handles: Option<usize>) -> Result<Self, ReactorError> {
        if max_handles == Some(0) {
            return Err(ReactorError::Init(
                "handle limit must allow at least one handle".to_string(),
            ));
        }

        Ok(Self {
            slots: Vec::new(),
            free: Vec::new(),
            heap: BinaryHeap::new(),
            closing: Vec::new(),
            max_poll_wait,
            max_handles,
            open: 0,
        })
    }

    fn slot_mut(&mut self, handle: HandleId) -> Result<&mut TimerSlot<C>, ReactorError> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(ReactorError::UnknownHandle(handle))
    }

    fn release(&mut self, handle: HandleId) {
        if let Some(slot) = self.slots.get_mut(handle.index()) {
            if slot.take().is_some() {
                self.free.push(handle.index());
                self.open -= 1;
            }
        }
    }

    /// Nearest live deadline, pruning stale heap entries on the way
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.is_current(entry) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn is_current(&self, entry: &TimerEntry) -> bool {
        match self.slots.get(entry.handle.index()).and_then(Option::as_ref) {
            Some(TimerSlot {
                generation,
                state:
                    TimerState::Active {
                        deadline: Some(deadline),
                        callback: Some(_),
                        ..
                    },
            }) => *generation == entry.generation && *deadline == entry.deadline,
            _ => false,
        }
    }

    fn has_active(&self) -> bool {
        self.slots.iter().flatten().any(|slot| {
            matches!(slot.state, TimerState::Active { .. })
        })
    }
}

impl<C> Reactor<C> for TimerReactor<C> {
    fn timer_init(&mut self) -> Result<HandleId, ReactorError> {
        if let Some(limit) = self.max_handles {
            if self.open >= limit {
                return Err(ReactorError::HandleLimit { limit });
            }
        }

        let slot = TimerSlot {
            generation: 0,
            state: TimerState::Idle,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.open += 1;
        Ok(HandleId::from_index(index))
    }

    fn timer_start(
        &mut self,
        handle: HandleId,
        timeout: Duration,
        repeat: Option<Duration>,
        callback: TimerCallback<C>,
    ) -> Result<(), ReactorError> {
        let slot = self.slot_mut(handle)?;
        if matches!(slot.state, TimerState::Closing) {
            return Err(ReactorError::Closing(handle));
        }

        slot.generation += 1;
        let generation = slot.generation;
        let deadline = Instant::now().checked_add(timeout);
        slot.state = TimerState::Active {
            deadline,
            repeat,
            callback: Some(callback),
        };

        if let Some(deadline) = deadline {
            self.heap.push(TimerEntry {
                deadline,
                handle,
                generation,
            });
        }
        Ok(())
    }

    fn timer_stop(&mut self, handle: HandleId) -> Result<(), ReactorError> {
        let slot = self.slot_mut(handle)?;
        match slot.state {
            TimerState::Closing => Err(ReactorError::Closing(handle)),
            TimerState::Idle => Ok(()),
            TimerState::Active { .. } => {
                slot.generation += 1;
                slot.state = TimerState::Idle;
                Ok(())
            }
        }
    }

    fn close(
        &mut self,
        handle: HandleId,
        on_close: Option<CloseCallback<C>>,
    ) -> Result<(), ReactorError> {
        let slot = self.slot_mut(handle)?;
        if matches!(slot.state, TimerState::Closing) {
            return Err(ReactorError::Closing(handle));
        }

        slot.generation += 1;
        slot.state = TimerState::Closing;
        self.closing.push((handle, on_close));
        Ok(())
    }

    fn close_all(&mut self) -> usize {
        let open: Vec<HandleId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                matches!(
                    slot,
                    Some(TimerSlot {
                        state: TimerState::Idle | TimerState::Active { .. },
                        ..
                    })
                )
            })
            .map(|(index, _)| HandleId::from_index(index))
            .collect();

        for handle in &open {
            if let Err(err) = self.close(*handle, None) {
                log::warn!("failed to close handle {}: {}", handle, err);
            }
        }
        open.len()
    }

    fn poll(&mut self, may_block: bool) -> Vec<Fired<C>> {
        let mut fired = Vec::new();

        for (handle, callback) in std::mem::take(&mut self.closing) {
            self.release(handle);
            if let Some(callback) = callback {
                fired.push(Fired::Closed { handle, callback });
            }
        }

        let next = self.next_deadline();
        if may_block && fired.is_empty() && self.has_active() {
            let wait = match next {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.max_poll_wait),
                None => self.max_poll_wait,
            };
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        let now = Instant::now();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if !self.is_current(&entry) {
                continue;
            }

            let Some(Some(slot)) = self.slots.get_mut(entry.handle.index()) else {
                continue;
            };
            let generation = slot.generation;
            let state = std::mem::replace(&mut slot.state, TimerState::Idle);
            if let TimerState::Active {
                repeat,
                callback: Some(callback),
                ..
            } = state
            {
                if let Some(interval) = repeat {
                    slot.state = TimerState::Active {
                        deadline: now.checked_add(interval),
                        repeat,
                        callback: None,
                    };
                }
                fired.push(Fired::Timer {
                    handle: entry.handle,
                    generation,
                    callback,
                });
            }
        }

        fired
    }

    fn rearm(&mut self, handle: HandleId, generation: u64, callback: TimerCallback<C>) {
        let Some(Some(slot)) = self.slots.get_mut(handle.index()) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        if let TimerState::Active {
            deadline,
            callback: pending,
            ..
        } = &mut slot.state
        {
            if pending.is_some() {
                return;
            }
            *pending = Some(callback);
            if let Some(deadline) = *deadline {
                self.heap.push(TimerEntry {
                    deadline,
                    handle,
                    generation,
                });
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.closing.is_empty() || self.has_active()
    }

    fn handle_count(&self) -> usize {
        self.open
    }

    fn shutdown(&mut self) -> Result<(), ReactorError> {
        let open = self.open;
        self.slots.clear();
        self.free.clear();
        self.heap.clear();
        self.closing.clear();
        self.open = 0;

        if open > 0 {
            return Err(ReactorError::Busy(open));
        }
        Ok(())
    }
}
