//! Lazy timer wheel for coarse, refreshable timeouts.
//!
//! A fixed ring of slots is advanced one slot per second by the owning
//! loop's `timerfd`. A task lives wherever a slot holds a strong reference
//! to it; refreshing simply drops another strong reference into a later slot,
//! so extending an idle timeout never recomputes or removes anything. The
//! slot that releases the *last* reference fires the task, unless it was
//! cancelled first.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::rc::{Rc, Weak};

/// Number of slots in the wheel; with one tick per second this bounds
/// schedulable timeouts to just under a minute.
pub const WHEEL_SIZE: usize = 60;

/// Action executed when a timer task fires.
pub type TimerAction = Box<dyn FnOnce()>;

/// One scheduled timeout.
///
/// Owned strongly by wheel slots only; the wheel's lookup table keeps a weak
/// reference per task id. The action runs at most once.
pub struct TimerTask {
    id: u64,
    timeout: u64,
    action: RefCell<Option<TimerAction>>,
    cancelled: Cell<bool>,
}

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancelled.get())
            .finish_non_exhaustive()
    }
}

impl TimerTask {
    fn new(id: u64, timeout: u64, action: TimerAction) -> Rc<Self> {
        Rc::new(TimerTask {
            id,
            timeout,
            action: RefCell::new(Some(action)),
            cancelled: Cell::new(false),
        })
    }

    /// Task id, as registered in the wheel's lookup table.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Suppresses the action when the last reference is eventually released.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Runs the action unless cancelled. Taking the action out of its slot
    /// guarantees at-most-once execution even if called again.
    pub fn fire(&self) {
        if self.cancelled.get() {
            return;
        }
        if let Some(action) = self.action.borrow_mut().take() {
            action();
        }
    }
}

/// Fixed-size circular array of task slots plus an id lookup table.
///
/// All mutation must happen on the owning loop's thread; the wheel lives
/// inside the (`!Send`) [EventLoop](crate::reactor::EventLoop), which makes
/// off-thread access a compile error rather than a runtime fault.
#[derive(Debug)]
pub struct TimerWheel {
    slots: Vec<Vec<Rc<TimerTask>>>,
    lookup: HashMap<u64, Weak<TimerTask>>,
    cursor: usize,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    /// Creates an empty wheel.
    pub fn new() -> Self {
        TimerWheel {
            slots: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
            lookup: HashMap::new(),
            cursor: 0,
        }
    }

    /// Schedules `action` to fire `timeout` ticks from now under `id`.
    pub fn add_task(&mut self, id: u64, timeout: u64, action: TimerAction) {
        let task = TimerTask::new(id, timeout, action);
        self.lookup.insert(id, Rc::downgrade(&task));
        let slot = (self.cursor + timeout as usize) % WHEEL_SIZE;
        self.slots[slot].push(task);
    }

    /// Extends the task's life by its original timeout from the current
    /// tick, by dropping another owning reference into a later slot. The
    /// earlier reference is left to rotate out on its own.
    pub fn refresh_task(&mut self, id: u64) {
        if let Some(task) = self.lookup.get(&id).and_then(Weak::upgrade) {
            let slot = (self.cursor + task.timeout as usize) % WHEEL_SIZE;
            self.slots[slot].push(task);
        }
    }

    /// Cancels the task and forgets its id. References still held by slots
    /// rotate out without firing.
    pub fn remove_task(&mut self, id: u64) {
        if let Some(weak) = self.lookup.remove(&id) {
            if let Some(task) = weak.upgrade() {
                task.cancel();
            }
        }
    }

    /// Whether a task is registered under `id`.
    pub fn has_task(&self, id: u64) -> bool {
        self.lookup.contains_key(&id)
    }

    /// Advances the cursor one tick and empties the slot it lands on,
    /// returning the released references.
    ///
    /// The caller fires each returned task for which it now holds the last
    /// strong reference, *after* releasing its borrow of the wheel, so that
    /// actions may re-enter the wheel (a close action cancels its own idle
    /// timer, for example).
    pub fn advance(&mut self) -> Vec<Rc<TimerTask>> {
        self.cursor = (self.cursor + 1) % WHEEL_SIZE;
        mem::take(&mut self.slots[self.cursor])
    }

    /// Drops the lookup entry left behind by a fired task. The entry is kept
    /// if the action re-registered the same id with a fresh task.
    pub fn forget(&mut self, task: &Rc<TimerTask>) {
        if self
            .lookup
            .get(&task.id)
            .is_some_and(|weak| weak.as_ptr() == Rc::as_ptr(task))
        {
            self.lookup.remove(&task.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mirrors the owning loop's per-tick drive of the wheel.
    fn tick(wheel: &RefCell<TimerWheel>) {
        let released = wheel.borrow_mut().advance();
        for task in released {
            if Rc::strong_count(&task) == 1 {
                task.fire();
                wheel.borrow_mut().forget(&task);
            }
        }
    }

    #[test]
    fn fires_after_exactly_timeout_ticks() {
        let wheel = RefCell::new(TimerWheel::new());
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        wheel
            .borrow_mut()
            .add_task(1, 3, Box::new(move || f.set(f.get() + 1)));

        tick(&wheel);
        tick(&wheel);
        assert_eq!(fired.get(), 0);

        tick(&wheel);
        assert_eq!(fired.get(), 1);
        assert!(!wheel.borrow().has_task(1));
    }

    #[test]
    fn removed_task_never_fires() {
        let wheel = RefCell::new(TimerWheel::new());
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        wheel.borrow_mut().add_task(7, 2, Box::new(move || f.set(true)));
        wheel.borrow_mut().remove_task(7);
        assert!(!wheel.borrow().has_task(7));

        for _ in 0..4 {
            tick(&wheel);
        }
        assert!(!fired.get());
    }

    #[test]
    fn refresh_restarts_the_countdown() {
        let wheel = RefCell::new(TimerWheel::new());
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        wheel
            .borrow_mut()
            .add_task(3, 2, Box::new(move || f.set(f.get() + 1)));

        tick(&wheel);
        wheel.borrow_mut().refresh_task(3);

        // Original deadline passes while a second owner exists: no fire.
        tick(&wheel);
        assert_eq!(fired.get(), 0);

        // Two ticks after the refresh the last owner releases it.
        tick(&wheel);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn action_runs_at_most_once() {
        let wheel = RefCell::new(TimerWheel::new());
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        wheel
            .borrow_mut()
            .add_task(9, 1, Box::new(move || f.set(f.get() + 1)));

        for _ in 0..(2 * WHEEL_SIZE) {
            tick(&wheel);
        }
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn action_may_reenter_the_wheel() {
        let wheel = Rc::new(RefCell::new(TimerWheel::new()));
        let fired = Rc::new(Cell::new(false));

        let w = wheel.clone();
        let f = fired.clone();
        wheel.borrow_mut().add_task(
            4,
            1,
            Box::new(move || {
                let inner = f.clone();
                w.borrow_mut().add_task(5, 1, Box::new(move || inner.set(true)));
            }),
        );

        tick(&wheel);
        assert!(wheel.borrow().has_task(5));
        tick(&wheel);
        assert!(fired.get());
    }
}
