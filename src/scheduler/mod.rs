//! Deferred execution primitives.
//!
//! The engine never invokes a registered continuation synchronously; every
//! callback is funneled through a single deferral point. By default deferred
//! work lands on the engine's own FIFO queue and is drained by
//! [`Engine::run`](crate::Engine::run), which keeps tests fully deterministic.
//! A host can install its own [`Scheduler`] to route work elsewhere; the swap
//! takes effect for subsequently scheduled work only.
//!
//! Timers use a virtual clock in milliseconds. They never sleep: the run loop
//! jumps the clock forward to the next deadline once the task queue is empty.

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + 'static>;

/// The scheduler port: anything that can accept a deferred task.
///
/// Implementations decide when the task runs, but the engine's ordering
/// guarantees assume FIFO execution of tasks in submission order.
pub trait Scheduler {
    fn schedule(&self, task: Task);
}

// ---------------------------------------------------------------------------
// Timer Wheel
// ---------------------------------------------------------------------------

/// One-shot timers keyed on virtual time.
pub struct TimerWheel {
    timers: rustc_hash::FxHashMap<u64, TimerEntry>,
    next_id: u64,
}

struct TimerEntry {
    fire_at: u64,
    callback: Task,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            timers: rustc_hash::FxHashMap::default(),
            next_id: 1,
        }
    }

    /// Schedule a one-shot timer at an absolute virtual time, returns timer id.
    pub fn schedule(&mut self, fire_at: u64, callback: Task) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.insert(id, TimerEntry { fire_at, callback });
        id
    }

    /// Cancel a timer, returns true if it was still pending.
    pub fn cancel(&mut self, timer_id: u64) -> bool {
        self.timers.remove(&timer_id).is_some()
    }

    /// Remove and return the callbacks of all timers due at `now`,
    /// ordered by deadline then by scheduling order.
    pub fn take_expired(&mut self, now: u64) -> Vec<Task> {
        let mut due_ids: Vec<(u64, u64)> = self
            .timers
            .iter()
            .filter(|(_, entry)| entry.fire_at <= now)
            .map(|(id, entry)| (entry.fire_at, *id))
            .collect();
        due_ids.sort_unstable();
        due_ids
            .into_iter()
            .filter_map(|(_, id)| self.timers.remove(&id).map(|entry| entry.callback))
            .collect()
    }

    /// Returns the nearest deadline among pending timers.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.values().map(|entry| entry.fire_at).min()
    }

    /// Number of pending timers.
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Run Result
// ---------------------------------------------------------------------------

/// Result of running the engine's queue to completion via
/// [`Engine::run`](crate::Engine::run).
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Total number of queued tasks that were dequeued and executed.
    pub tasks_run: usize,
    /// Total number of timers that fired.
    pub timers_fired: usize,
    /// Number of clock advances performed to reach timer deadlines.
    pub clock_advances: usize,
    /// The virtual time when the run finished.
    pub final_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_timer_wheel_schedule_and_expire() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let log = fired.clone();
        wheel.schedule(20, Box::new(move || log.borrow_mut().push("late")));
        let log = fired.clone();
        wheel.schedule(10, Box::new(move || log.borrow_mut().push("early")));
        assert_eq!(wheel.pending_count(), 2);
        assert_eq!(wheel.next_deadline(), Some(10));

        for task in wheel.take_expired(5) {
            task();
        }
        assert!(fired.borrow().is_empty());

        for task in wheel.take_expired(25) {
            task();
        }
        assert_eq!(*fired.borrow(), vec!["early", "late"]);
        assert_eq!(wheel.pending_count(), 0);
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn test_timer_wheel_same_deadline_preserves_order() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = fired.clone();
            wheel.schedule(10, Box::new(move || log.borrow_mut().push(i)));
        }
        for task in wheel.take_expired(10) {
            task();
        }
        assert_eq!(*fired.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_timer_wheel_cancel() {
        let mut wheel = TimerWheel::new();
        let id = wheel.schedule(100, Box::new(|| {}));
        assert!(wheel.cancel(id));
        assert_eq!(wheel.pending_count(), 0);
        // Cancel again returns false
        assert!(!wheel.cancel(id));
        assert!(wheel.take_expired(200).is_empty());
    }
}
