//! The engine context.
//!
//! An [`Engine`] owns everything that would be process-global in a dynamic
//! runtime: the deferral queue, the virtual clock and timer wheel, the
//! configuration flags, the collector and rejection-handler registries, and
//! the statistics counters. Engines are cheap `Rc` handles; tests construct
//! one per case and run it to completion deterministically.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::diagnostics::{RejectionEvent, UncaughtRejection};
use crate::error::EngineError;
use crate::promise::{resolver, settle, Deferred, Promise, Resolution, State};
use crate::scheduler::{RunResult, Scheduler, Task, TimerWheel};
use crate::timing::Collector;
use crate::value::{Fault, Value};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Cumulative counters for one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub promises_created: u64,
    pub promises_settled: u64,
    pub tasks_scheduled: u64,
    pub tasks_run: u64,
    pub timers_fired: u64,
    pub notifications_delivered: u64,
    pub timings_collected: u64,
    pub rejections_escalated: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineState {
    queue: RefCell<VecDeque<Task>>,
    timers: RefCell<TimerWheel>,
    clock: Cell<u64>,
    scheduler: RefCell<Option<Rc<dyn Scheduler>>>,
    error_rate: Cell<f64>,
    timing_enabled: Cell<bool>,
    sane_timings: Cell<bool>,
    trace_enabled: Cell<bool>,
    next_registration: Cell<u64>,
    collectors: RefCell<Vec<(u64, Rc<dyn Collector>)>>,
    rejection_handlers: RefCell<Vec<(u64, Rc<dyn Fn(&mut RejectionEvent)>)>>,
    uncaught: RefCell<Vec<UncaughtRejection>>,
    stats: RefCell<EngineStats>,
    rng: RefCell<StdRng>,
}

/// A handle to one promise engine. Clones share all state.
pub struct Engine {
    state: Rc<EngineState>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Engine {
            state: self.state.clone(),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            state: Rc::new(EngineState {
                queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerWheel::new()),
                clock: Cell::new(0),
                scheduler: RefCell::new(None),
                error_rate: Cell::new(0.0),
                timing_enabled: Cell::new(true),
                sane_timings: Cell::new(false),
                trace_enabled: Cell::new(false),
                next_registration: Cell::new(1),
                collectors: RefCell::new(Vec::new()),
                rejection_handlers: RefCell::new(Vec::new()),
                uncaught: RefCell::new(Vec::new()),
                stats: RefCell::new(EngineStats::default()),
                rng: RefCell::new(StdRng::from_entropy()),
            }),
        }
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.state.clock.get()
    }

    /// Defer a task. Routed to the installed scheduler if one is set,
    /// otherwise onto the engine's own FIFO queue.
    pub fn schedule(&self, task: Task) {
        self.state.stats.borrow_mut().tasks_scheduled += 1;
        let custom = self.state.scheduler.borrow().clone();
        match custom {
            Some(scheduler) => scheduler.schedule(task),
            None => self.state.queue.borrow_mut().push_back(task),
        }
    }

    /// Schedule a task `ms` virtual milliseconds from now. Returns a timer id
    /// usable with [`cancel_timer`](Engine::cancel_timer).
    pub fn schedule_timer(&self, ms: u64, task: Task) -> u64 {
        let fire_at = self.now() + ms;
        self.state.timers.borrow_mut().schedule(fire_at, task)
    }

    pub fn cancel_timer(&self, id: u64) -> bool {
        self.state.timers.borrow_mut().cancel(id)
    }

    /// Install a replacement scheduler. Takes effect for subsequently
    /// scheduled work only; tasks already queued stay where they are.
    pub fn set_scheduler(&self, scheduler: Rc<dyn Scheduler>) {
        *self.state.scheduler.borrow_mut() = Some(scheduler);
    }

    /// Drain the queue to completion, advancing the virtual clock to each
    /// timer deadline once the queue goes idle. Returns when no task or
    /// timer remains.
    pub fn run(&self) -> RunResult {
        let mut result = RunResult::default();
        loop {
            let task = self.state.queue.borrow_mut().pop_front();
            if let Some(task) = task {
                task();
                result.tasks_run += 1;
                continue;
            }
            let deadline = self.state.timers.borrow().next_deadline();
            match deadline {
                Some(at) => {
                    if at > self.state.clock.get() {
                        self.state.clock.set(at);
                        result.clock_advances += 1;
                    }
                    let due = self
                        .state
                        .timers
                        .borrow_mut()
                        .take_expired(self.state.clock.get());
                    result.timers_fired += due.len();
                    let mut queue = self.state.queue.borrow_mut();
                    for task in due {
                        queue.push_back(task);
                    }
                }
                None => break,
            }
        }
        result.final_time = self.state.clock.get();
        {
            let mut stats = self.state.stats.borrow_mut();
            stats.tasks_run += result.tasks_run as u64;
            stats.timers_fired += result.timers_fired as u64;
        }
        tracing::debug!(
            tasks_run = result.tasks_run,
            timers_fired = result.timers_fired,
            final_time = result.final_time,
            "engine run complete"
        );
        result
    }

    pub fn stats(&self) -> EngineStats {
        self.state.stats.borrow().clone()
    }

    // -----------------------------------------------------------------------
    // Construction helpers
    // -----------------------------------------------------------------------

    /// A promise together with its settlement handle.
    pub fn defer(&self) -> Deferred {
        let promise = Promise::pending(self);
        let settlement = promise.settlement();
        Deferred {
            promise,
            settlement,
        }
    }

    /// An already-resolved promise. Not subject to fault injection.
    pub fn resolve(&self, value: impl Into<Value>) -> Promise {
        let promise = Promise::pending(self);
        let value = value.into();
        if value.is_fault() {
            settle(self, &promise.inner, State::Rejected, value);
        } else {
            settle(self, &promise.inner, State::Resolved, value);
        }
        promise
    }

    /// An already-rejected promise. Not subject to fault injection.
    pub fn reject(&self, reason: impl Into<Value>) -> Promise {
        let promise = Promise::pending(self);
        settle(self, &promise.inner, State::Rejected, reason.into());
        promise
    }

    /// Lift anything a handler could resolve with into a promise. An
    /// existing promise is returned as-is.
    pub fn cast(&self, x: impl Into<Resolution>) -> Promise {
        match x.into() {
            Resolution::Nested(promise) => promise,
            other => {
                let promise = Promise::pending(self);
                // Non-nested resolutions cannot raise a cycle error.
                let _ = resolver::resolve(self, &promise.inner, other, None);
                promise
            }
        }
    }

    /// Alias for [`cast`](Engine::cast).
    pub fn when(&self, x: impl Into<Resolution>) -> Promise {
        self.cast(x)
    }

    /// Resolve with `value` after `ms` virtual milliseconds. An error value
    /// delays into a rejection.
    pub fn delay(&self, ms: u64, value: impl Into<Value>) -> Promise {
        let value = value.into();
        let engine = self.clone();
        Promise::new(self, move |settlement| {
            engine.schedule_timer(
                ms,
                Box::new(move || {
                    let _ = settlement.resolve(Resolution::Value(value));
                }),
            );
            Ok(())
        })
    }

    /// Invoke `f` asynchronously and resolve with its result.
    pub fn call<F>(&self, f: F) -> Promise
    where
        F: FnOnce() -> Resolution + 'static,
    {
        Promise::new(self, move |settlement| {
            settlement
                .resolve(f())
                .map_err(|_: EngineError| Fault::new("cycle would be created in promise chain"))
        })
    }

    /// Invoke `f` asynchronously with `args` and resolve with its result.
    pub fn apply<F>(&self, f: F, args: Vec<Value>) -> Promise
    where
        F: FnOnce(Vec<Value>) -> Resolution + 'static,
    {
        self.call(move || f(args))
    }

    /// Whether a resolution carries an asynchronous source (a promise or a
    /// foreign thenable) rather than a plain outcome.
    pub fn is_promise_like(x: &Resolution) -> bool {
        matches!(x, Resolution::Nested(_) | Resolution::Foreign(_))
    }

    // -----------------------------------------------------------------------
    // Combinators
    // -----------------------------------------------------------------------

    pub fn settle_all(&self, inputs: Vec<Resolution>) -> Promise {
        crate::combinator::settle_all(self, inputs)
    }

    pub fn race(&self, inputs: Vec<Resolution>) -> Promise {
        crate::combinator::race(self, inputs)
    }

    pub fn some(&self, inputs: Vec<Resolution>, count: usize) -> Promise {
        crate::combinator::some(self, inputs, count)
    }

    pub fn any(&self, inputs: Vec<Resolution>) -> Promise {
        crate::combinator::any(self, inputs)
    }

    pub fn all(&self, inputs: Vec<Resolution>) -> Promise {
        crate::combinator::all(self, inputs)
    }

    pub fn hash(&self, entries: Vec<(String, Resolution)>) -> Promise {
        crate::combinator::hash(self, entries)
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Set the random error rate for the primary constructor. Accepts either
    /// a 0..=1 fraction or a 0..=100 percentage (normalized); NaN is a usage
    /// error. Returns the effective fraction.
    pub fn set_random_error_rate(&self, rate: f64) -> crate::Result<f64> {
        if rate.is_nan() {
            return Err(EngineError::InvalidErrorRate);
        }
        let effective = if (0.0..=1.0).contains(&rate) {
            rate
        } else {
            rate.clamp(0.0, 100.0) / 100.0
        };
        self.state.error_rate.set(effective);
        Ok(effective)
    }

    pub fn random_error_rate(&self) -> f64 {
        self.state.error_rate.get()
    }

    /// Seed the fault-injection RNG, for reproducible resilience tests.
    pub fn seed_random(&self, seed: u64) {
        *self.state.rng.borrow_mut() = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn roll_random_fault(&self) -> bool {
        let rate = self.state.error_rate.get();
        rate > 0.0 && self.state.rng.borrow_mut().gen::<f64>() < rate
    }

    /// Enable or disable timing collection (enabled by default).
    pub fn set_timing_enabled(&self, enabled: bool) {
        self.state.timing_enabled.set(enabled);
    }

    pub(crate) fn timing_enabled(&self) -> bool {
        self.state.timing_enabled.get()
    }

    /// Normalize timing snapshots so each node spans its descendants.
    pub fn use_sane_timings(&self, enabled: bool) {
        self.state.sane_timings.set(enabled);
    }

    pub(crate) fn sane_timings(&self) -> bool {
        self.state.sane_timings.get()
    }

    /// Attach reconstructed causal traces to escalated rejections.
    pub fn set_trace_enabled(&self, enabled: bool) {
        self.state.trace_enabled.set(enabled);
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.state.trace_enabled.get()
    }

    // -----------------------------------------------------------------------
    // Registries
    // -----------------------------------------------------------------------

    /// Register a timing collector; returns an id for removal. Collectors are
    /// invoked synchronously, in registration order, each time a tracked tree
    /// reaches `done()`.
    pub fn add_collector(&self, collector: Rc<dyn Collector>) -> u64 {
        let id = self.next_registration_id();
        self.state.collectors.borrow_mut().push((id, collector));
        id
    }

    pub fn remove_collector(&self, id: u64) -> bool {
        let mut collectors = self.state.collectors.borrow_mut();
        let before = collectors.len();
        collectors.retain(|(existing, _)| *existing != id);
        collectors.len() != before
    }

    pub(crate) fn collectors(&self) -> Vec<Rc<dyn Collector>> {
        self.state
            .collectors
            .borrow()
            .iter()
            .map(|(_, collector)| collector.clone())
            .collect()
    }

    /// Register an unhandled-rejection handler; returns an id for removal.
    /// Handlers run in registration order until one marks the event handled.
    pub fn on_unhandled_rejection<F>(&self, handler: F) -> u64
    where
        F: Fn(&mut RejectionEvent) + 'static,
    {
        let id = self.next_registration_id();
        self.state
            .rejection_handlers
            .borrow_mut()
            .push((id, Rc::new(handler)));
        id
    }

    pub fn remove_unhandled_rejection(&self, id: u64) -> bool {
        let mut handlers = self.state.rejection_handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub(crate) fn rejection_handlers(&self) -> Vec<Rc<dyn Fn(&mut RejectionEvent)>> {
        self.state
            .rejection_handlers
            .borrow()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    /// Drain the rejections that escaped every handler. Escalation is
    /// asynchronous, so call this after [`run`](Engine::run).
    pub fn take_uncaught_rejections(&self) -> Vec<UncaughtRejection> {
        std::mem::take(&mut *self.state.uncaught.borrow_mut())
    }

    pub(crate) fn push_uncaught(&self, rejection: UncaughtRejection) {
        self.state.stats.borrow_mut().rejections_escalated += 1;
        self.state.uncaught.borrow_mut().push(rejection);
    }

    fn next_registration_id(&self) -> u64 {
        let id = self.state.next_registration.get();
        self.state.next_registration.set(id + 1);
        id
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    pub(crate) fn note_promise_created(&self) {
        self.state.stats.borrow_mut().promises_created += 1;
    }

    pub(crate) fn note_promise_settled(&self) {
        self.state.stats.borrow_mut().promises_settled += 1;
    }

    pub(crate) fn note_notification(&self) {
        self.state.stats.borrow_mut().notifications_delivered += 1;
    }

    pub(crate) fn note_timing_collected(&self) {
        self.state.stats.borrow_mut().timings_collected += 1;
    }
}
