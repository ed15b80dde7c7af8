//! The promise type and its settlement state machine.
//!
//! A [`Promise`] is a cheap handle (`Rc<RefCell<...>>`) over the shared inner
//! record. Settlement is irreversible: Pending → Resolved or Pending →
//! Rejected, exactly once, and the settled payload is immutable afterwards.
//! Continuations are queued FIFO per outcome and always dispatched through the
//! engine's scheduler, never inline; code that triggers a settlement can
//! never observe its own continuations running synchronously.
//!
//! The `parent`/`children` links form a causal tree used only for diagnostics
//! and timing. `parent` is a `Weak` back-reference so the tree never owns
//! anything upward.

pub mod chain;
pub mod resolver;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::engine::Engine;
use crate::value::{Fault, Value};

pub use resolver::{Resolution, Thenable};

/// Settlement state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Resolved,
    Rejected,
}

/// A queued continuation, invoked with the settled payload.
pub(crate) type Callback = Box<dyn FnOnce(Value)>;

/// A chaining handler: receives the settled payload, returns the resolution
/// of the derived promise. Returning [`Resolution::Failure`] is the engine's
/// equivalent of throwing from a handler body.
pub type Handler = Box<dyn FnOnce(Value) -> Resolution>;

pub(crate) type Inner = Rc<RefCell<PromiseInner>>;

pub(crate) struct PromiseInner {
    pub(crate) state: State,
    pub(crate) payload: Value,
    pub(crate) start: u64,
    pub(crate) stop: u64,
    pub(crate) duration: u64,
    on_resolve: Vec<Callback>,
    on_reject: Vec<Callback>,
    on_notify: Vec<Rc<dyn Fn(Value)>>,
    pub(crate) parent: Option<Weak<RefCell<PromiseInner>>>,
    pub(crate) children: Vec<Inner>,
    pub(crate) track_name: Option<String>,
    pub(crate) passive: bool,
}

/// An asynchronous value: pending until resolved or rejected, exactly once.
pub struct Promise {
    pub(crate) engine: Engine,
    pub(crate) inner: Inner,
}

impl Clone for Promise {
    fn clone(&self) -> Self {
        Promise {
            engine: self.engine.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Promise")
            .field("state", &inner.state)
            .field("track_name", &inner.track_name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Settlement core
// ---------------------------------------------------------------------------

pub(crate) fn new_inner(engine: &Engine) -> Inner {
    engine.note_promise_created();
    Rc::new(RefCell::new(PromiseInner {
        state: State::Pending,
        payload: Value::Undefined,
        start: engine.now(),
        stop: 0,
        duration: 0,
        on_resolve: Vec::new(),
        on_reject: Vec::new(),
        on_notify: Vec::new(),
        parent: None,
        children: Vec::new(),
        track_name: None,
        passive: false,
    }))
}

/// Settle a promise: effective only while Pending. Captures the payload and
/// the stop timestamp, then drains the matching continuation queue through
/// the scheduler. The opposite queue is discarded so captured handles are
/// released.
pub(crate) fn settle(engine: &Engine, inner: &Inner, state: State, payload: Value) {
    let callbacks = {
        let mut p = inner.borrow_mut();
        if p.state != State::Pending {
            return;
        }
        p.state = state;
        p.payload = payload.clone();
        p.stop = engine.now();
        p.duration = p.stop.saturating_sub(p.start);
        let callbacks = match state {
            State::Resolved => std::mem::take(&mut p.on_resolve),
            State::Rejected => std::mem::take(&mut p.on_reject),
            State::Pending => unreachable!("settle target state must be terminal"),
        };
        p.on_resolve.clear();
        p.on_reject.clear();
        p.on_notify.clear();
        callbacks
    };
    tracing::trace!(?state, queued = callbacks.len(), "promise settled");
    engine.note_promise_settled();
    for callback in callbacks {
        let payload = payload.clone();
        engine.schedule(Box::new(move || callback(payload)));
    }
}

/// Register a continuation for one settlement outcome. While Pending it is
/// queued; if the promise already settled that way it is dispatched with the
/// settled payload, still asynchronously; if it settled the other way it is
/// dropped.
pub(crate) fn enqueue(engine: &Engine, inner: &Inner, wants: State, callback: Callback) {
    let state = inner.borrow().state;
    match state {
        State::Pending => {
            let mut p = inner.borrow_mut();
            match wants {
                State::Resolved => p.on_resolve.push(callback),
                State::Rejected => p.on_reject.push(callback),
                State::Pending => unreachable!("continuations wait for a terminal state"),
            }
        }
        settled if settled == wants => {
            let payload = inner.borrow().payload.clone();
            engine.schedule(Box::new(move || callback(payload)));
        }
        _ => {}
    }
}

/// Deliver a progress notification to every subscriber, in subscription
/// order. A no-op once settled.
pub(crate) fn notify_all(engine: &Engine, inner: &Inner, data: Value) {
    if inner.borrow().state != State::Pending {
        return;
    }
    let listeners: Vec<Rc<dyn Fn(Value)>> = inner.borrow().on_notify.clone();
    for listener in listeners {
        engine.note_notification();
        listener(data.clone());
    }
}

// ---------------------------------------------------------------------------
// Settlement handle
// ---------------------------------------------------------------------------

/// The resolve/reject/notify capability handed to an initializer (and exposed
/// on a [`Deferred`]). Cloneable; all clones act on the same promise.
pub struct Settlement {
    engine: Engine,
    target: Inner,
}

impl Clone for Settlement {
    fn clone(&self) -> Self {
        Settlement {
            engine: self.engine.clone(),
            target: self.target.clone(),
        }
    }
}

impl Settlement {
    /// Resolve the promise. The value is run through the resolution
    /// algorithm, so a fault rejects, a nested promise is adopted, and a
    /// foreign thenable is subscribed to.
    ///
    /// Returns [`EngineError::CycleDetected`](crate::EngineError) if the
    /// resolution names a pending descendant of this promise.
    pub fn resolve(&self, value: impl Into<Resolution>) -> crate::Result<()> {
        resolver::resolve(&self.engine, &self.target, value.into(), None)
    }

    /// Reject the promise with a reason. Settles directly; the reason is
    /// never unwrapped or adopted.
    pub fn reject(&self, reason: impl Into<Value>) {
        settle(&self.engine, &self.target, State::Rejected, reason.into());
    }

    /// Deliver a progress update to notification subscribers. A no-op once
    /// the promise has settled.
    pub fn notify(&self, data: impl Into<Value>) {
        notify_all(&self.engine, &self.target, data.into());
    }
}

/// A promise paired with its settlement handle, for callers that settle from
/// outside an initializer.
pub struct Deferred {
    pub promise: Promise,
    pub settlement: Settlement,
}

// ---------------------------------------------------------------------------
// Promise surface
// ---------------------------------------------------------------------------

impl Promise {
    /// Create a promise and invoke `init` asynchronously with its settlement
    /// handle. An `Err` from the initializer rejects the promise.
    ///
    /// This is the primary constructor and the only place the configured
    /// random error rate applies: a sampled fault rejects the promise before
    /// the initializer runs.
    pub fn new<F>(engine: &Engine, init: F) -> Promise
    where
        F: FnOnce(Settlement) -> std::result::Result<(), Fault> + 'static,
    {
        let promise = Promise::pending(engine);
        let settlement = promise.settlement();
        let engine = engine.clone();
        let sampler = engine.clone();
        engine.schedule(Box::new(move || {
            if sampler.roll_random_fault() {
                settlement.reject(Value::Fault(Fault::new("random error!")));
            } else if let Err(fault) = init(settlement.clone()) {
                settlement.reject(Value::Fault(fault));
            }
        }));
        promise
    }

    /// A pending promise with no initializer. Internal construction path for
    /// derived promises and helpers; never subject to fault injection.
    pub(crate) fn pending(engine: &Engine) -> Promise {
        Promise {
            engine: engine.clone(),
            inner: new_inner(engine),
        }
    }

    pub(crate) fn settlement(&self) -> Settlement {
        Settlement {
            engine: self.engine.clone(),
            target: self.inner.clone(),
        }
    }

    /// Current settlement state.
    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    /// Whether the promise is resolved or rejected.
    pub fn is_settled(&self) -> bool {
        self.state() != State::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == State::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    /// The settled payload (or rejection reason). `Undefined` while pending.
    pub fn payload(&self) -> Value {
        self.inner.borrow().payload.clone()
    }

    /// Whether two handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register optional resolution and rejection handlers, returning the
    /// derived promise. `None` handlers propagate the parent's outcome
    /// unchanged.
    pub(crate) fn derive(
        &self,
        on_resolved: Option<Handler>,
        on_rejected: Option<Handler>,
    ) -> Promise {
        let child = Promise::pending(&self.engine);
        enqueue(
            &self.engine,
            &self.inner,
            State::Resolved,
            wrap_handler(child.clone(), on_resolved, State::Resolved),
        );
        enqueue(
            &self.engine,
            &self.inner,
            State::Rejected,
            wrap_handler(child.clone(), on_rejected, State::Rejected),
        );
        chain::link(&self.inner, &child.inner);
        child
    }

    /// Chain a handler over the resolved value.
    pub fn then<F>(&self, on_resolved: F) -> Promise
    where
        F: FnOnce(Value) -> Resolution + 'static,
    {
        self.derive(Some(Box::new(on_resolved)), None)
    }

    /// Chain handlers over both outcomes.
    pub fn then_else<S, E>(&self, on_resolved: S, on_rejected: E) -> Promise
    where
        S: FnOnce(Value) -> Resolution + 'static,
        E: FnOnce(Value) -> Resolution + 'static,
    {
        self.derive(Some(Box::new(on_resolved)), Some(Box::new(on_rejected)))
    }

    /// Chain a handler over the rejection reason. A handler that does not
    /// return a failure or nested rejection recovers the chain.
    pub fn catch<F>(&self, on_rejected: F) -> Promise
    where
        F: FnOnce(Value) -> Resolution + 'static,
    {
        self.derive(None, Some(Box::new(on_rejected)))
    }

    /// Alias for [`catch`](Promise::catch).
    pub fn otherwise<F>(&self, on_rejected: F) -> Promise
    where
        F: FnOnce(Value) -> Resolution + 'static,
    {
        self.catch(on_rejected)
    }

    /// Subscribe to progress notifications. Returns a pass-through derived
    /// promise so the subscription can sit inside a chain.
    pub fn notified<F>(&self, callback: F) -> Promise
    where
        F: Fn(Value) + 'static,
    {
        self.inner.borrow_mut().on_notify.push(Rc::new(callback));
        self.derive(None, None)
    }

    /// Observe the resolved value without affecting propagation.
    pub fn tap<F>(&self, callback: F) -> Promise
    where
        F: FnOnce(&Value) + 'static,
    {
        self.then(move |value| {
            callback(&value);
            Resolution::Value(value)
        })
    }

    /// Run a callback on either outcome. A returned nested promise or
    /// thenable is deferred to; any other return is ignored and the original
    /// value or rejection propagates.
    pub fn finally<F>(&self, callback: F) -> Promise
    where
        F: FnOnce(Value) -> Resolution + 'static,
    {
        let child = Promise::pending(&self.engine);
        let shared = Rc::new(RefCell::new(Some(callback)));
        let success = finally_branch(child.clone(), shared.clone(), State::Resolved);
        let failure = finally_branch(child.clone(), shared, State::Rejected);
        enqueue(&self.engine, &self.inner, State::Resolved, success);
        enqueue(&self.engine, &self.inner, State::Rejected, failure);
        chain::link(&self.inner, &child.inner);
        child
    }

    /// Destructure a list payload into the callback's argument vector. A
    /// non-list payload arrives as a one-element vector.
    pub fn spread<F>(&self, callback: F) -> Promise
    where
        F: FnOnce(Vec<Value>) -> Resolution + 'static,
    {
        self.then(move |value| match value {
            Value::List(items) => callback(items),
            other => callback(vec![other]),
        })
    }

    /// Reject this promise if it has not settled within `ms` virtual
    /// milliseconds. The timer is cleared on settlement. Does not cancel the
    /// underlying work, only stops waiting for it.
    pub fn timeout(&self, ms: u64, reason: Option<Value>) -> Promise {
        let reason = reason.unwrap_or_else(|| Value::Text("timed out".to_string()));
        let engine = self.engine.clone();
        let inner = self.inner.clone();
        let id = self.engine.schedule_timer(
            ms,
            Box::new(move || settle(&engine, &inner, State::Rejected, reason)),
        );
        let on_resolved = self.engine.clone();
        let on_rejected = self.engine.clone();
        enqueue(
            &self.engine,
            &self.inner,
            State::Resolved,
            Box::new(move |_| {
                on_resolved.cancel_timer(id);
            }),
        );
        enqueue(
            &self.engine,
            &self.inner,
            State::Rejected,
            Box::new(move |_| {
                on_rejected.cancel_timer(id);
            }),
        );
        self.clone()
    }

    /// Tag this promise for timing diagnostics. Passive tags only publish if
    /// the surrounding tree contains at least one active tag.
    pub fn track_as(&self, name: impl Into<String>, passive: bool) -> Promise {
        {
            let mut inner = self.inner.borrow_mut();
            inner.track_name = Some(name.into());
            inner.passive = passive;
        }
        self.clone()
    }

    /// Terminal consumption: publishes the tracked timing tree to collectors
    /// and escalates a rejection through the unhandled-rejection chain.
    pub fn done(&self) {
        self.finish(None)
    }

    /// [`done`](Promise::done) with a settlement observer. The observer runs
    /// before timing persistence and escalation; its outcome never affects
    /// the chain.
    pub fn done_with<F>(&self, handler: F)
    where
        F: FnOnce(Value) + 'static,
    {
        self.finish(Some(Box::new(handler)))
    }

    fn finish(&self, handler: Option<Box<dyn FnOnce(Value)>>) {
        if let Some(observer) = handler {
            let shared = Rc::new(RefCell::new(Some(observer)));
            let on_failure = shared.clone();
            enqueue(
                &self.engine,
                &self.inner,
                State::Rejected,
                Box::new(move |value| {
                    if let Some(f) = on_failure.borrow_mut().take() {
                        f(value);
                    }
                }),
            );
            enqueue(
                &self.engine,
                &self.inner,
                State::Resolved,
                Box::new(move |value| {
                    if let Some(f) = shared.borrow_mut().take() {
                        f(value);
                    }
                }),
            );
        }
        for wants in [State::Resolved, State::Rejected] {
            let engine = self.engine.clone();
            let inner = self.inner.clone();
            enqueue(
                &self.engine,
                &self.inner,
                wants,
                Box::new(move |_| crate::timing::persist(&engine, &inner)),
            );
        }
        let promise = self.clone();
        enqueue(
            &self.engine,
            &self.inner,
            State::Rejected,
            Box::new(move |reason| crate::diagnostics::dispatch(&promise, reason)),
        );
    }
}

fn wrap_handler(child: Promise, handler: Option<Handler>, branch: State) -> Callback {
    Box::new(move |value: Value| match handler {
        Some(f) => {
            let input = value.clone();
            let outcome = f(value);
            if resolver::resolve(&child.engine, &child.inner, outcome, Some(input)).is_err() {
                settle(
                    &child.engine,
                    &child.inner,
                    State::Rejected,
                    Value::Fault(Fault::new("cycle would be created in promise chain")),
                );
            }
        }
        None => settle(&child.engine, &child.inner, branch, value),
    })
}

fn finally_branch<F>(child: Promise, shared: Rc<RefCell<Option<F>>>, branch: State) -> Callback
where
    F: FnOnce(Value) -> Resolution + 'static,
{
    Box::new(move |value: Value| {
        let outcome = shared.borrow_mut().take().map(|f| f(value.clone()));
        match outcome {
            Some(adopted @ (Resolution::Nested(_) | Resolution::Foreign(_))) => {
                if resolver::resolve(&child.engine, &child.inner, adopted, None).is_err() {
                    settle(
                        &child.engine,
                        &child.inner,
                        State::Rejected,
                        Value::Fault(Fault::new("cycle would be created in promise chain")),
                    );
                }
            }
            _ => settle(&child.engine, &child.inner, branch, value),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_settle_is_idempotent() {
        let engine = Engine::new();
        let deferred = engine.defer();
        deferred.settlement.resolve(Value::from(1)).unwrap();
        deferred.settlement.resolve(Value::from(2)).unwrap();
        deferred.settlement.reject(Value::from("late"));
        engine.run();
        assert!(deferred.promise.is_resolved());
        assert_eq!(deferred.promise.payload(), Value::Number(1.0));
    }

    #[test]
    fn test_continuations_never_run_synchronously() {
        let engine = Engine::new();
        let promise = engine.resolve(Value::from("x"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        promise.then(move |value| {
            log.borrow_mut().push(value);
            Resolution::None
        });
        // Nothing observed until the queue drains.
        assert!(seen.borrow().is_empty());
        engine.run();
        assert_eq!(*seen.borrow(), vec![Value::Text("x".to_string())]);
    }

    #[test]
    fn test_continuation_order_is_fifo() {
        let engine = Engine::new();
        let deferred = engine.defer();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = seen.clone();
            deferred.promise.then(move |_| {
                log.borrow_mut().push(i);
                Resolution::None
            });
        }
        deferred.settlement.resolve(Value::Undefined).unwrap();
        engine.run();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_then_without_handler_propagates() {
        let engine = Engine::new();
        let child = engine.resolve(Value::from(7)).derive(None, None);
        engine.run();
        assert_eq!(child.payload(), Value::Number(7.0));

        let child = engine.reject(Value::from("why")).derive(None, None);
        engine.run();
        assert!(child.is_rejected());
        assert_eq!(child.payload(), Value::Text("why".to_string()));
    }

    #[test]
    fn test_notify_only_while_pending_in_order() {
        let engine = Engine::new();
        let deferred = engine.defer();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        deferred.promise.notified(move |data| log.borrow_mut().push(data));
        deferred.settlement.notify(Value::from(30));
        deferred.settlement.notify(Value::from(60));
        deferred.settlement.resolve(Value::Undefined).unwrap();
        deferred.settlement.notify(Value::from(90));
        engine.run();
        assert_eq!(
            *seen.borrow(),
            vec![Value::Number(30.0), Value::Number(60.0)]
        );
    }

    #[test]
    fn test_late_registration_still_deferred() {
        let engine = Engine::new();
        let promise = engine.resolve(Value::from(5));
        engine.run();
        assert!(promise.is_resolved());
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        promise.then(move |value| {
            *slot.borrow_mut() = Some(value);
            Resolution::None
        });
        assert!(seen.borrow().is_none());
        engine.run();
        assert_eq!(*seen.borrow(), Some(Value::Number(5.0)));
    }

    #[test]
    fn test_tap_passes_original_value_through() {
        let engine = Engine::new();
        let tapped = Rc::new(RefCell::new(None));
        let slot = tapped.clone();
        let child = engine
            .resolve(Value::from("abc"))
            .tap(move |value| *slot.borrow_mut() = Some(value.clone()))
            .then(|value| Resolution::Value(value));
        engine.run();
        assert_eq!(*tapped.borrow(), Some(Value::Text("abc".to_string())));
        assert_eq!(child.payload(), Value::Text("abc".to_string()));
    }

    #[test]
    fn test_finally_runs_on_both_outcomes_and_propagates() {
        let engine = Engine::new();
        let ran = Rc::new(RefCell::new(0));

        let count = ran.clone();
        let ok = engine.resolve(Value::from(1)).finally(move |_| {
            *count.borrow_mut() += 1;
            Resolution::Value(Value::from("ignored"))
        });
        let count = ran.clone();
        let err = engine.reject(Value::from("bad")).finally(move |_| {
            *count.borrow_mut() += 1;
            Resolution::Value(Value::from("ignored"))
        });
        engine.run();
        assert_eq!(*ran.borrow(), 2);
        assert_eq!(ok.payload(), Value::Number(1.0));
        assert!(err.is_rejected());
        assert_eq!(err.payload(), Value::Text("bad".to_string()));
    }

    #[test]
    fn test_finally_defers_to_returned_promise() {
        let engine = Engine::new();
        let replacement = engine.resolve(Value::from(99));
        let child = engine
            .resolve(Value::from(1))
            .finally(move |_| Resolution::Nested(replacement));
        engine.run();
        assert_eq!(child.payload(), Value::Number(99.0));
    }

    #[test]
    fn test_spread_destructures_list() {
        let engine = Engine::new();
        let child = engine
            .resolve(Value::List(vec![Value::from(1), Value::from(2)]))
            .spread(|args| {
                assert_eq!(args.len(), 2);
                Resolution::Value(Value::from("done"))
            });
        engine.run();
        assert_eq!(child.payload(), Value::Text("done".to_string()));
    }

    #[test]
    fn test_timeout_rejects_slow_promise() {
        let engine = Engine::new();
        let slow = engine.delay(100, Value::from("never"));
        slow.timeout(50, None);
        engine.run();
        assert!(slow.is_rejected());
        assert_eq!(slow.payload(), Value::Text("timed out".to_string()));
    }

    #[test]
    fn test_timeout_cleared_when_promise_settles_first() {
        let engine = Engine::new();
        let fast = engine.delay(10, Value::from("v"));
        fast.timeout(50, Some(Value::from("too slow")));
        engine.run();
        assert!(fast.is_resolved());
        assert_eq!(fast.payload(), Value::Text("v".to_string()));
    }

    #[test]
    fn test_done_with_observer_sees_payload() {
        let engine = Engine::new();
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        engine
            .resolve(Value::from(4))
            .done_with(move |value| *slot.borrow_mut() = Some(value));
        engine.run();
        assert_eq!(*seen.borrow(), Some(Value::Number(4.0)));
    }
}
