//! The resolution algorithm.
//!
//! Everything a handler can hand back, whether a plain value, an error value, a
//! nested promise, a foreign thenable or nothing at all, funnels through
//! [`resolve`] and becomes exactly one settle action on the target promise.
//! Precedence, from highest to lowest:
//!
//! 1. the target itself → reject with a self-reference type error
//! 2. a nested promise → adopt its outcome (hard cycle check first)
//! 3. no value → fall back to the handler's input, unless that input was an
//!    error value
//! 4. an error value → reject with it
//! 5. a foreign thenable → subscribe once, first signal wins
//! 6. anything else → resolve with it

use std::cell::Cell;
use std::rc::Rc;

use super::{chain, settle, Inner, Promise, State};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::value::{Fault, Value};

/// What a handler resolved with. The closed-union counterpart of "any value"
/// in a dynamically typed promise library.
pub enum Resolution {
    /// No value. Falls back to the handler's input value, except when that
    /// input was an error value.
    None,
    /// A concrete payload. An embedded [`Value::Fault`] rejects.
    Value(Value),
    /// An explicit failure; the handler-body equivalent of throwing.
    Failure(Value),
    /// Another promise whose outcome the target adopts.
    Nested(Promise),
    /// A foreign asynchronous source the target subscribes to.
    Foreign(Rc<dyn Thenable>),
}

impl From<Value> for Resolution {
    fn from(value: Value) -> Self {
        Resolution::Value(value)
    }
}

impl From<Fault> for Resolution {
    fn from(fault: Fault) -> Self {
        Resolution::Value(Value::Fault(fault))
    }
}

impl From<Promise> for Resolution {
    fn from(promise: Promise) -> Self {
        Resolution::Nested(promise)
    }
}

impl From<Rc<dyn Thenable>> for Resolution {
    fn from(thenable: Rc<dyn Thenable>) -> Self {
        Resolution::Foreign(thenable)
    }
}

/// An asynchronous source from outside the engine.
///
/// [`subscribe`](Thenable::subscribe) is invoked exactly once per adoption.
/// The implementation may call either callback at most once; whichever fires
/// first decides the outcome, and the loser is ignored.
pub trait Thenable {
    fn subscribe(
        &self,
        on_resolved: Box<dyn FnOnce(Resolution)>,
        on_rejected: Box<dyn FnOnce(Value)>,
    );
}

/// Resolve `target` with `x`, settling it (now or eventually) exactly once.
///
/// `original` is the input value of the handler that produced `x`, used for
/// the absent-value fallback.
///
/// The only `Err` is [`EngineError::CycleDetected`], raised when `x` is a
/// promise that `target` is already an ancestor of. Callers inside handler
/// wrappers convert that into a rejection of the child; callers at the API
/// boundary surface it synchronously.
pub(crate) fn resolve(
    engine: &Engine,
    target: &Inner,
    x: Resolution,
    original: Option<Value>,
) -> crate::Result<()> {
    match x {
        Resolution::Nested(nested) if Rc::ptr_eq(&nested.inner, target) => {
            settle(
                engine,
                target,
                State::Rejected,
                Value::Fault(Fault::type_error("cannot resolve a promise with itself")),
            );
            Ok(())
        }
        Resolution::Nested(nested) => {
            if chain::in_parents(target, &nested.inner) {
                return Err(EngineError::CycleDetected);
            }
            adopt(engine, target, &nested);
            chain::link(target, &nested.inner);
            Ok(())
        }
        Resolution::None => {
            let fallback = match original {
                Some(input) if !input.is_fault() => input,
                _ => Value::Undefined,
            };
            settle(engine, target, State::Resolved, fallback);
            Ok(())
        }
        Resolution::Value(value) if value.is_fault() => {
            settle(engine, target, State::Rejected, value);
            Ok(())
        }
        Resolution::Failure(reason) => {
            settle(engine, target, State::Rejected, reason);
            Ok(())
        }
        Resolution::Foreign(thenable) => {
            subscribe_foreign(engine, target, thenable.as_ref());
            Ok(())
        }
        Resolution::Value(value) => {
            settle(engine, target, State::Resolved, value);
            Ok(())
        }
    }
}

/// Adopt the outcome of a nested promise. A pending promise gets the target's
/// settle actions as continuations; a settled one re-enters the algorithm
/// with its payload (so a resolved-with-fault round trip still rejects).
fn adopt(engine: &Engine, target: &Inner, nested: &Promise) {
    let state = nested.inner.borrow().state;
    match state {
        State::Pending => {
            let resolve_engine = engine.clone();
            let resolve_target = target.clone();
            super::enqueue(
                engine,
                &nested.inner,
                State::Resolved,
                Box::new(move |value| {
                    // A settled payload is never a promise, so this
                    // re-entry cannot produce a cycle error.
                    let _ = resolve(
                        &resolve_engine,
                        &resolve_target,
                        Resolution::Value(value),
                        None,
                    );
                }),
            );
            let reject_engine = engine.clone();
            let reject_target = target.clone();
            super::enqueue(
                engine,
                &nested.inner,
                State::Rejected,
                Box::new(move |reason| {
                    settle(&reject_engine, &reject_target, State::Rejected, reason);
                }),
            );
        }
        State::Rejected => {
            settle(engine, target, State::Rejected, nested.payload());
        }
        State::Resolved => {
            let _ = resolve(
                engine,
                target,
                Resolution::Value(nested.payload()),
                None,
            );
        }
    }
}

/// Subscribe the target to a foreign thenable. The first callback to fire
/// wins; both share a single once-guard.
fn subscribe_foreign(engine: &Engine, target: &Inner, thenable: &dyn Thenable) {
    let called = Rc::new(Cell::new(false));

    let guard = called.clone();
    let resolve_engine = engine.clone();
    let resolve_target = target.clone();
    let on_resolved = Box::new(move |y: Resolution| {
        if guard.replace(true) {
            return;
        }
        if resolve(&resolve_engine, &resolve_target, y, None).is_err() {
            settle(
                &resolve_engine,
                &resolve_target,
                State::Rejected,
                Value::Fault(Fault::new("cycle would be created in promise chain")),
            );
        }
    });

    let reject_engine = engine.clone();
    let reject_target = target.clone();
    let on_rejected = Box::new(move |reason: Value| {
        if called.replace(true) {
            return;
        }
        settle(&reject_engine, &reject_target, State::Rejected, reason);
    });

    thenable.subscribe(on_resolved, on_rejected);
}
