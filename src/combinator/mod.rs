//! Combinators over collections of promises.
//!
//! Every combinator lifts its inputs into promises, creates one collective
//! promise through the primary constructor (so the configured random error
//! rate applies to it like any other constructed promise), and records each
//! input as a child of the collective promise for timing and traces.
//!
//! Progress is reported through notifications as whole percentages, rounded
//! up, so a listener registered on the collective promise can watch the
//! inputs settle.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::engine::Engine;
use crate::promise::{chain, Promise, Resolution, Settlement, State};
use crate::value::{Fault, Value};

fn percent(done: usize, total: usize) -> u64 {
    debug_assert!(total > 0);
    (done as f64 / total as f64 * 100.0).ceil() as u64
}

/// Lift inputs into promises, build the collective promise, and hand the
/// bookkeeping closure its settlement handle once the initializer runs.
fn collective<F>(engine: &Engine, inputs: Vec<Resolution>, subscribe: F) -> Promise
where
    F: FnOnce(Settlement, Vec<Promise>) + 'static,
{
    let members: Vec<Promise> = inputs.into_iter().map(|x| engine.cast(x)).collect();
    let children = members.clone();
    let parent = Promise::new(engine, move |settlement| {
        subscribe(settlement, members);
        Ok(())
    });
    for member in &children {
        chain::link(&parent.inner, &member.inner);
    }
    parent
}

fn subscribe_member<F>(engine: &Engine, member: &Promise, wants: State, callback: F)
where
    F: FnOnce(Value) + 'static,
{
    crate::promise::enqueue(engine, &member.inner, wants, Box::new(callback));
}

// ---------------------------------------------------------------------------
// settle-all
// ---------------------------------------------------------------------------

/// Resolve once every input has settled, regardless of outcome.
///
/// The payload is a list of settlement records in input order, each a map of
/// `status` (`"resolved"` or `"rejected"`) and `value` or `reason`. Never
/// rejects because a member rejected. Zero inputs resolve immediately to an
/// empty list.
pub fn settle_all(engine: &Engine, inputs: Vec<Resolution>) -> Promise {
    let engine = engine.clone();
    let subscriber = engine.clone();
    collective(&engine, inputs, move |settlement, members| {
        let total = members.len();
        if total == 0 {
            let _ = settlement.resolve(Value::List(Vec::new()));
            return;
        }
        settlement.notify(Value::from(0));
        let slots: Rc<RefCell<Vec<Option<Value>>>> = Rc::new(RefCell::new(vec![None; total]));
        let settled = Rc::new(RefCell::new(0usize));
        for (index, member) in members.iter().enumerate() {
            for wants in [State::Resolved, State::Rejected] {
                let slots = slots.clone();
                let settled = settled.clone();
                let settlement = settlement.clone();
                subscribe_member(&subscriber, member, wants, move |payload| {
                    slots.borrow_mut()[index] = Some(settle_record(wants, payload));
                    let done = {
                        let mut count = settled.borrow_mut();
                        *count += 1;
                        *count
                    };
                    settlement.notify(Value::from(percent(done, total)));
                    if done >= total {
                        let records = slots
                            .borrow_mut()
                            .iter_mut()
                            .map(|slot| slot.take().unwrap_or(Value::Undefined))
                            .collect();
                        let _ = settlement.resolve(Value::List(records));
                    }
                });
            }
        }
    })
}

fn settle_record(outcome: State, payload: Value) -> Value {
    let mut record = BTreeMap::new();
    match outcome {
        State::Resolved => {
            record.insert("status".to_string(), Value::from("resolved"));
            record.insert("value".to_string(), payload);
        }
        State::Rejected => {
            record.insert("status".to_string(), Value::from("rejected"));
            record.insert("reason".to_string(), payload);
        }
        State::Pending => unreachable!("settlement records only exist for settled members"),
    }
    Value::Map(record)
}

// ---------------------------------------------------------------------------
// race
// ---------------------------------------------------------------------------

/// Resolve with the first input to resolve.
///
/// Rejections do not end the race: a slow success still beats fast failures.
/// Rejects only once every input has rejected, or immediately when there are
/// no inputs at all.
pub fn race(engine: &Engine, inputs: Vec<Resolution>) -> Promise {
    let subscriber = engine.clone();
    collective(engine, inputs, move |settlement, members| {
        let total = members.len();
        if total == 0 {
            settlement.reject(Value::Fault(Fault::new("no promises to race")));
            return;
        }
        let rejected = Rc::new(RefCell::new(0usize));
        for member in &members {
            let winner = settlement.clone();
            subscribe_member(&subscriber, member, State::Resolved, move |value| {
                let _ = winner.resolve(value);
            });
            let rejected = rejected.clone();
            let loser = settlement.clone();
            subscribe_member(&subscriber, member, State::Rejected, move |_| {
                let mut count = rejected.borrow_mut();
                *count += 1;
                if *count >= total {
                    loser.reject(Value::Fault(Fault::new(
                        "every promise in the race was rejected",
                    )));
                }
            });
        }
    })
}

// ---------------------------------------------------------------------------
// bounded quorum
// ---------------------------------------------------------------------------

enum Slot {
    Waiting,
    Resolved(Value),
    Rejected,
}

struct Quorum {
    slots: Vec<Slot>,
    resolved: usize,
    rejected: usize,
    reasons: Vec<Value>,
}

/// Resolve once `count` inputs have resolved, with the resolved values in
/// input order (rejected and still-pending slots elided).
///
/// Rejects as soon as enough inputs have rejected that reaching `count`
/// successes is impossible, aggregating the rejection reasons into the fault
/// message. Progress notifications report settled-over-`count` percentages.
/// Fewer inputs than `count` reject immediately; `count` of zero resolves
/// immediately to an empty list.
pub fn some(engine: &Engine, inputs: Vec<Resolution>, count: usize) -> Promise {
    let subscriber = engine.clone();
    collective(engine, inputs, move |settlement, members| {
        let total = members.len();
        if total < count {
            settlement.reject(Value::Fault(Fault::new(
                "not enough promises to meet the desired count",
            )));
            return;
        }
        if count == 0 {
            let _ = settlement.resolve(Value::List(Vec::new()));
            return;
        }
        settlement.notify(Value::from(0));
        let quorum = Rc::new(RefCell::new(Quorum {
            slots: (0..total).map(|_| Slot::Waiting).collect(),
            resolved: 0,
            rejected: 0,
            reasons: Vec::new(),
        }));
        for (index, member) in members.iter().enumerate() {
            let state = quorum.clone();
            let on_success = settlement.clone();
            subscribe_member(&subscriber, member, State::Resolved, move |value| {
                let mut q = state.borrow_mut();
                q.slots[index] = Slot::Resolved(value);
                q.resolved += 1;
                if q.resolved >= count {
                    on_success.notify(Value::from(100));
                    let values = q
                        .slots
                        .iter_mut()
                        .filter_map(|slot| match std::mem::replace(slot, Slot::Waiting) {
                            Slot::Resolved(value) => Some(value),
                            _ => None,
                        })
                        .collect();
                    let _ = on_success.resolve(Value::List(values));
                } else {
                    on_success.notify(Value::from(percent(q.resolved + q.rejected, count)));
                }
            });

            let state = quorum.clone();
            let on_failure = settlement.clone();
            subscribe_member(&subscriber, member, State::Rejected, move |reason| {
                let mut q = state.borrow_mut();
                q.slots[index] = Slot::Rejected;
                q.rejected += 1;
                q.reasons.push(reason);
                if q.rejected > total - count {
                    on_failure.notify(Value::from(100));
                    on_failure.reject(Value::Fault(Fault::new(quorum_failure(
                        q.rejected, &q.reasons,
                    ))));
                } else {
                    on_failure.notify(Value::from(percent(q.resolved + q.rejected, count)));
                }
            });
        }
    })
}

fn quorum_failure(rejected: usize, reasons: &[Value]) -> String {
    let mut message = format!("{} promises failed; rejection reasons:", rejected);
    for reason in reasons {
        let rendered = match reason {
            Value::Undefined => String::new(),
            Value::Text(text) => text.clone(),
            other => other.to_string(),
        };
        message.push_str("\n - ");
        if rendered.is_empty() {
            message.push_str("(none given)");
        } else {
            message.push_str(&rendered);
        }
    }
    message
}

/// Resolve with the first resolved input (as a one-element list).
/// Equivalent to a quorum of one.
pub fn any(engine: &Engine, inputs: Vec<Resolution>) -> Promise {
    some(engine, inputs, 1)
}

/// Resolve once every input resolves; reject on the first rejection.
/// Equivalent to a quorum of all inputs.
pub fn all(engine: &Engine, inputs: Vec<Resolution>) -> Promise {
    let count = inputs.len();
    some(engine, inputs, count)
}

// ---------------------------------------------------------------------------
// key-wise join
// ---------------------------------------------------------------------------

/// Resolve once every entry's value has settled, with a map from the same
/// keys to each resolved value or rejection reason.
///
/// Member failures are captured as data; the join itself never rejects
/// because a member rejected. Emits the same percentage notifications as
/// [`settle_all`]. An empty input resolves immediately to an empty map.
pub fn hash(engine: &Engine, entries: Vec<(String, Resolution)>) -> Promise {
    let engine = engine.clone();
    let subscriber = engine.clone();
    let (keys, values): (Vec<String>, Vec<Resolution>) = entries.into_iter().unzip();
    collective(&engine, values, move |settlement, members| {
        let total = members.len();
        if total == 0 {
            let _ = settlement.resolve(Value::Map(BTreeMap::new()));
            return;
        }
        settlement.notify(Value::from(0));
        let result: Rc<RefCell<BTreeMap<String, Value>>> = Rc::new(RefCell::new(BTreeMap::new()));
        let settled = Rc::new(RefCell::new(0usize));
        for (index, member) in members.iter().enumerate() {
            for wants in [State::Resolved, State::Rejected] {
                let key = keys[index].clone();
                let result = result.clone();
                let settled = settled.clone();
                let settlement = settlement.clone();
                subscribe_member(&subscriber, member, wants, move |payload| {
                    result.borrow_mut().insert(key, payload);
                    let done = {
                        let mut count = settled.borrow_mut();
                        *count += 1;
                        *count
                    };
                    settlement.notify(Value::from(percent(done, total)));
                    if done >= total {
                        let map = std::mem::take(&mut *result.borrow_mut());
                        let _ = settlement.resolve(Value::Map(map));
                    }
                });
            }
        }
    })
}
