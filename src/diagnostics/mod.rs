//! Unhandled-rejection dispatch and causal traces.
//!
//! `done()` is the only gate to failure visibility: a rejected chain that
//! never reaches it produces no diagnostic at all. When it does, the
//! rejection is offered to the registered handlers in order; if none claims
//! it, an [`UncaughtRejection`] record is escalated asynchronously and can be
//! drained from the engine after a run.

use std::rc::Weak;

use crate::promise::{Inner, Promise, State};
use crate::value::Value;

/// The mutable record offered to each unhandled-rejection handler. Setting
/// `handled` stops the chain and suppresses escalation.
pub struct RejectionEvent {
    pub promise: Promise,
    pub reason: Value,
    pub handled: bool,
}

/// A rejection that escaped every handler.
#[derive(Debug, Clone, PartialEq)]
pub struct UncaughtRejection {
    pub message: String,
    pub reason: Value,
    /// Rendered causal trace, present when tracing is enabled on the engine.
    pub trace: Option<String>,
}

/// Route a rejection that reached `done()` through the handler chain,
/// escalating asynchronously if nobody claims it.
pub(crate) fn dispatch(promise: &Promise, reason: Value) {
    let engine = promise.engine.clone();
    let mut event = RejectionEvent {
        promise: promise.clone(),
        reason: reason.clone(),
        handled: false,
    };
    for handler in engine.rejection_handlers() {
        handler(&mut event);
        if event.handled {
            tracing::debug!("rejection claimed by handler");
            return;
        }
    }
    let trace = if engine.trace_enabled() {
        Some(render_trace(&promise.inner))
    } else {
        None
    };
    let uncaught = UncaughtRejection {
        message: format!("unhandled rejection: {}", reason),
        reason,
        trace,
    };
    let escalate = engine.clone();
    engine.schedule(Box::new(move || {
        tracing::error!(message = %uncaught.message, "unhandled promise rejection");
        escalate.push_uncaught(uncaught);
    }));
}

// ---------------------------------------------------------------------------
// Trace rendering
// ---------------------------------------------------------------------------

fn collect_rejected_by_depth(node: &Inner, depth: usize, levels: &mut Vec<Vec<Inner>>) {
    if levels.len() <= depth {
        levels.resize(depth + 1, Vec::new());
    }
    let children = node.borrow().children.clone();
    for child in &children {
        if child.borrow().state == State::Rejected {
            levels[depth].push(child.clone());
        }
    }
    for child in &children {
        collect_rejected_by_depth(child, depth + 1, levels);
    }
}

/// Render the chain of track names from the deepest rejected descendant up
/// to the causal root, one line per node, deepest last.
pub(crate) fn render_trace(promise: &Inner) -> String {
    let mut levels: Vec<Vec<Inner>> = Vec::new();
    collect_rejected_by_depth(promise, 0, &mut levels);

    let mut target: Option<Inner> = None;
    while let Some(level) = levels.pop() {
        if let Some(deepest) = level.into_iter().next() {
            target = Some(deepest);
            break;
        }
    }

    let mut node = target.unwrap_or_else(|| promise.clone());
    let mut labels = Vec::new();
    loop {
        let label = {
            let n = node.borrow();
            match &n.track_name {
                Some(name) if !n.passive => format!("trackAs: {}", name),
                Some(name) => format!("function: {}", name),
                None => "constructor: Promise".to_string(),
            }
        };
        labels.push(label);
        let parent = node.borrow().parent.as_ref().and_then(Weak::upgrade);
        match parent {
            Some(p) => node = p,
            None => break,
        }
    }
    labels.reverse();
    format!(" at {}", labels.join("\n at "))
}
