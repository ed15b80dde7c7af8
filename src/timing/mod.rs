//! Timing capture over the causal tree.
//!
//! `track_as` tags promises with names; when a tagged tree reaches `done()`,
//! a snapshot of the whole tree (names, payloads, start/stop/duration) is
//! published to every registered [`Collector`]. Passive tags alone never
//! publish: the tree must contain at least one active tag, so library code
//! can tag its internals without spamming collectors unless an application
//! promise opted in.

use serde::Serialize;

use crate::engine::Engine;
use crate::promise::{Inner, State};
use crate::value::Value;

/// One node of a published timing tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSnapshot {
    pub name: String,
    pub payload: Value,
    pub start: u64,
    pub stop: u64,
    pub duration: u64,
    pub children: Vec<TimingSnapshot>,
}

/// A sink for published timing trees.
pub trait Collector {
    fn collect(&self, timing: &TimingSnapshot);
}

/// A collector that keeps every published tree in memory.
#[derive(Default)]
pub struct MemoryCollector {
    collected: std::cell::RefCell<Vec<TimingSnapshot>>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<TimingSnapshot> {
        std::mem::take(&mut *self.collected.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.collected.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.borrow().is_empty()
    }
}

impl Collector for MemoryCollector {
    fn collect(&self, timing: &TimingSnapshot) {
        self.collected.borrow_mut().push(timing.clone());
    }
}

// ---------------------------------------------------------------------------
// Tree construction
// ---------------------------------------------------------------------------

pub(crate) fn causal_root(inner: &Inner) -> Inner {
    let mut node = inner.clone();
    loop {
        let parent = node
            .borrow()
            .parent
            .as_ref()
            .and_then(std::rc::Weak::upgrade);
        match parent {
            Some(p) => node = p,
            None => return node,
        }
    }
}

/// Whether the tree under `node` holds at least one active (non-passive) tag.
fn any_active_tracks(node: &Inner) -> bool {
    {
        let n = node.borrow();
        if n.track_name.is_some() && !n.passive {
            return true;
        }
    }
    let children = node.borrow().children.clone();
    children.iter().any(any_active_tracks)
}

/// Build the snapshot for `node` over its settled children only.
fn build(node: &Inner) -> TimingSnapshot {
    let (name, payload, start, stop, duration) = {
        let n = node.borrow();
        (
            n.track_name.clone().unwrap_or_else(|| "anonymous".to_string()),
            n.payload.clone(),
            n.start,
            n.stop,
            n.duration,
        )
    };
    let children = node
        .borrow()
        .children
        .iter()
        .filter(|child| child.borrow().state != State::Pending)
        .map(build)
        .collect();
    TimingSnapshot {
        name,
        payload,
        start,
        stop,
        duration,
        children,
    }
}

/// Rewrite each node to span its descendants: start becomes the minimum and
/// stop the maximum over the subtree, with duration recomputed. Trades
/// timestamp fidelity for a coherent nesting property.
fn normalize(snapshot: &mut TimingSnapshot) {
    for child in &mut snapshot.children {
        normalize(child);
        snapshot.start = snapshot.start.min(child.start);
        snapshot.stop = snapshot.stop.max(child.stop);
    }
    snapshot.duration = snapshot.stop.saturating_sub(snapshot.start);
}

/// Publish the timing tree containing `inner`, if its causal root has
/// settled and the tree carries an active tag.
pub(crate) fn persist(engine: &Engine, inner: &Inner) {
    if !engine.timing_enabled() {
        return;
    }
    let root = causal_root(inner);
    if root.borrow().state == State::Pending {
        return;
    }
    if !any_active_tracks(&root) {
        return;
    }
    let mut snapshot = build(&root);
    if engine.sane_timings() {
        normalize(&mut snapshot);
    }
    engine.note_timing_collected();
    tracing::debug!(root = %snapshot.name, "publishing timing tree");
    for collector in engine.collectors() {
        collector.collect(&snapshot);
    }
}
