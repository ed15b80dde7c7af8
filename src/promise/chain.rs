//! Causal tree maintenance.
//!
//! Derived-from edges connect promises into a tree used by timing and trace
//! diagnostics. The edges never affect settlement; they are bookkeeping only,
//! so a link that would create a cycle is skipped silently here. The hard
//! check that surfaces an error lives in the resolver, which calls
//! [`in_parents`] directly.

use std::rc::{Rc, Weak};

use super::Inner;

fn parent_of(node: &Inner) -> Option<Inner> {
    node.borrow().parent.as_ref().and_then(Weak::upgrade)
}

/// Whether `needle` appears anywhere in `node`'s descendant tree.
pub(crate) fn in_children(needle: &Inner, node: &Inner) -> bool {
    node.borrow()
        .children
        .iter()
        .any(|child| Rc::ptr_eq(child, needle) || in_children(needle, child))
}

/// Whether `needle` appears anywhere on `node`'s ancestor path.
pub(crate) fn in_parents(needle: &Inner, node: &Inner) -> bool {
    match parent_of(node) {
        Some(parent) => Rc::ptr_eq(&parent, needle) || in_parents(needle, &parent),
        None => false,
    }
}

/// Symmetric check run before linking `child`'s root under `parent`.
fn would_cycle(parent: &Inner, root: &Inner) -> bool {
    Rc::ptr_eq(parent, root) || in_parents(parent, root) || in_children(parent, root)
}

/// Record a derived-from edge from `parent` to `child`.
///
/// Walks `child` up to its causal root and reparents the whole chain as a
/// unit. A no-op when `parent` is already on that ancestor path, and a
/// silent skip when the edge would make any node its own ancestor.
pub(crate) fn link(parent: &Inner, child: &Inner) {
    let mut root = child.clone();
    loop {
        match parent_of(&root) {
            Some(ancestor) if Rc::ptr_eq(&ancestor, parent) => return,
            Some(ancestor) => root = ancestor,
            None => break,
        }
    }
    if would_cycle(parent, &root) {
        tracing::trace!("chain link skipped, edge would create a cycle");
        return;
    }
    root.borrow_mut().parent = Some(Rc::downgrade(parent));
    parent.borrow_mut().children.push(root);
}
