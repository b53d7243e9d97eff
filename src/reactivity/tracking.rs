// ============================================================================
// spark-reactive - Dependency Tracking
// Tracking reads, propagating writes, and swapping execution context
// ============================================================================
//
// A reaction's dependencies are rebuilt on every execution: before running,
// it leaves every subscriber set it joined last time (unsubscribe_all), then
// each read during the run joins that source's set again (track_read). A
// branch that stops being read therefore stops being a dependency.
//
// Borrow discipline: subscriber sets are snapshotted into an owned Vec before
// notifying, because a notified reaction may subscribe or unsubscribe while
// the walk is in progress ("collect-then-mutate").
// ============================================================================

use std::rc::{Rc, Weak};

use crate::core::context::with_context;
use crate::core::types::{AnyReaction, AnySource};
use crate::primitives::scope::{get_current_scope, set_current_scope, Scope};

// =============================================================================
// TRACK READ - Register dependency when reading a source
// =============================================================================

/// Subscribe the active reaction (if any) to `source`.
///
/// Scope-aware: when the active reaction was declared in a scope and the read
/// happens while a scope outside that subtree is current, the read is not
/// tracked. Subscription is idempotent per (source, reaction) pair.
pub fn track_read(source: Rc<dyn AnySource>) {
    let active = with_context(|ctx| {
        if ctx.is_untracking() {
            return None;
        }
        let reaction = ctx.get_active_reaction()?.upgrade()?;
        Some((reaction, ctx.get_active_reaction_scope()))
    });

    let Some((reaction, reaction_scope)) = active else {
        return;
    };

    if reaction.is_disposed() {
        return;
    }

    if let (Some(owner), Some(current)) = (reaction_scope, get_current_scope()) {
        if !current.is_within(&owner) {
            tracing::trace!(
                source = source.node_id().0,
                reaction = reaction.node_id().0,
                "read outside the reaction's scope is not tracked"
            );
            return;
        }
    }

    if source
        .subscribers()
        .insert(reaction.node_id(), Rc::downgrade(&reaction))
    {
        reaction.add_dep(source);
    }
}

// =============================================================================
// NOTIFY WRITE - Called when a source's value changes
// =============================================================================

/// Notify every live subscriber of `source` that it changed.
///
/// Computed invalidators react synchronously; effects queue themselves.
pub fn notify_write(source: &dyn AnySource) {
    for reaction in source.subscribers().snapshot() {
        if !reaction.is_disposed() {
            reaction.notify();
        }
    }
}

// =============================================================================
// UNSUBSCRIBE - Leave every subscriber set joined during the last run
// =============================================================================

/// Remove `reaction` from all sources it is subscribed to.
pub fn unsubscribe_all(reaction: &dyn AnyReaction) {
    let id = reaction.node_id();
    for dep in reaction.take_deps() {
        dep.subscribers().remove(id);
    }
}

// =============================================================================
// EXECUTION GUARD - save/restore the ambient execution context
// =============================================================================

/// Installs a reaction as the active one and restores the previous context on
/// drop (including on panic).
pub(crate) struct ExecutionGuard {
    prev_reaction: Option<Weak<dyn AnyReaction>>,
    prev_reaction_scope: Option<Scope>,
    prev_current_scope: Option<Option<Scope>>,
    prev_untracking: bool,
}

impl ExecutionGuard {
    /// Context for an effect run: the effect's scope also becomes current.
    pub(crate) fn for_effect(reaction: Weak<dyn AnyReaction>, owner: Option<Scope>) -> Self {
        let prev_current_scope = Some(set_current_scope(owner.clone()));
        let (prev_reaction, prev_reaction_scope, prev_untracking) = with_context(|ctx| {
            (
                ctx.set_active_reaction(Some(reaction)),
                ctx.set_active_reaction_scope(owner),
                ctx.set_untracking(false),
            )
        });
        Self {
            prev_reaction,
            prev_reaction_scope,
            prev_current_scope,
            prev_untracking,
        }
    }

    /// Context for a computed evaluation: current scope is left untouched.
    pub(crate) fn for_computed(reaction: Weak<dyn AnyReaction>) -> Self {
        let (prev_reaction, prev_reaction_scope, prev_untracking) = with_context(|ctx| {
            (
                ctx.set_active_reaction(Some(reaction)),
                ctx.set_active_reaction_scope(None),
                ctx.set_untracking(false),
            )
        });
        Self {
            prev_reaction,
            prev_reaction_scope,
            prev_current_scope: None,
            prev_untracking,
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let prev_reaction = self.prev_reaction.take();
        let prev_scope = self.prev_reaction_scope.take();
        let prev_untracking = self.prev_untracking;
        with_context(|ctx| {
            ctx.set_active_reaction(prev_reaction);
            ctx.set_active_reaction_scope(prev_scope);
            ctx.set_untracking(prev_untracking);
        });
        if let Some(scope) = self.prev_current_scope.take() {
            set_current_scope(scope);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
