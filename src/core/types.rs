// ============================================================================
// spark-reactive - Type Definitions
// Type-erased traits and base types for the reactive graph
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::constants::*;
use super::context::with_context;
use crate::primitives::scope::Scope;

// =============================================================================
// NODE IDENTITY
// =============================================================================

/// Stable identity of a node in the reactive graph.
///
/// Used as the key of subscriber sets so that subscription is idempotent per
/// (source, reaction) pair and removal does not depend on pointer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Allocate the next id from the thread-local counter.
    pub fn next() -> Self {
        with_context(|ctx| ctx.next_node_id())
    }
}

// =============================================================================
// TYPE-ERASED TRAITS
// =============================================================================
//
// Graph bookkeeping never needs the value type T. Signals and computeds hold
// their values behind these traits so that an effect can keep a single
// Vec<Rc<dyn AnySource>> of the subscriber sets it belongs to, and a source can
// keep a set of Weak<dyn AnyReaction> to notify.
// =============================================================================

/// Something that can be read inside a reaction and notifies on change.
///
/// Implemented by `SourceInner<T>` (signals) and `ComputedInner<T>`.
pub trait AnySource: Any {
    /// Graph identity of this source
    fn node_id(&self) -> NodeId;

    /// The subscriber set of this source
    fn subscribers(&self) -> &Subscribers;

    /// Upcast to Any for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Number of live subscribers
    fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

/// Something that re-runs (or invalidates) when a source it read changes.
///
/// Implemented by `EffectInner` and `ComputedInner<T>` (its invalidator).
pub trait AnyReaction: Any {
    /// Graph identity of this reaction
    fn node_id(&self) -> NodeId;

    /// Get the flags bitmask
    fn flags(&self) -> u32;

    /// Set the flags bitmask
    fn set_flags(&self, flags: u32);

    /// Record that this reaction now belongs to `source`'s subscriber set
    fn add_dep(&self, source: Rc<dyn AnySource>);

    /// Remove and return every dependency recorded so far
    fn take_deps(&self) -> Vec<Rc<dyn AnySource>>;

    /// Number of recorded dependencies
    fn dep_count(&self) -> usize;

    /// Scope the reaction was declared in, used for scope-aware subscription
    fn owner_scope(&self) -> Option<Scope>;

    /// Called synchronously when one of the dependencies changed
    fn notify(&self);

    /// Upcast to Any for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Check if this reaction only invalidates (computed) rather than re-runs
    fn is_sync(&self) -> bool {
        self.flags() & SYNC != 0
    }

    /// Check if the reaction reached its terminal state
    fn is_disposed(&self) -> bool {
        self.flags() & DISPOSED != 0
    }

    /// Check if the reaction is waiting in a queue
    fn is_queued(&self) -> bool {
        self.flags() & QUEUED != 0
    }
}

// =============================================================================
// SUBSCRIBER SET
// =============================================================================

/// Insertion-ordered, idempotent set of reactions listening to a source.
///
/// Reactions are held weakly: a reaction that was dropped without being
/// disposed simply disappears the next time the set is walked.
#[derive(Default)]
pub struct Subscribers {
    entries: RefCell<IndexMap<NodeId, Weak<dyn AnyReaction>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reaction. Returns false if it was already subscribed.
    pub fn insert(&self, id: NodeId, reaction: Weak<dyn AnyReaction>) -> bool {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, reaction);
        true
    }

    /// Remove a reaction by id
    pub fn remove(&self, id: NodeId) {
        self.entries.borrow_mut().shift_remove(&id);
    }

    /// Check membership
    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.borrow().contains_key(&id)
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.entries
            .borrow()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Collect live subscribers in insertion order, pruning dead ones.
    ///
    /// Returns an owned Vec so callers can notify without holding the borrow
    /// (a notified reaction may subscribe or unsubscribe re-entrantly).
    pub fn snapshot(&self) -> Vec<Rc<dyn AnyReaction>> {
        let mut entries = self.entries.borrow_mut();
        entries.retain(|_, w| w.strong_count() > 0);
        entries.values().filter_map(Weak::upgrade).collect()
    }
}

// =============================================================================
// SOURCE INNER (the data behind Signal<T>)
// =============================================================================

/// Equality function type for comparing signal values
pub type EqualsFn<T> = fn(&T, &T) -> bool;

/// Default equality using PartialEq
pub fn default_equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// Equality that never matches, so every write notifies
pub fn never_equals<T>(_: &T, _: &T) -> bool {
    false
}

/// The internal data for a signal source.
///
/// This is separate from Signal<T> so we can implement AnySource on it
/// and store Rc<SourceInner<T>> as Rc<dyn AnySource>.
pub struct SourceInner<T> {
    id: NodeId,

    /// Number of accepted writes
    version: Cell<u64>,

    /// The current value
    value: RefCell<T>,

    /// Reactions that read this source during their latest execution
    subscribers: Subscribers,

    /// Equality function for comparing values
    equals: EqualsFn<T>,
}

impl<T> SourceInner<T> {
    /// Create a new source with the given value
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::new_with_equals(value, default_equals)
    }

    /// Create a new source with a custom equality function
    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self {
            id: NodeId::next(),
            version: Cell::new(0),
            value: RefCell::new(value),
            subscribers: Subscribers::new(),
            equals,
        }
    }

    /// Get the current value (cloning)
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.borrow().clone()
    }

    /// Get the current value with a closure (avoids clone)
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.borrow())
    }

    /// Set the value, returning true if it changed
    pub fn set(&self, value: T) -> bool {
        let changed = {
            let current = self.value.borrow();
            !(self.equals)(&current, &value)
        };

        if changed {
            *self.value.borrow_mut() = value;
            self.version.set(self.version.get() + 1);
        }

        changed
    }

    /// Compute the next value from the current one, returning true if it changed
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool
    where
        T: Clone,
    {
        let mut next = self.value.borrow().clone();
        f(&mut next);
        self.set(next)
    }

    /// Number of accepted writes so far
    pub fn version(&self) -> u64 {
        self.version.get()
    }
}

impl<T: 'static> AnySource for SourceInner<T> {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        id: NodeId,
    }

    impl AnyReaction for Probe {
        fn node_id(&self) -> NodeId {
            self.id
        }
        fn flags(&self) -> u32 {
            EFFECT
        }
        fn set_flags(&self, _flags: u32) {}
        fn add_dep(&self, _source: Rc<dyn AnySource>) {}
        fn take_deps(&self) -> Vec<Rc<dyn AnySource>> {
            Vec::new()
        }
        fn dep_count(&self) -> usize {
            0
        }
        fn owner_scope(&self) -> Option<Scope> {
            None
        }
        fn notify(&self) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn source_inner_set() {
        let source = SourceInner::new(1);
        assert_eq!(source.get(), 1);

        assert!(source.set(2));
        assert_eq!(source.get(), 2);
        assert_eq!(source.version(), 1);

        // Setting same value shouldn't change
        assert!(!source.set(2));
        assert_eq!(source.version(), 1);
    }

    #[test]
    fn source_inner_update_compares() {
        let source = SourceInner::new(vec![1, 2, 3]);
        assert!(!source.update(|v| v.sort()));
        assert!(source.update(|v| v.push(4)));
        assert_eq!(source.with(|v| v.len()), 4);
    }

    #[test]
    fn custom_equality_function() {
        let source = SourceInner::new_with_equals(42, never_equals);
        assert!(source.set(42));
    }

    #[test]
    fn subscribers_are_idempotent_and_weak() {
        let subs = Subscribers::new();
        let probe: Rc<dyn AnyReaction> = Rc::new(Probe { id: NodeId::next() });
        let id = probe.node_id();

        assert!(subs.insert(id, Rc::downgrade(&probe)));
        assert!(!subs.insert(id, Rc::downgrade(&probe)));
        assert_eq!(subs.len(), 1);
        assert_eq!(subs.snapshot().len(), 1);

        drop(probe);
        assert_eq!(subs.len(), 0);
        assert!(subs.snapshot().is_empty());
        assert!(!subs.contains(id));
    }

    #[test]
    fn heterogeneous_source_storage() {
        let sources: Vec<Rc<dyn AnySource>> = vec![
            Rc::new(SourceInner::new(42i32)),
            Rc::new(SourceInner::new(String::from("hello"))),
            Rc::new(SourceInner::new(true)),
        ];

        let mut ids: Vec<_> = sources.iter().map(|s| s.node_id()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        let inner = sources[0]
            .as_any()
            .downcast_ref::<SourceInner<i32>>()
            .expect("i32 source");
        assert_eq!(inner.get(), 42);
    }
}
