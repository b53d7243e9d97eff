// ============================================================================
// spark-reactive - Computed Values
// Lazy derived values that are invalidated synchronously
// ============================================================================
//
// A Computed is BOTH a Source (can be read, has subscribers) AND a Reaction
// (its invalidator: has deps, is notified when they change). Notification only
// flips the dirty flag and forwards the notification; the formula itself runs
// on the next read. That read-time recomputation is what keeps a computed
// consistent immediately after a write, without waiting for the scheduler.
//
// The formula runs with the computed as the active reaction, so the signals it
// reads become dependencies of the computed and never of whichever effect
// happened to trigger the read.
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::constants::*;
use crate::core::error::ReactiveError;
use crate::core::types::{AnyReaction, AnySource, NodeId, Subscribers};
use crate::primitives::scope::{get_current_scope, Scope};
use crate::primitives::signal::Writable;
use crate::reactivity::tracking::{track_read, unsubscribe_all, ExecutionGuard};

// =============================================================================
// COMPUTED INNER
// =============================================================================

/// The internal data for a computed value.
pub struct ComputedInner<T> {
    id: NodeId,

    /// Flags bitmask (COMPUTED | SYNC | status)
    flags: Cell<u32>,

    /// The formula
    func: Box<dyn Fn() -> T>,

    /// Cached value (None until the first read)
    value: RefCell<Option<T>>,

    /// Reactions that read this computed (Source side)
    subscribers: Subscribers,

    /// Subscriber sets the invalidator joined (Reaction side)
    deps: RefCell<Vec<Rc<dyn AnySource>>>,

    /// Number of formula evaluations
    evaluations: Cell<u64>,

    self_weak: Weak<ComputedInner<T>>,
}

impl<T: Clone + 'static> ComputedInner<T> {
    fn new(func: Box<dyn Fn() -> T>) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            id: NodeId::next(),
            flags: Cell::new(COMPUTED | SYNC | DIRTY),
            func,
            value: RefCell::new(None),
            subscribers: Subscribers::new(),
            deps: RefCell::new(Vec::new()),
            evaluations: Cell::new(0),
            self_weak: weak.clone(),
        })
    }

    /// Whether the next read will run the formula
    pub fn is_dirty(&self) -> bool {
        self.flags.get() & DIRTY != 0
    }

    /// Re-run the formula if dirty. A panic in the formula propagates to the
    /// reader and leaves the computed dirty.
    fn refresh(&self) {
        if !self.is_dirty() && self.value.borrow().is_some() {
            return;
        }

        unsubscribe_all(self);

        let reaction: Weak<dyn AnyReaction> = self.self_weak.clone();
        let value = {
            let _guard = ExecutionGuard::for_computed(reaction);
            (self.func)()
        };

        self.evaluations.set(self.evaluations.get() + 1);
        *self.value.borrow_mut() = Some(value);
        self.flags.set(self.flags.get() & !DIRTY);
    }

    fn dispose(&self) {
        self.flags.set(self.flags.get() | DISPOSED);
        unsubscribe_all(self);
        self.subscribers.clear();
    }
}

impl<T: Clone + 'static> AnySource for ComputedInner<T> {
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

impl<T: Clone + 'static> AnyReaction for ComputedInner<T> {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }

    fn add_dep(&self, source: Rc<dyn AnySource>) {
        self.deps.borrow_mut().push(source);
    }

    fn take_deps(&self) -> Vec<Rc<dyn AnySource>> {
        std::mem::take(&mut *self.deps.borrow_mut())
    }

    fn dep_count(&self) -> usize {
        self.deps.borrow().len()
    }

    fn owner_scope(&self) -> Option<Scope> {
        None
    }

    fn notify(&self) {
        if self.is_disposed() {
            return;
        }
        self.flags.set(self.flags.get() | DIRTY);
        tracing::trace!(computed = self.id.0, "invalidated");

        for reaction in self.subscribers.snapshot() {
            if !reaction.is_disposed() {
                reaction.notify();
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// COMPUTED<T> - The public handle
// =============================================================================

/// A read-only, lazily evaluated, cached derived value.
///
/// # Example
///
/// ```
/// use spark_reactive::{computed, signal};
///
/// let count = signal(2);
/// let doubled = computed({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10); // no flush needed
/// ```
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed from a formula. Nothing runs until the first read.
    ///
    /// Inside a scope, disposing the scope freezes the computed at its last
    /// value and drops its subscribers.
    pub fn new(func: impl Fn() -> T + 'static) -> Self {
        let inner = ComputedInner::new(Box::new(func));

        if let Some(scope) = get_current_scope() {
            let weak = Rc::downgrade(&inner);
            scope.on_cleanup(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.dispose();
                }
            });
        }

        Self { inner }
    }

    /// Read the value, tracking the read and recomputing if dirty.
    pub fn get(&self) -> T {
        track_read(self.as_any_source());
        self.peek()
    }

    /// Read the value without tracking (still recomputes if dirty).
    pub fn peek(&self) -> T {
        self.inner.refresh();
        match &*self.inner.value.borrow() {
            Some(value) => value.clone(),
            None => unreachable!("refresh always stores a value"),
        }
    }

    /// Access the value by reference, tracking the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        track_read(self.as_any_source());
        self.inner.refresh();
        match &*self.inner.value.borrow() {
            Some(value) => f(value),
            None => unreachable!("refresh always stores a value"),
        }
    }

    /// Whether the next read will re-run the formula
    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    /// How many times the formula has run
    pub fn evaluations(&self) -> u64 {
        self.inner.evaluations.get()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Number of sources the formula read last time
    pub fn dep_count(&self) -> usize {
        self.inner.dep_count()
    }

    /// Get as `Rc<dyn AnySource>` for graph bookkeeping.
    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }
}

impl<T: Clone + 'static> Writable<T> for Computed<T> {
    fn try_set(&self, _value: T) -> Result<bool, ReactiveError> {
        Err(ReactiveError::ReadOnly)
    }

    fn try_update(&self, _f: impl FnOnce(&mut T)) -> Result<bool, ReactiveError> {
        Err(ReactiveError::ReadOnly)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("value", &*self.inner.value.borrow())
            .field("dirty", &(self.inner.flags.get() & DIRTY != 0))
            .finish()
    }
}

/// Create a computed value.
pub fn computed<T, F>(func: F) -> Computed<T>
where
    T: Clone + 'static,
    F: Fn() -> T + 'static,
{
    Computed::new(func)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::effect::effect;
    use crate::primitives::scope::{create_scope, with_scope};
    use crate::primitives::signal::signal;
    use crate::reactivity::scheduling::flush_microtasks;

    #[test]
    fn computed_is_lazy() {
        let a = signal(1);
        let a2 = a.clone();
        let c = computed(move || a2.get() + 1);

        assert_eq!(c.evaluations(), 0);
        assert!(c.is_dirty());

        assert_eq!(c.get(), 2);
        assert_eq!(c.get(), 2);
        assert_eq!(c.evaluations(), 1, "cached until a dependency changes");
    }

    #[test]
    fn invalidation_does_not_recompute() {
        let a = signal(1);
        let a2 = a.clone();
        let c = computed(move || a2.get() * 10);
        assert_eq!(c.get(), 10);

        a.set(2);
        a.set(3);
        assert!(c.is_dirty());
        assert_eq!(c.evaluations(), 1);

        assert_eq!(c.get(), 30);
        assert_eq!(c.evaluations(), 2);
    }

    #[test]
    fn chained_computeds() {
        let a = signal(1);
        let b = computed({
            let a = a.clone();
            move || a.get() + 1
        });
        let c = computed({
            let b = b.clone();
            move || b.get() * 2
        });

        assert_eq!(c.get(), 4);
        a.set(4);
        assert!(b.is_dirty());
        assert!(c.is_dirty());
        assert_eq!(c.get(), 10);
    }

    #[test]
    fn effect_through_computed_reruns() {
        let a = signal(1);
        let c = computed({
            let a = a.clone();
            move || a.get() * 2
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let (c2, seen2) = (c.clone(), seen.clone());
        let _fx = effect(move || seen2.borrow_mut().push(c2.get()));

        a.set(5);
        assert_eq!(*seen.borrow(), vec![2], "effects wait for the microtask");
        flush_microtasks();
        assert_eq!(*seen.borrow(), vec![2, 10]);
    }

    #[test]
    fn writes_are_rejected() {
        let c = computed(|| 1);
        assert_eq!(c.try_set(2), Err(ReactiveError::ReadOnly));
        assert_eq!(c.try_update(|v| *v += 1), Err(ReactiveError::ReadOnly));
        assert_eq!(c.get(), 1);
    }

    #[test]
    fn panic_propagates_and_leaves_dirty() {
        let fail = signal(true);
        let f2 = fail.clone();
        let c = computed(move || {
            if f2.get() {
                panic!("formula failed");
            }
            7
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| c.get()));
        assert!(result.is_err());
        assert!(c.is_dirty());
        assert!(!crate::core::context::is_tracking());

        fail.set(false);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn scope_disposal_freezes_value() {
        let scope = create_scope();
        let a = signal(1);
        let c = with_scope(&scope, || {
            let a = a.clone();
            computed(move || a.get() * 3)
        });
        assert_eq!(c.get(), 3);

        scope.dispose();
        assert_eq!(a.subscriber_count(), 0);
        a.set(2);
        assert_eq!(c.get(), 3);
    }
}
