// ============================================================================
// spark-reactive - Signal Primitive
// The core writable reactive signal
// ============================================================================

use std::cell::Cell;
use std::rc::Rc;

use crate::core::error::ReactiveError;
use crate::core::types::{AnySource, EqualsFn, SourceInner};
use crate::primitives::effect::{effect, Effect};
use crate::primitives::scope::get_current_scope;
use crate::reactivity::batching::untrack;
use crate::reactivity::tracking::{notify_write, track_read};

// =============================================================================
// WRITABLE - shared write surface of signals and computeds
// =============================================================================

/// Fallible write access.
///
/// Signals always accept writes; computeds reject them with
/// [`ReactiveError::ReadOnly`]. Returns whether the value changed.
pub trait Writable<T> {
    fn try_set(&self, value: T) -> Result<bool, ReactiveError>;

    fn try_update(&self, f: impl FnOnce(&mut T)) -> Result<bool, ReactiveError>;
}

// =============================================================================
// SIGNAL<T> - The public signal handle
// =============================================================================

/// A reactive signal that holds a value of type T.
///
/// Reading inside an effect or computed subscribes the reader. Writing a value
/// that differs from the current one (per the equality function, `PartialEq`
/// by default) notifies every subscriber.
///
/// # Example
///
/// ```
/// use spark_reactive::signal;
///
/// let count = signal(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Signal<T> {
    inner: Rc<SourceInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Signal<T> {
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::from_inner(SourceInner::new(value))
    }

    /// Create a new signal with a custom equality function.
    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self::from_inner(SourceInner::new_with_equals(value, equals))
    }

    fn from_inner(inner: SourceInner<T>) -> Self {
        let inner = Rc::new(inner);

        // Disposal of the owning scope drops every subscription
        if let Some(scope) = get_current_scope() {
            let weak = Rc::downgrade(&inner);
            scope.on_cleanup(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers().clear();
                }
            });
        }

        Self { inner }
    }

    /// Get the current value (cloning), tracking the read.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        track_read(self.as_any_source());
        self.inner.get()
    }

    /// Get the current value without tracking.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.get()
    }

    /// Access the value by reference, tracking the read.
    ///
    /// The closure must not write this signal.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        track_read(self.as_any_source());
        self.inner.with(f)
    }

    /// Set a new value. Returns true (and notifies) if the value changed.
    pub fn set(&self, value: T) -> bool {
        let changed = self.inner.set(value);
        if changed {
            notify_write(&*self.inner);
        }
        changed
    }

    /// Update the value from the current one. Returns true if it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool
    where
        T: Clone,
    {
        let changed = self.inner.update(f);
        if changed {
            notify_write(&*self.inner);
        }
        changed
    }

    /// Run `callback` on every change after the current value.
    ///
    /// The callback itself is untracked; the returned effect keeps the
    /// subscription alive.
    pub fn on(&self, mut callback: impl FnMut(&T) + 'static) -> Effect
    where
        T: Clone,
    {
        let signal = self.clone();
        let first = Cell::new(true);
        effect(move || {
            let value = signal.get();
            if first.replace(false) {
                return;
            }
            untrack(|| callback(&value));
        })
    }

    /// Number of accepted writes so far
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    /// Get the inner source (for advanced use).
    pub fn inner(&self) -> &Rc<SourceInner<T>> {
        &self.inner
    }

    /// Get as `Rc<dyn AnySource>` for graph bookkeeping.
    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }
}

impl<T: Clone + 'static> Writable<T> for Signal<T> {
    fn try_set(&self, value: T) -> Result<bool, ReactiveError> {
        Ok(self.set(value))
    }

    fn try_update(&self, f: impl FnOnce(&mut T)) -> Result<bool, ReactiveError> {
        Ok(self.update(f))
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner
            .with(|value| f.debug_struct("Signal").field("value", value).finish())
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

/// Create a new signal with the given initial value.
///
/// # Example
///
/// ```
/// use spark_reactive::signal;
///
/// let name = signal(String::from("Alice"));
/// name.set(String::from("Bob"));
/// assert_eq!(name.get(), "Bob");
/// ```
pub fn signal<T>(value: T) -> Signal<T>
where
    T: PartialEq + 'static,
{
    Signal::new(value)
}

/// Create a signal with a custom equality function.
///
/// Use [`never_equals`](crate::never_equals) to notify on every write.
pub fn signal_with_equals<T: 'static>(value: T, equals: EqualsFn<T>) -> Signal<T> {
    Signal::new_with_equals(value, equals)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::never_equals;
    use crate::primitives::scope::{create_scope, with_scope};
    use crate::reactivity::scheduling::flush_microtasks;
    use std::cell::RefCell;

    #[test]
    fn set_reports_change() {
        let s = signal(1);
        assert!(s.set(2));
        assert!(!s.set(2));
        assert_eq!(s.version(), 1);
    }

    #[test]
    fn update_compares_with_equality() {
        let s = signal(vec![1, 2]);
        assert!(!s.update(|v| v.truncate(5)));
        assert!(s.update(|v| v.push(3)));
        assert_eq!(s.get(), vec![1, 2, 3]);
    }

    #[test]
    fn never_equals_always_notifies() {
        let s = signal_with_equals(1, never_equals);
        let runs = Rc::new(Cell::new(0));
        let (s2, r2) = (s.clone(), runs.clone());
        let _fx = effect(move || {
            let _ = s2.get();
            r2.set(r2.get() + 1);
        });

        s.set(1);
        flush_microtasks();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn on_skips_initial_value() {
        let s = signal(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = s.on(move |v| seen2.borrow_mut().push(*v));

        flush_microtasks();
        assert!(seen.borrow().is_empty());

        s.set(1);
        flush_microtasks();
        s.set(2);
        flush_microtasks();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn try_set_on_signal_succeeds() {
        let s = signal(1);
        assert_eq!(s.try_set(2), Ok(true));
        assert_eq!(s.try_update(|v| *v += 1), Ok(true));
        assert_eq!(s.peek(), 3);
    }

    #[test]
    fn scope_disposal_drops_subscribers() {
        let scope = create_scope();
        let s = with_scope(&scope, || signal(0));
        let s2 = s.clone();
        let _fx = effect(move || {
            let _ = s2.get();
        });
        assert_eq!(s.subscriber_count(), 1);

        scope.dispose();
        assert_eq!(s.subscriber_count(), 0);
        assert_eq!(s.get(), 0, "the value stays readable");
    }

    #[test]
    fn debug_shows_value() {
        let s = signal(7);
        assert_eq!(format!("{s:?}"), "Signal { value: 7 }");
    }
}
