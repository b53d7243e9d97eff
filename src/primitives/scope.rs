// ============================================================================
// spark-reactive - Scope
//
// Ownership boundary for effects, resources and cache references.
// ============================================================================
//
// A Scope collects cleanup callbacks and runs them, in registration order,
// exactly once when it is disposed. Everything created while a scope is
// current registers its teardown there: effects dispose themselves, signals
// and computeds drop their subscribers, resources abort their fetch, cached
// entries release their reference.
//
// Key features:
// - with_scope(scope, fn) - Execute function with this scope current
// - dispose() - Run all cleanups (idempotent)
// - Nested scopes (a child created under a current scope is disposed with it)
// - Failed cleanups are collected and reported as one CleanupFailed error
//
// A Scope is not disposed when its last handle is dropped. Disposal is always
// explicit or driven by the parent.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::core::error::{report_error, ReactiveError};
use crate::core::types::NodeId;

// =============================================================================
// THREAD-LOCAL SCOPE STATE
// =============================================================================

thread_local! {
    /// Currently active scope (if any)
    static CURRENT_SCOPE: RefCell<Option<Scope>> = const { RefCell::new(None) };
}

/// Get the scope that is current on this thread, if any.
pub fn get_current_scope() -> Option<Scope> {
    CURRENT_SCOPE.with(|s| s.borrow().clone())
}

/// Set the current scope, returning the previous one
pub(crate) fn set_current_scope(scope: Option<Scope>) -> Option<Scope> {
    CURRENT_SCOPE.with(|s| s.replace(scope))
}

// =============================================================================
// CLEANUP TYPE
// =============================================================================

/// Cleanup function type for scope disposal
pub type ScopeCleanupFn = Box<dyn FnOnce()>;

// =============================================================================
// SCOPE INNER
// =============================================================================

/// Internal scope state
pub struct ScopeInner {
    id: NodeId,

    /// Set once, on the first dispose()
    disposed: Cell<bool>,

    /// Cleanup functions, keyed so that a disposed child can unregister itself
    cleanups: RefCell<Vec<(u64, ScopeCleanupFn)>>,

    /// Key handed to the next registered cleanup
    next_key: Cell<u64>,

    /// Parent scope (for nested scopes)
    parent: Option<Weak<ScopeInner>>,

    /// Key of our disposal cleanup in the parent's list
    parent_key: Cell<Option<u64>>,
}

impl ScopeInner {
    fn register(&self, cleanup: ScopeCleanupFn) -> u64 {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        self.cleanups.borrow_mut().push((key, cleanup));
        key
    }

    fn unregister(&self, key: u64) {
        let removed = {
            let mut cleanups = self.cleanups.borrow_mut();
            cleanups
                .iter()
                .position(|(k, _)| *k == key)
                .map(|index| cleanups.remove(index))
        };
        // Dropped outside the borrow: the closure may own another scope
        drop(removed);
    }
}

// =============================================================================
// SCOPE (public handle)
// =============================================================================

/// A lifetime boundary. Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

impl Scope {
    /// Create a scope. If a scope is current, the new one becomes its child.
    pub fn new() -> Self {
        match get_current_scope() {
            Some(parent) => Self::child_of(&parent),
            None => Self::detached(),
        }
    }

    /// Create a scope with no parent, even if a scope is current.
    pub fn detached() -> Self {
        Self::build(None)
    }

    /// Create a child of `parent`, disposed when `parent` is.
    ///
    /// A child of an already-disposed parent is disposed immediately.
    pub fn child_of(parent: &Scope) -> Self {
        let scope = Self::build(Some(Rc::downgrade(&parent.inner)));
        if parent.is_disposed() {
            scope.dispose();
            return scope;
        }

        let strong = scope.clone();
        let key = parent.inner.register(Box::new(move || strong.dispose()));
        scope.inner.parent_key.set(Some(key));
        scope
    }

    fn build(parent: Option<Weak<ScopeInner>>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                id: NodeId::next(),
                disposed: Cell::new(false),
                cleanups: RefCell::new(Vec::new()),
                next_key: Cell::new(0),
                parent,
                parent_key: Cell::new(None),
            }),
        }
    }

    /// Stable identity of this scope
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Whether dispose() has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// The parent scope, if it is still alive
    pub fn parent(&self) -> Option<Scope> {
        let parent = self.inner.parent.as_ref()?;
        parent.upgrade().map(|inner| Scope { inner })
    }

    /// Whether `self` is `ancestor` or one of its descendants.
    pub fn is_within(&self, ancestor: &Scope) -> bool {
        let mut cursor = Some(self.clone());
        while let Some(scope) = cursor {
            if Rc::ptr_eq(&scope.inner, &ancestor.inner) {
                return true;
            }
            cursor = scope.parent();
        }
        false
    }

    /// Non-owning handle, used by reactions to remember their scope.
    pub fn downgrade(&self) -> WeakScope {
        WeakScope {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Register a callback to run when this scope is disposed.
    ///
    /// On an already-disposed scope the callback runs immediately; a panic in
    /// it is reported and swallowed.
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        if self.is_disposed() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(cleanup)) {
                report_error(ReactiveError::from_panic("scope cleanup", payload));
            }
            return;
        }
        self.inner.register(Box::new(cleanup));
    }

    /// Number of registered cleanups that have not run yet
    pub fn cleanup_count(&self) -> usize {
        self.inner.cleanups.borrow().len()
    }

    /// Execute `f` with this scope current.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        with_scope(self, f)
    }

    /// Run every cleanup once, in registration order.
    ///
    /// Idempotent. Cleanups registered while disposing run immediately. Every
    /// cleanup runs even if earlier ones panic; failures are aggregated into
    /// one `CleanupFailed` report.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }

        let cleanups = std::mem::take(&mut *self.inner.cleanups.borrow_mut());
        tracing::trace!(scope = self.inner.id.0, cleanups = cleanups.len(), "disposing scope");

        let mut failures = Vec::new();
        for (_, cleanup) in cleanups {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(cleanup)) {
                failures.push(ReactiveError::from_panic("scope cleanup", payload));
            }
        }

        // Leave the parent's list so long-lived parents do not accumulate
        // disposed children.
        if let (Some(parent), Some(key)) = (self.parent(), self.inner.parent_key.take()) {
            parent.inner.unregister(key);
        }

        if !failures.is_empty() {
            let failed = failures.len();
            tracing::error!(scope = self.inner.id.0, failed, "scope cleanups failed");
            report_error(ReactiveError::CleanupFailed(failures));
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id.0)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Weak counterpart of [`Scope`].
#[derive(Clone)]
pub struct WeakScope {
    inner: Weak<ScopeInner>,
}

impl WeakScope {
    pub fn upgrade(&self) -> Option<Scope> {
        self.inner.upgrade().map(|inner| Scope { inner })
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

/// Create a new scope (a child of the current scope, if any).
pub fn create_scope() -> Scope {
    Scope::new()
}

/// Execute `f` with `scope` as the current scope, restoring the previous one
/// afterwards (including on panic).
pub fn with_scope<R>(scope: &Scope, f: impl FnOnce() -> R) -> R {
    struct RestoreGuard {
        prev: Option<Option<Scope>>,
    }

    impl Drop for RestoreGuard {
        fn drop(&mut self) {
            if let Some(prev) = self.prev.take() {
                set_current_scope(prev);
            }
        }
    }

    let _guard = RestoreGuard {
        prev: Some(set_current_scope(Some(scope.clone()))),
    };
    f()
}

/// Register a cleanup on the current scope.
///
/// Returns false (and drops the callback) when no scope is current.
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) -> bool {
    match get_current_scope() {
        Some(scope) => {
            scope.on_cleanup(cleanup);
            true
        }
        None => {
            tracing::debug!("on_cleanup called outside of any scope; ignored");
            false
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
