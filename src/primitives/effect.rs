// ============================================================================
// spark-reactive - Effect System
// Side effects that re-run when dependencies change
// ============================================================================
//
// Effects are reactions that run side effects when their dependencies change.
// Unlike computeds, effects don't produce values - they just run code.
//
// Key features:
// - Automatic dependency tracking, rebuilt on every run
// - Cleanup/teardown functions
// - Deferred, deduplicated re-runs (microtask, or the batch queue in batch())
// - Scope ownership and RAII disposal
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::catch_and_report;
use crate::core::types::{AnyReaction, AnySource, NodeId};
use crate::primitives::abort::{AbortController, AbortSignal};
use crate::primitives::scope::{get_current_scope, Scope, WeakScope};
use crate::reactivity::scheduling::{queue_in_batch, schedule_microtask, spawn_local, BatchTask};
use crate::reactivity::tracking::{unsubscribe_all, ExecutionGuard};

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// Cleanup function returned by effects, runs before next execution
pub type CleanupFn = Box<dyn FnOnce()>;

/// Effect function signature - returns optional cleanup
pub type EffectFn = Box<dyn FnMut() -> Option<CleanupFn>>;

// =============================================================================
// EFFECT INNER
// =============================================================================

/// The inner effect implementation.
///
/// Implements AnyReaction (but NOT AnySource - effects are reactions only).
pub struct EffectInner {
    id: NodeId,

    /// Flags bitmask for state tracking
    flags: Cell<u32>,

    /// The effect function (taken out while it runs)
    func: RefCell<Option<EffectFn>>,

    /// Subscriber sets joined during the last run
    deps: RefCell<Vec<Rc<dyn AnySource>>>,

    /// Teardown/cleanup function from last run
    teardown: RefCell<Option<CleanupFn>>,

    /// Scope the effect was declared in
    scope: Option<WeakScope>,

    /// Stable batch-queue entry, so repeated triggers dedupe by identity
    batch_runner: BatchTask,

    /// Completed runs
    runs: Cell<u64>,

    self_weak: Weak<EffectInner>,
}

impl EffectInner {
    /// Create a new effect inner
    pub fn new(func: EffectFn, scope: Option<&Scope>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<EffectInner>| {
            let runner = weak.clone();
            Self {
                id: NodeId::next(),
                flags: Cell::new(EFFECT),
                func: RefCell::new(Some(func)),
                deps: RefCell::new(Vec::new()),
                teardown: RefCell::new(None),
                scope: scope.map(Scope::downgrade),
                batch_runner: Rc::new(move || {
                    if let Some(effect) = runner.upgrade() {
                        update_effect(&effect);
                    }
                }),
                runs: Cell::new(0),
                self_weak: weak.clone(),
            }
        })
    }

    /// Queue a re-run. No-op if disposed or already queued.
    pub fn schedule(&self) {
        let flags = self.flags.get();
        if flags & (DISPOSED | QUEUED) != 0 {
            return;
        }
        self.flags.set(flags | QUEUED);

        if with_context(|ctx| ctx.is_batching()) {
            queue_in_batch(self.batch_runner.clone());
        } else {
            let weak = self.self_weak.clone();
            schedule_microtask(move || {
                if let Some(effect) = weak.upgrade() {
                    update_effect(&effect);
                }
            });
        }
    }

    /// Number of completed runs
    pub fn run_count(&self) -> u64 {
        self.runs.get()
    }

    fn execute_teardown(&self) {
        let teardown = self.teardown.borrow_mut().take();
        if let Some(cleanup) = teardown {
            catch_and_report("effect cleanup", cleanup);
        }
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        // Run teardown if present
        if let Some(cleanup) = self.teardown.get_mut().take() {
            catch_and_report("effect cleanup", cleanup);
        }
    }
}

// =============================================================================
// AnyReaction IMPLEMENTATION
// =============================================================================

impl AnyReaction for EffectInner {
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
        self.scope.as_ref().and_then(WeakScope::upgrade)
    }

    fn notify(&self) {
        self.schedule();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// UPDATE / DESTROY
// =============================================================================

/// Execute an effect: drop old dependencies, run the previous teardown, then
/// run the function with this effect (and its scope) active.
///
/// A panic in the function is reported; the effect keeps whatever
/// dependencies it managed to read before panicking.
pub fn update_effect(effect: &Rc<EffectInner>) {
    let flags = effect.flags.get();
    if flags & DISPOSED != 0 {
        return;
    }
    effect.flags.set((flags & !QUEUED) | RUNNING);

    unsubscribe_all(&**effect);
    effect.execute_teardown();

    let func = effect.func.borrow_mut().take();
    let Some(mut func) = func else {
        // Re-entrant run (the effect triggered itself synchronously)
        effect.flags.set(effect.flags.get() & !RUNNING);
        return;
    };

    let reaction: Weak<dyn AnyReaction> = effect.self_weak.clone();
    let teardown = {
        let _guard = ExecutionGuard::for_effect(reaction, effect.owner_scope());
        catch_and_report("effect", &mut func)
    };

    effect.runs.set(effect.runs.get() + 1);
    effect.flags.set(effect.flags.get() & !RUNNING);

    if effect.is_disposed() {
        // Disposed from inside its own run
        if let Some(Some(cleanup)) = teardown {
            catch_and_report("effect cleanup", cleanup);
        }
        return;
    }

    *effect.func.borrow_mut() = Some(func);
    *effect.teardown.borrow_mut() = teardown.flatten();
}

/// Dispose an effect: unsubscribe, run teardown, drop the function.
///
/// Idempotent. Scheduling a disposed effect is a no-op.
pub fn destroy_effect(effect: &EffectInner) {
    let flags = effect.flags.get();
    if flags & DISPOSED != 0 {
        return;
    }
    effect.flags.set((flags | DISPOSED) & !QUEUED);

    unsubscribe_all(effect);
    effect.execute_teardown();

    let func = effect.func.borrow_mut().take();
    drop(func);
}

// =============================================================================
// EFFECT WRAPPER
// =============================================================================

/// Handle to a running effect.
///
/// Dropping the last handle of an effect that no scope owns disposes it. An
/// effect created inside a scope lives until that scope is disposed (or until
/// `dispose()` is called).
#[must_use = "dropping the handle of an unscoped effect disposes it"]
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    /// Get access to the inner effect
    pub fn inner(&self) -> &Rc<EffectInner> {
        &self.inner
    }

    /// Check if this effect is disposed
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Dispose this effect
    pub fn dispose(&self) {
        destroy_effect(&self.inner);
    }

    /// Number of completed runs
    pub fn run_count(&self) -> u64 {
        self.inner.run_count()
    }

    /// Number of sources read during the last run
    pub fn dep_count(&self) -> usize {
        self.inner.dep_count()
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // A scope (or a queued batch runner) holding it keeps the count above 1
        if Rc::strong_count(&self.inner) == 1 {
            self.dispose();
        }
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id.0)
            .field("disposed", &self.is_disposed())
            .field("runs", &self.run_count())
            .finish()
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

/// Create an effect that runs now and again whenever its dependencies change.
///
/// Re-runs are deferred to the next microtask (or to the batch flush inside
/// `batch()`), and several triggers before that collapse into one run.
///
/// # Example
///
/// ```
/// use spark_reactive::{effect, flush_microtasks, signal};
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let count = signal(0);
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// let (count2, log2) = (count.clone(), log.clone());
/// let fx = effect(move || log2.borrow_mut().push(count2.get()));
///
/// count.set(1);
/// count.set(2);
/// flush_microtasks();
/// assert_eq!(*log.borrow(), vec![0, 2]);
///
/// fx.dispose();
/// count.set(3);
/// flush_microtasks();
/// assert_eq!(*log.borrow(), vec![0, 2]);
/// ```
pub fn effect<F>(mut f: F) -> Effect
where
    F: FnMut() + 'static,
{
    effect_with_cleanup(move || {
        f();
        None
    })
}

/// Create an effect that can return a cleanup function.
///
/// The cleanup function runs before each re-execution and when disposed.
pub fn effect_with_cleanup<F>(f: F) -> Effect
where
    F: FnMut() -> Option<CleanupFn> + 'static,
{
    Effect {
        inner: create_effect(Box::new(f)),
    }
}

/// Create an effect whose body starts async work.
///
/// `f` runs tracked and synchronously (only reads made before its first
/// `.await`, i.e. while building the future, become dependencies). Each run
/// gets a fresh [`AbortSignal`]; the previous run's signal is aborted before
/// the next run starts and when the effect is disposed.
pub fn effect_async<F, Fut>(mut f: F) -> Effect
where
    F: FnMut(AbortSignal) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    effect_with_cleanup(move || {
        let controller = AbortController::new();
        let future = f(controller.signal());
        spawn_local(future);
        Some(Box::new(move || controller.abort()) as CleanupFn)
    })
}

fn create_effect(func: EffectFn) -> Rc<EffectInner> {
    let scope = get_current_scope();
    let effect = EffectInner::new(func, scope.as_ref());

    // Register with current scope (if any)
    if let Some(scope) = &scope {
        let owned = effect.clone();
        scope.on_cleanup(move || destroy_effect(&owned));
    }

    update_effect(&effect);
    effect
}

// =============================================================================
// TESTS
// =============================================================================
