// ============================================================================
// spark-reactive - Mutations
// Single-flight async writes with an ordered callback pipeline
// ============================================================================
//
// Pipeline of one attempt:
//
//   on_mutate (sync, produces the optimistic context)
//     -> mutation function (abortable)
//     -> success: data, on_success, cache invalidation, on_settled
//     -> failure: error, on_error, on_settled
//
// While an attempt is in flight, run() returns that attempt's shared future.
// run_forced() and reset() abort it; an aborted attempt fires no callback.
// A panic in on_mutate or in the synchronous part of the function settles the
// attempt as failed right away.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;

use crate::core::error::{catch_and_report, report_error, ReactiveError};
use crate::core::types::never_equals;
use crate::primitives::abort::{AbortController, AbortSignal};
use crate::primitives::scope::get_current_scope;
use crate::primitives::signal::{signal, signal_with_equals, Signal};
use crate::query::cache;
use crate::query::key::QueryKey;
use crate::reactivity::batching::untrack;
use crate::reactivity::scheduling::spawn_local;

/// Future returned by [`Mutation::run`]. Cloneable; every clone yields the
/// attempt's outcome.
pub type MutationFuture<T> = Shared<LocalBoxFuture<'static, Result<T, ReactiveError>>>;

// =============================================================================
// OPTIONS
// =============================================================================

/// Callbacks and invalidation targets of a mutation.
///
/// `C` is the context returned by `on_mutate` (optimistic snapshot, rollback
/// data); callbacks receive it as `Option<&C>`, `None` without `on_mutate`.
pub struct MutationOptions<I, T, C = ()> {
    pub on_mutate: Option<Rc<dyn Fn(&I) -> C>>,
    pub on_success: Option<Rc<dyn Fn(&T, &I, Option<&C>)>>,
    pub on_error: Option<Rc<dyn Fn(&ReactiveError, &I, Option<&C>)>>,
    pub on_settled: Option<Rc<dyn Fn(Result<&T, &ReactiveError>, &I, Option<&C>)>>,
    /// Tags invalidated after a success
    pub invalidate_tags: Vec<String>,
    /// Keys invalidated after a success
    pub invalidate_keys: Vec<QueryKey>,
}

impl<I, T, C> Default for MutationOptions<I, T, C> {
    fn default() -> Self {
        Self {
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidate_tags: Vec::new(),
            invalidate_keys: Vec::new(),
        }
    }
}

impl<I, T, C> MutationOptions<I, T, C> {
    pub fn on_mutate(mut self, f: impl Fn(&I) -> C + 'static) -> Self {
        self.on_mutate = Some(Rc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&T, &I, Option<&C>) + 'static) -> Self {
        self.on_success = Some(Rc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ReactiveError, &I, Option<&C>) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
        self
    }

    pub fn on_settled(
        mut self,
        f: impl Fn(Result<&T, &ReactiveError>, &I, Option<&C>) + 'static,
    ) -> Self {
        self.on_settled = Some(Rc::new(f));
        self
    }

    pub fn invalidate_tag(mut self, tag: impl Into<String>) -> Self {
        self.invalidate_tags.push(tag.into());
        self
    }

    pub fn invalidate_key(mut self, key: QueryKey) -> Self {
        self.invalidate_keys.push(key);
        self
    }
}

// =============================================================================
// MUTATION STATE
// =============================================================================

struct InFlight<T> {
    attempt: u64,
    controller: AbortController,
    future: MutationFuture<T>,
}

struct MutationInner<I, T, C> {
    func: Box<dyn Fn(I, AbortSignal) -> LocalBoxFuture<'static, Result<T, ReactiveError>>>,
    options: MutationOptions<I, T, C>,

    data: Signal<Option<T>>,
    error: Signal<Option<ReactiveError>>,
    loading: Signal<bool>,

    in_flight: RefCell<Option<InFlight<T>>>,
    attempts: Cell<u64>,
    self_weak: Weak<MutationInner<I, T, C>>,
}

impl<I, T, C> MutationInner<I, T, C>
where
    I: Clone + 'static,
    T: Clone + 'static,
    C: 'static,
{
    fn start(&self, input: I) -> MutationFuture<T> {
        let attempt = self.attempts.get() + 1;
        self.attempts.set(attempt);

        let context = match &self.options.on_mutate {
            Some(f) => match catch_unwind(AssertUnwindSafe(|| f(&input))) {
                Ok(context) => Some(context),
                Err(payload) => {
                    let err = ReactiveError::from_panic("mutation on_mutate", payload);
                    return self.fail_early(attempt, &input, None, err);
                }
            },
            None => None,
        };

        let controller = AbortController::new();
        self.loading.set(true);
        self.error.set(None);

        tracing::debug!(attempt, "mutation started");

        let started = catch_unwind(AssertUnwindSafe(|| {
            untrack(|| (self.func)(input.clone(), controller.signal()))
        }));
        let work = match started {
            Ok(work) => work,
            Err(payload) => {
                let err = ReactiveError::from_panic("mutation", payload);
                return self.fail_early(attempt, &input, context.as_ref(), err);
            }
        };
        let guarded = controller.signal().wrap(AssertUnwindSafe(work).catch_unwind());
        let weak = self.self_weak.clone();
        let aborter = controller.clone();

        let future = async move {
            let result = match guarded.await {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => Err(ReactiveError::from_panic("mutation", payload)),
                Err(aborted) => Err(aborted),
            };

            match weak.upgrade() {
                Some(inner) if !aborter.is_aborted() => {
                    inner.settle(attempt, &input, context.as_ref(), result)
                }
                _ => {
                    tracing::debug!(attempt, "mutation aborted; outcome discarded");
                    Err(ReactiveError::Aborted)
                }
            }
        }
        .boxed_local()
        .shared();

        *self.in_flight.borrow_mut() = Some(InFlight {
            attempt,
            controller,
            future: future.clone(),
        });

        // Driven to completion whether or not the caller awaits it
        spawn_local(future.clone().map(|_| ()));
        future
    }

    /// Settle an attempt that failed before its future existed.
    fn fail_early(
        &self,
        attempt: u64,
        input: &I,
        context: Option<&C>,
        err: ReactiveError,
    ) -> MutationFuture<T> {
        tracing::debug!(attempt, error = %err, "mutation failed to start");
        report_error(err.clone());
        self.error.set(Some(err.clone()));
        self.loading.set(false);
        if let Some(f) = &self.options.on_error {
            catch_and_report("mutation on_error", || f(&err, input, context));
        }
        if let Some(f) = &self.options.on_settled {
            catch_and_report("mutation on_settled", || f(Err(&err), input, context));
        }
        futures::future::ready(Err(err)).boxed_local().shared()
    }

    fn settle(
        &self,
        attempt: u64,
        input: &I,
        context: Option<&C>,
        result: Result<T, ReactiveError>,
    ) -> Result<T, ReactiveError> {
        match &result {
            Ok(value) => {
                self.data.set(Some(value.clone()));
                if let Some(f) = &self.options.on_success {
                    catch_and_report("mutation on_success", || f(value, input, context));
                }
                self.invalidate();
            }
            Err(err) if err.is_abort() => {
                tracing::debug!(attempt, "mutation function reported abort");
            }
            Err(err) => {
                tracing::debug!(attempt, error = %err, "mutation failed");
                self.error.set(Some(err.clone()));
                if let Some(f) = &self.options.on_error {
                    catch_and_report("mutation on_error", || f(err, input, context));
                }
            }
        }

        if !result.as_ref().is_err_and(ReactiveError::is_abort) {
            if let Some(f) = &self.options.on_settled {
                catch_and_report("mutation on_settled", || f(result.as_ref(), input, context));
            }
        }

        self.loading.set(false);
        let finished = self.in_flight.borrow().as_ref().is_some_and(|f| f.attempt == attempt);
        if finished {
            self.in_flight.borrow_mut().take();
        }
        result
    }

    fn invalidate(&self) {
        if !self.options.invalidate_tags.is_empty() {
            cache::invalidate_tags(&self.options.invalidate_tags);
        }
        for key in &self.options.invalidate_keys {
            cache::invalidate_key(key);
        }
    }

    fn abort_in_flight(&self) {
        let previous = self.in_flight.borrow_mut().take();
        if let Some(previous) = previous {
            tracing::debug!(attempt = previous.attempt, "aborting in-flight mutation");
            previous.controller.abort();
            self.loading.set(false);
        }
    }
}

// =============================================================================
// MUTATION<I, T, C> - The public handle
// =============================================================================

/// An async write operation. Cloning yields another handle to the same
/// mutation.
pub struct Mutation<I, T, C = ()> {
    inner: Rc<MutationInner<I, T, C>>,
}

impl<I, T, C> Clone for Mutation<I, T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, T, C> Mutation<I, T, C>
where
    I: Clone + 'static,
    T: Clone + 'static,
    C: 'static,
{
    /// Create a mutation. Inside a scope, disposing the scope aborts the
    /// in-flight attempt.
    pub fn new<F, Fut>(func: F, options: MutationOptions<I, T, C>) -> Self
    where
        F: Fn(I, AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<T, ReactiveError>> + 'static,
    {
        let inner = Rc::new_cyclic(|weak| MutationInner {
            func: Box::new(move |input, abort| func(input, abort).boxed_local()),
            options,
            data: signal_with_equals(None, never_equals),
            error: signal(None),
            loading: signal(false),
            in_flight: RefCell::new(None),
            attempts: Cell::new(0),
            self_weak: weak.clone(),
        });

        if let Some(scope) = get_current_scope() {
            let weak = Rc::downgrade(&inner);
            scope.on_cleanup(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.abort_in_flight();
                }
            });
        }

        Self { inner }
    }

    /// Run the mutation, or join the attempt already in flight (whose input
    /// wins).
    pub fn run(&self, input: I) -> MutationFuture<T> {
        let joined = self.inner.in_flight.borrow().as_ref().map(|f| f.future.clone());
        match joined {
            Some(future) => {
                tracing::trace!("mutation joins in-flight attempt");
                future
            }
            None => self.inner.start(input),
        }
    }

    /// Abort the in-flight attempt, if any, and start a new one.
    pub fn run_forced(&self, input: I) -> MutationFuture<T> {
        self.inner.abort_in_flight();
        self.inner.start(input)
    }

    /// Abort the in-flight attempt and clear `data`, `error` and `loading`.
    pub fn reset(&self) {
        self.inner.abort_in_flight();
        self.inner.data.set(None);
        self.inner.error.set(None);
        self.inner.loading.set(false);
    }

    /// Result of the latest successful attempt (tracked)
    pub fn data(&self) -> Option<T> {
        self.inner.data.get()
    }

    pub fn error(&self) -> Option<ReactiveError> {
        self.inner.error.get()
    }

    pub fn loading(&self) -> bool {
        self.inner.loading.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_flight.borrow().is_some()
    }

    pub fn data_signal(&self) -> Signal<Option<T>> {
        self.inner.data.clone()
    }

    pub fn error_signal(&self) -> Signal<Option<ReactiveError>> {
        self.inner.error.clone()
    }

    pub fn loading_signal(&self) -> Signal<bool> {
        self.inner.loading.clone()
    }
}

impl<I, T: std::fmt::Debug + Clone + 'static, C> std::fmt::Debug for Mutation<I, T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("data", &self.inner.data.peek())
            .field("loading", &self.inner.loading.peek())
            .field("error", &self.inner.error.peek())
            .finish()
    }
}

/// Create a mutation.
pub fn create_mutation<I, T, C, F, Fut>(
    func: F,
    options: MutationOptions<I, T, C>,
) -> Mutation<I, T, C>
where
    I: Clone + 'static,
    T: Clone + 'static,
    C: 'static,
    F: Fn(I, AbortSignal) -> Fut + 'static,
    Fut: Future<Output = Result<T, ReactiveError>> + 'static,
{
    Mutation::new(func, options)
}

// =============================================================================
// TESTS
// =============================================================================
