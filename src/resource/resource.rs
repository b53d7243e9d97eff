// ============================================================================
// spark-reactive - Resource
// Cancellation-safe async state exposed as signals
// ============================================================================
//
// A Resource runs an async fetcher and publishes its progress through four
// signals: data, loading, fetching and error. Runs are numbered. A private
// "kick" signal holds the id of the latest requested run, and a driver effect
// that reads it starts the run. Callers of refresh() get a waiter keyed by the
// run id they asked for.
//
// Race rules:
// - a run that was aborted before it settled writes nothing and fires no
//   callback
// - a settling run resolves the waiters of every id up to its own, but only
//   while its controller is still the latest one (a superseded run never
//   resolves waiters early)
// - cancel() and disposal resolve every outstanding waiter
// ============================================================================

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::core::error::{catch_and_report, ReactiveError};
use crate::core::types::never_equals;
use crate::primitives::abort::{AbortController, AbortSignal};
use crate::primitives::effect::{effect, Effect};
use crate::primitives::scope::get_current_scope;
use crate::primitives::signal::{signal, signal_with_equals, Signal};
use crate::reactivity::batching::untrack;
use crate::reactivity::scheduling::spawn_local;

/// Boxed future produced by a fetcher.
pub type FetchFuture<T> = LocalBoxFuture<'static, Result<T, ReactiveError>>;

/// Success callback.
pub type SuccessCallback<T> = Rc<dyn Fn(&T)>;

/// Failure callback.
pub type ErrorCallback = Rc<dyn Fn(&ReactiveError)>;

// =============================================================================
// OPTIONS
// =============================================================================

/// Options for [`create_resource`].
pub struct ResourceOptions<T> {
    /// Value of `data` before the first successful run
    pub initial: Option<T>,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
}

impl<T> Default for ResourceOptions<T> {
    fn default() -> Self {
        Self {
            initial: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> Clone for ResourceOptions<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            initial: self.initial.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> ResourceOptions<T> {
    pub fn initial(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) + 'static) -> Self {
        self.on_success = Some(Rc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ReactiveError) + 'static) -> Self {
        self.on_error = Some(Rc::new(callback));
        self
    }
}

/// Options for [`Resource::refresh_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Abort the in-flight run and start a new one
    pub force: bool,
    /// Leave `loading` untouched (stale-while-revalidate); only `fetching`
    /// reports the run
    pub background: bool,
}

impl RefreshOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            background: false,
        }
    }

    pub fn background() -> Self {
        Self {
            force: true,
            background: true,
        }
    }
}

// =============================================================================
// REFRESH HANDLE
// =============================================================================

/// Future returned by `refresh()`. Always resolves, never fails.
#[must_use = "the handle resolves when the requested run settles"]
pub struct RefreshHandle {
    rx: oneshot::Receiver<()>,
}

impl RefreshHandle {
    fn pending() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn ready() -> Self {
        let (tx, handle) = Self::pending();
        let _ = tx.send(());
        handle
    }
}

impl Future for RefreshHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped sender means the resource went away; that also resolves
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

// =============================================================================
// RESOURCE STATE
// =============================================================================

pub(crate) struct ResourceState<T> {
    data: Signal<Option<T>>,
    loading: Signal<bool>,
    fetching: Signal<bool>,
    error: Signal<Option<ReactiveError>>,

    /// Id of the latest requested run
    kick: Signal<u64>,

    /// Last id handed out
    next_run: Cell<u64>,

    /// Latest requested run that has not settled (refresh joins it)
    pending: Cell<Option<u64>>,

    /// Run actually started and not settled yet
    running: Cell<Option<u64>>,

    /// Highest run id the driver has started
    last_started: Cell<u64>,

    /// Runs up to this id were cancelled before they started
    cancelled_through: Cell<u64>,

    /// Flags for the next run the driver starts
    next_forced: Cell<bool>,
    next_background: Cell<bool>,

    waiters: RefCell<BTreeMap<u64, Vec<oneshot::Sender<()>>>>,
    last_controller: RefCell<Option<AbortController>>,

    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,

    driver: RefCell<Option<Effect>>,
    disposed: Cell<bool>,
    fetch_count: Cell<u64>,
}

impl<T: Clone + 'static> ResourceState<T> {
    pub(crate) fn new(options: ResourceOptions<T>) -> Rc<Self> {
        Rc::new(Self {
            data: signal_with_equals(options.initial, never_equals),
            loading: signal(false),
            fetching: signal(false),
            error: signal(None),
            kick: signal(1),
            next_run: Cell::new(1),
            pending: Cell::new(Some(1)),
            running: Cell::new(None),
            last_started: Cell::new(0),
            cancelled_through: Cell::new(0),
            next_forced: Cell::new(false),
            next_background: Cell::new(false),
            waiters: RefCell::new(BTreeMap::new()),
            last_controller: RefCell::new(None),
            on_success: options.on_success,
            on_error: options.on_error,
            driver: RefCell::new(None),
            disposed: Cell::new(false),
            fetch_count: Cell::new(0),
        })
    }

    pub(crate) fn kick_signal(&self) -> Signal<u64> {
        self.kick.clone()
    }

    /// Install the driver effect and tie the resource to the current scope.
    pub(crate) fn attach(self: &Rc<Self>, driver: Effect) {
        *self.driver.borrow_mut() = Some(driver);

        if let Some(scope) = get_current_scope() {
            let owned = self.clone();
            scope.on_cleanup(move || owned.dispose());
        }
    }

    /// Map the id the driver saw to the id of the run it should start.
    ///
    /// A re-run caused by something other than the kick (dependency change)
    /// gets a fresh id.
    pub(crate) fn claim(&self, kicked: u64) -> u64 {
        if kicked > self.last_started.get() {
            return kicked;
        }
        let id = self.next_run.get() + 1;
        self.next_run.set(id);
        self.pending.set(Some(id));
        id
    }

    /// Whether the run about to start was requested with `force`
    pub(crate) fn take_forced(&self) -> bool {
        self.next_forced.replace(false)
    }

    fn add_waiter(&self, run_id: u64) -> RefreshHandle {
        let (tx, handle) = RefreshHandle::pending();
        self.waiters.borrow_mut().entry(run_id).or_default().push(tx);
        handle
    }

    fn resolve_through(&self, run_id: u64) {
        let resolved = {
            let mut waiters = self.waiters.borrow_mut();
            let later = waiters.split_off(&(run_id + 1));
            std::mem::replace(&mut *waiters, later)
        };
        for tx in resolved.into_values().flatten() {
            let _ = tx.send(());
        }
    }

    fn resolve_all(&self) {
        let resolved = std::mem::take(&mut *self.waiters.borrow_mut());
        for tx in resolved.into_values().flatten() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn refresh(&self, options: RefreshOptions) -> RefreshHandle {
        if self.disposed.get() {
            return RefreshHandle::ready();
        }

        if !options.force {
            if let Some(current) = self.pending.get() {
                tracing::trace!(run = current, "refresh joins in-flight run");
                return self.add_waiter(current);
            }
        } else {
            let previous = self.last_controller.borrow().clone();
            if let Some(controller) = previous {
                controller.abort();
            }
        }

        let id = self.next_run.get() + 1;
        self.next_run.set(id);
        self.pending.set(Some(id));
        self.next_forced.set(options.force);
        self.next_background.set(options.background);

        let handle = self.add_waiter(id);
        self.kick.set(id);
        handle
    }

    /// Start run `run_id` with the future built by `build`.
    pub(crate) fn start(
        self: &Rc<Self>,
        run_id: u64,
        build: impl FnOnce(AbortSignal) -> FetchFuture<T>,
    ) {
        if self.disposed.get() || run_id <= self.cancelled_through.get() {
            return;
        }

        let controller = AbortController::new();
        if let Some(previous) = self.last_controller.replace(Some(controller.clone())) {
            previous.abort();
        }

        self.last_started.set(self.last_started.get().max(run_id));
        self.running.set(Some(run_id));
        self.fetch_count.set(self.fetch_count.get() + 1);

        if !self.next_background.replace(false) {
            self.loading.set(true);
        }
        self.fetching.set(true);
        self.error.set(None);

        tracing::debug!(run = run_id, "resource run started");

        let future = untrack(|| build(controller.signal()));
        let weak = Rc::downgrade(self);
        spawn_local(async move {
            let result = std::panic::AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(ReactiveError::from_panic("resource fetcher", payload))
                });

            if let Some(state) = weak.upgrade() {
                state.settle(run_id, &controller, result);
            }
        });
    }

    /// Resolve a requested run that turned out not to need a fetch.
    ///
    /// If another run is still in flight its settlement resolves the waiter.
    pub(crate) fn skip(&self, run_id: u64) {
        self.last_started.set(self.last_started.get().max(run_id));
        self.next_background.set(false);

        match self.running.get() {
            Some(active) => {
                let moved = self.waiters.borrow_mut().remove(&run_id);
                if let Some(moved) = moved {
                    self.waiters.borrow_mut().entry(active).or_default().extend(moved);
                }
                self.pending.set(Some(active));
            }
            None => {
                self.pending.set(None);
                self.resolve_through(run_id);
            }
        }
    }

    fn settle(&self, run_id: u64, controller: &AbortController, result: Result<T, ReactiveError>) {
        if controller.is_aborted() {
            tracing::debug!(run = run_id, "resource run aborted; result discarded");
            return;
        }

        let is_latest = self
            .last_controller
            .borrow()
            .as_ref()
            .is_some_and(|latest| latest.same_as(controller));
        if !is_latest {
            return;
        }

        match result {
            Ok(value) => {
                self.data.set(Some(value.clone()));
                if let Some(callback) = &self.on_success {
                    catch_and_report("resource on_success", || callback(&value));
                }
            }
            Err(err) if err.is_abort() => {
                tracing::debug!(run = run_id, "fetcher reported abort");
            }
            Err(err) => {
                tracing::debug!(run = run_id, error = %err, "resource run failed");
                self.error.set(Some(err.clone()));
                if let Some(callback) = &self.on_error {
                    catch_and_report("resource on_error", || callback(&err));
                }
            }
        }

        self.loading.set(false);
        self.fetching.set(false);
        self.running.set(None);
        if self.pending.get().is_some_and(|pending| pending <= run_id) {
            self.pending.set(None);
        }
        self.resolve_through(run_id);
    }

    pub(crate) fn cancel(&self) {
        let previous = self.last_controller.borrow().clone();
        if let Some(controller) = previous {
            controller.abort();
        }
        self.cancelled_through.set(self.next_run.get());
        self.pending.set(None);
        self.running.set(None);
        self.next_background.set(false);
        self.loading.set(false);
        self.fetching.set(false);
        self.resolve_all();
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        tracing::trace!("resource disposed");
        self.cancel();
        let driver = self.driver.borrow_mut().take();
        if let Some(driver) = driver {
            driver.dispose();
        }
    }
}

// =============================================================================
// RESOURCE<T> - The public handle
// =============================================================================

/// Async state driven by a fetcher. Cloning yields another handle to the same
/// resource.
///
/// # Example
///
/// ```
/// use spark_reactive::{create_resource, run_until_idle, ResourceOptions};
///
/// let user = create_resource(
///     |_abort| async { Ok::<_, spark_reactive::ReactiveError>(String::from("ada")) },
///     ResourceOptions::default(),
/// );
/// assert!(user.loading());
///
/// run_until_idle();
/// assert_eq!(user.data(), Some(String::from("ada")));
/// assert!(!user.loading());
/// ```
pub struct Resource<T> {
    pub(crate) state: Rc<ResourceState<T>>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Resource<T> {
    /// Latest successful value (tracked)
    pub fn data(&self) -> Option<T> {
        self.state.data.get()
    }

    /// Alias of [`Resource::data`]
    pub fn read(&self) -> Option<T> {
        self.data()
    }

    /// True while a foreground run is in flight (tracked)
    pub fn loading(&self) -> bool {
        self.state.loading.get()
    }

    /// True while any run is in flight (tracked)
    pub fn fetching(&self) -> bool {
        self.state.fetching.get()
    }

    /// Error of the latest settled run (tracked)
    pub fn error(&self) -> Option<ReactiveError> {
        self.state.error.get()
    }

    pub fn data_signal(&self) -> Signal<Option<T>> {
        self.state.data.clone()
    }

    pub fn loading_signal(&self) -> Signal<bool> {
        self.state.loading.clone()
    }

    pub fn fetching_signal(&self) -> Signal<bool> {
        self.state.fetching.clone()
    }

    pub fn error_signal(&self) -> Signal<Option<ReactiveError>> {
        self.state.error.clone()
    }

    /// Request a run, joining the in-flight one if there is one.
    pub fn refresh(&self) -> RefreshHandle {
        self.refresh_with(RefreshOptions::default())
    }

    pub fn refresh_with(&self, options: RefreshOptions) -> RefreshHandle {
        self.state.refresh(options)
    }

    /// Abort the in-flight run, clear the progress flags and resolve every
    /// waiter. `data` and `error` keep their values.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Overwrite `data` (optimistic updates)
    pub fn set_data(&self, value: Option<T>) {
        self.state.data.set(value);
    }

    pub fn set_error(&self, error: Option<ReactiveError>) {
        self.state.error.set(error);
    }

    /// Stop the resource for good. Scoped resources are disposed with their
    /// scope.
    pub fn dispose(&self) {
        self.state.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.get()
    }

    /// Number of runs started so far
    pub fn fetch_count(&self) -> u64 {
        self.state.fetch_count.get()
    }

    /// Whether both handles point at the same resource
    pub fn ptr_eq(&self, other: &Resource<T>) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl<T: std::fmt::Debug + Clone + 'static> std::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("data", &self.state.data.peek())
            .field("loading", &self.state.loading.peek())
            .field("error", &self.state.error.peek())
            .finish()
    }
}

// =============================================================================
// TYPE-ERASED HANDLE (cache storage)
// =============================================================================

/// What the cache needs from a resource without knowing its value type.
pub(crate) trait AnyResource {
    fn as_any(&self) -> &dyn Any;

    fn value_type(&self) -> &'static str;

    /// Forced background refresh
    fn revalidate(&self) -> RefreshHandle;

    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

impl<T: Clone + 'static> AnyResource for Resource<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn revalidate(&self) -> RefreshHandle {
        self.refresh_with(RefreshOptions::background())
    }

    fn dispose(&self) {
        Resource::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        Resource::is_disposed(self)
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

/// Create a resource and start its first run.
///
/// The fetcher receives the run's [`AbortSignal`] and is called untracked.
/// Inside a scope, disposing the scope aborts the run, stops the driver and
/// resolves every outstanding `refresh()` handle.
pub fn create_resource<T, F, Fut>(fetcher: F, options: ResourceOptions<T>) -> Resource<T>
where
    T: Clone + 'static,
    F: Fn(AbortSignal) -> Fut + 'static,
    Fut: Future<Output = Result<T, ReactiveError>> + 'static,
{
    let state = ResourceState::new(options);
    let kick = state.kick_signal();
    let weak: Weak<ResourceState<T>> = Rc::downgrade(&state);

    let driver = effect(move || {
        let kicked = kick.get();
        let Some(state) = weak.upgrade() else {
            return;
        };
        let run_id = state.claim(kicked);
        state.take_forced();
        state.start(run_id, |abort| fetcher(abort).boxed_local());
    });

    state.attach(driver);
    Resource { state }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::scope::{create_scope, with_scope};
    use crate::reactivity::scheduling::run_until_idle;
    use std::collections::VecDeque;

    /// Fetcher whose runs complete only when the test says so.
    #[derive(Clone, Default)]
    struct Gate {
        calls: Rc<Cell<u32>>,
        senders: Rc<RefCell<VecDeque<oneshot::Sender<Result<u32, ReactiveError>>>>>,
    }

    impl Gate {
        fn fetcher(&self) -> impl Fn(AbortSignal) -> FetchFuture<u32> + 'static {
            let gate = self.clone();
            move |_abort| {
                gate.calls.set(gate.calls.get() + 1);
                let (tx, rx) = oneshot::channel();
                gate.senders.borrow_mut().push_back(tx);
                async move { rx.await.unwrap_or(Err(ReactiveError::Aborted)) }.boxed_local()
            }
        }

        fn complete_oldest(&self, result: Result<u32, ReactiveError>) {
            let tx = self.senders.borrow_mut().pop_front().expect("a pending run");
            let _ = tx.send(result);
            run_until_idle();
        }
    }

    fn settled(handle: RefreshHandle) -> Rc<Cell<bool>> {
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        spawn_local(async move {
            handle.await;
            d.set(true);
        });
        run_until_idle();
        done
    }

    #[test]
    fn first_run_populates_data() {
        let gate = Gate::default();
        let resource = create_resource(gate.fetcher(), ResourceOptions::default());
        assert!(resource.loading());
        assert!(resource.fetching());
        assert_eq!(resource.data(), None);

        gate.complete_oldest(Ok(7));
        assert_eq!(resource.data(), Some(7));
        assert!(!resource.loading());
        assert!(!resource.fetching());
        assert_eq!(gate.calls.get(), 1);
    }

    #[test]
    fn concurrent_refreshes_share_one_fetch() {
        let gate = Gate::default();
        let resource = create_resource(gate.fetcher(), ResourceOptions::default());
        gate.complete_oldest(Ok(1));

        let first = settled(resource.refresh());
        let second = settled(resource.refresh());
        assert_eq!(gate.calls.get(), 2, "one initial run plus one refresh");
        assert!(!first.get() && !second.get());

        gate.complete_oldest(Ok(2));
        assert!(first.get() && second.get());
        assert_eq!(resource.data(), Some(2));
    }

    #[test]
    fn forced_refresh_discards_the_aborted_run() {
        let successes = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(Cell::new(0));
        let (s2, e2) = (successes.clone(), errors.clone());
        let options = ResourceOptions::default()
            .on_success(move |v: &u32| s2.borrow_mut().push(*v))
            .on_error(move |_| e2.set(e2.get() + 1));

        let gate = Gate::default();
        let resource = create_resource(gate.fetcher(), options);
        let waiter = settled(resource.refresh_with(RefreshOptions::forced()));
        assert_eq!(gate.calls.get(), 2);

        // The first run finishes late: ignored
        gate.complete_oldest(Ok(100));
        assert_eq!(resource.data(), None);
        assert!(successes.borrow().is_empty());
        assert!(resource.loading());
        assert!(!waiter.get());

        gate.complete_oldest(Err(ReactiveError::msg("boom")));
        assert_eq!(resource.error(), Some(ReactiveError::msg("boom")));
        assert_eq!(errors.get(), 1);
        assert!(successes.borrow().is_empty());
        assert!(waiter.get());
    }

    #[test]
    fn background_refresh_keeps_loading_false() {
        let gate = Gate::default();
        let resource = create_resource(gate.fetcher(), ResourceOptions::default().initial(0));
        assert_eq!(resource.data(), Some(0));
        gate.complete_oldest(Ok(1));

        let _ = resource.refresh_with(RefreshOptions::background());
        run_until_idle();
        assert!(!resource.loading());
        assert!(resource.fetching());
        assert_eq!(resource.data(), Some(1), "stale data stays visible");

        gate.complete_oldest(Ok(2));
        assert!(!resource.fetching());
        assert_eq!(resource.data(), Some(2));
    }

    #[test]
    fn cancel_resolves_waiters_and_keeps_data() {
        let gate = Gate::default();
        let resource = create_resource(gate.fetcher(), ResourceOptions::default());
        gate.complete_oldest(Ok(5));

        let waiter = settled(resource.refresh());
        resource.cancel();
        run_until_idle();
        assert!(waiter.get());
        assert!(!resource.loading());

        gate.complete_oldest(Ok(6));
        assert_eq!(resource.data(), Some(5));
    }

    #[test]
    fn scope_disposal_stops_everything() {
        let gate = Gate::default();
        let scope = create_scope();
        let resource =
            with_scope(&scope, || create_resource(gate.fetcher(), ResourceOptions::default()));

        let waiter = settled(resource.refresh());
        scope.dispose();
        run_until_idle();

        assert!(resource.is_disposed());
        assert!(waiter.get(), "no caller is left waiting");

        gate.complete_oldest(Ok(9));
        assert_eq!(resource.data(), None);

        let late = settled(resource.refresh());
        assert!(late.get());
        assert_eq!(gate.calls.get(), 1);
    }

    #[test]
    fn panicking_fetcher_becomes_error() {
        crate::core::error::set_effect_error_handler(Some(Rc::new(|_: &ReactiveError| {})));
        let resource = create_resource(
            |_abort| async {
                if true {
                    panic!("fetch exploded");
                }
                Ok(1u32)
            },
            ResourceOptions::default(),
        );
        run_until_idle();
        crate::core::error::set_effect_error_handler(None);

        assert!(matches!(
            resource.error(),
            Some(ReactiveError::Panicked { origin: "resource fetcher", .. })
        ));
        assert!(!resource.loading());
    }

    #[test]
    fn set_data_and_set_error_overwrite() {
        let resource = create_resource(|_abort| async { Ok(1u32) }, ResourceOptions::default());
        run_until_idle();
        resource.set_data(Some(10));
        resource.set_error(Some(ReactiveError::msg("manual")));
        assert_eq!(resource.data(), Some(10));
        assert_eq!(resource.error(), Some(ReactiveError::msg("manual")));
    }
}
