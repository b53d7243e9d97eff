// ============================================================================
// spark-reactive - Dependent Resource
// A resource whose fetch is gated by a dependency-change detector
// ============================================================================
//
// The driver reads the dependency getter (tracked) on every run. A fetch only
// happens when the dependencies differ from those of the last fetch, or when
// the refresh was forced. An unchanged rerun resolves its waiter without
// fetching, unless a fetch is still in flight, in which case the waiter is
// handed to that fetch.
// ============================================================================

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::FutureExt;

use crate::core::error::ReactiveError;
use crate::primitives::abort::AbortSignal;
use crate::primitives::effect::effect;
use crate::reactivity::equality::shallow_equals_slice;
use crate::resource::resource::{Resource, ResourceOptions, ResourceState};

/// How two dependency snapshots are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsMode {
    /// `PartialEq` on the whole value
    Value,
    /// Element-wise comparison of a slice view
    Shallow,
    /// Comparison of a caller-supplied key
    Keyed,
}

/// Dependency source of a dependent resource.
pub struct Deps<D> {
    get: Rc<dyn Fn() -> D>,
    same: Rc<dyn Fn(&D, &D) -> bool>,
    mode: DepsMode,
}

impl<D> Clone for Deps<D> {
    fn clone(&self) -> Self {
        Self {
            get: self.get.clone(),
            same: self.same.clone(),
            mode: self.mode,
        }
    }
}

impl<D: 'static> Deps<D> {
    /// Compare whole values with `PartialEq`.
    pub fn value(get: impl Fn() -> D + 'static) -> Self
    where
        D: PartialEq,
    {
        Self {
            get: Rc::new(get),
            same: Rc::new(|a: &D, b: &D| a == b),
            mode: DepsMode::Value,
        }
    }

    /// Compare element by element.
    pub fn shallow<E>(get: impl Fn() -> D + 'static) -> Self
    where
        D: AsRef<[E]>,
        E: PartialEq + 'static,
    {
        Self {
            get: Rc::new(get),
            same: Rc::new(|a: &D, b: &D| shallow_equals_slice(a.as_ref(), b.as_ref())),
            mode: DepsMode::Shallow,
        }
    }

    /// Compare the keys `key` derives from each snapshot.
    pub fn keyed(get: impl Fn() -> D + 'static, key: impl Fn(&D) -> String + 'static) -> Self {
        Self {
            get: Rc::new(get),
            same: Rc::new(move |a: &D, b: &D| key(a) == key(b)),
            mode: DepsMode::Keyed,
        }
    }

    pub fn mode(&self) -> DepsMode {
        self.mode
    }
}

/// Create a resource whose fetcher receives the current dependencies.
///
/// # Example
///
/// ```
/// use spark_reactive::{create_dependent_resource, run_until_idle, signal, Deps, ResourceOptions};
///
/// let user_id = signal(1u32);
/// let profile = create_dependent_resource(
///     Deps::value({
///         let user_id = user_id.clone();
///         move || user_id.get()
///     }),
///     |id, _abort| async move { Ok::<_, spark_reactive::ReactiveError>(format!("user-{id}")) },
///     ResourceOptions::default(),
/// );
/// run_until_idle();
/// assert_eq!(profile.data().as_deref(), Some("user-1"));
///
/// user_id.set(2);
/// run_until_idle();
/// assert_eq!(profile.data().as_deref(), Some("user-2"));
/// ```
pub fn create_dependent_resource<D, T, F, Fut>(
    deps: Deps<D>,
    fetcher: F,
    options: ResourceOptions<T>,
) -> Resource<T>
where
    D: Clone + 'static,
    T: Clone + 'static,
    F: Fn(D, AbortSignal) -> Fut + 'static,
    Fut: Future<Output = Result<T, ReactiveError>> + 'static,
{
    let state = ResourceState::new(options);
    let kick = state.kick_signal();
    let weak: Weak<ResourceState<T>> = Rc::downgrade(&state);
    let last: RefCell<Option<D>> = RefCell::new(None);

    let driver = effect(move || {
        let kicked = kick.get();
        let current = (deps.get)();
        let Some(state) = weak.upgrade() else {
            return;
        };

        let forced = state.take_forced();
        let changed = last
            .borrow()
            .as_ref()
            .is_none_or(|previous| !(deps.same)(previous, &current));
        let run_id = state.claim(kicked);

        if changed || forced {
            *last.borrow_mut() = Some(current.clone());
            state.start(run_id, |abort| fetcher(current, abort).boxed_local());
        } else {
            let mode = deps.mode;
            tracing::trace!(run = run_id, ?mode, "dependencies unchanged; fetch skipped");
            state.skip(run_id);
        }
    });

    state.attach(driver);
    Resource { state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::never_equals;
    use crate::primitives::signal::{signal, signal_with_equals};
    use crate::reactivity::scheduling::{run_until_idle, spawn_local};
    use crate::resource::resource::RefreshOptions;
    use futures::channel::oneshot;
    use std::cell::Cell;
    use std::collections::VecDeque;

    type Senders = Rc<RefCell<VecDeque<oneshot::Sender<Result<String, ReactiveError>>>>>;

    fn gated() -> (Senders, Rc<RefCell<Vec<u32>>>) {
        (Rc::default(), Rc::default())
    }

    #[test]
    fn fetches_again_only_when_deps_change() {
        let id = signal(1u32);
        let calls = Rc::new(RefCell::new(Vec::new()));

        let calls2 = calls.clone();
        let id2 = id.clone();
        let resource = create_dependent_resource(
            Deps::value(move || id2.get()),
            move |id, _abort| {
                calls2.borrow_mut().push(id);
                async move { Ok(id * 10) }
            },
            ResourceOptions::default(),
        );
        run_until_idle();
        assert_eq!(resource.data(), Some(10));

        id.set(2);
        run_until_idle();
        assert_eq!(resource.data(), Some(20));

        // Same deps: the waiter resolves without a fetch
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let handle = resource.refresh();
        spawn_local(async move {
            handle.await;
            d.set(true);
        });
        run_until_idle();
        assert!(done.get());
        assert_eq!(*calls.borrow(), vec![1, 2]);

        // Forced refresh fetches even with unchanged deps
        let _ = resource.refresh_with(RefreshOptions::forced());
        run_until_idle();
        assert_eq!(*calls.borrow(), vec![1, 2, 2]);
    }

    #[test]
    fn unchanged_refresh_waits_for_in_flight_fetch() {
        let (senders, calls) = gated();
        let id = signal_with_equals(1u32, never_equals);

        let (s2, c2, id2) = (senders.clone(), calls.clone(), id.clone());
        let resource = create_dependent_resource(
            Deps::value(move || id2.get()),
            move |id, _abort| {
                c2.borrow_mut().push(id);
                let (tx, rx) = oneshot::channel();
                s2.borrow_mut().push_back(tx);
                async move { rx.await.unwrap_or(Err(ReactiveError::Aborted)) }
            },
            ResourceOptions::default(),
        );

        // A rerun with identical deps while the first fetch is pending does
        // not fetch; a refresh made meanwhile settles with that fetch.
        id.set(1);
        run_until_idle();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let handle = resource.refresh();
        spawn_local(async move {
            handle.await;
            d.set(true);
        });
        run_until_idle();
        assert_eq!(*calls.borrow(), vec![1]);
        assert!(!done.get());

        let tx = senders.borrow_mut().pop_front().expect("pending fetch");
        let _ = tx.send(Ok(String::from("one")));
        run_until_idle();
        assert!(done.get());
        assert_eq!(resource.data().as_deref(), Some("one"));
    }

    #[test]
    fn shallow_mode_ignores_equal_contents() {
        let list = signal_with_equals(vec![1, 2, 3], never_equals);
        let calls = Rc::new(Cell::new(0));

        let (list2, c2) = (list.clone(), calls.clone());
        let resource = create_dependent_resource(
            Deps::shallow::<i32>(move || list2.get()),
            move |items: Vec<i32>, _abort| {
                c2.set(c2.get() + 1);
                async move { Ok(items.iter().sum::<i32>()) }
            },
            ResourceOptions::default(),
        );
        run_until_idle();
        assert_eq!(resource.data(), Some(6));

        list.set(vec![1, 2, 3]);
        run_until_idle();
        assert_eq!(calls.get(), 1, "same elements, no fetch");

        list.set(vec![1, 2, 3, 4]);
        run_until_idle();
        assert_eq!(calls.get(), 2);
        assert_eq!(resource.data(), Some(10));
    }

    #[test]
    fn keyed_mode_compares_keys() {
        #[derive(Clone)]
        #[allow(dead_code)]
        struct Filter {
            page: u32,
            cursor: u64,
        }

        let filter = signal_with_equals(Filter { page: 1, cursor: 0 }, never_equals);
        let calls = Rc::new(Cell::new(0));

        let (f2, c2) = (filter.clone(), calls.clone());
        let deps = Deps::keyed(move || f2.get(), |f: &Filter| format!("page:{}", f.page));
        assert_eq!(deps.mode(), DepsMode::Keyed);

        let _resource = create_dependent_resource(
            deps,
            move |f: Filter, _abort| {
                c2.set(c2.get() + 1);
                async move { Ok(f.page) }
            },
            ResourceOptions::default(),
        );
        run_until_idle();

        filter.set(Filter { page: 1, cursor: 99 });
        run_until_idle();
        assert_eq!(calls.get(), 1);

        filter.set(Filter { page: 2, cursor: 0 });
        run_until_idle();
        assert_eq!(calls.get(), 2);
    }
}
