// ============================================================================
// spark-reactive - Abort Controller
// Advisory cancellation for async effect runs, resource fetches and mutations
// ============================================================================
//
// Aborting never preempts a future. It flips a flag, runs registered
// callbacks and wakes anyone awaiting `aborted()`. Async code is expected to
// check `is_aborted()` (or use `wrap`) before committing results.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;

use crate::core::error::{catch_and_report, ReactiveError};

#[derive(Default)]
struct AbortState {
    aborted: Cell<bool>,
    callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
    wakers: RefCell<Vec<Waker>>,
}

/// Owner side: the only thing that can trigger an abort.
#[derive(Clone, Default)]
pub struct AbortController {
    state: Rc<AbortState>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The observer side, handed to the async work.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            state: self.state.clone(),
        }
    }

    /// Abort. Idempotent; callbacks run once, in registration order.
    pub fn abort(&self) {
        if self.state.aborted.replace(true) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.state.callbacks.borrow_mut());
        for callback in callbacks {
            catch_and_report("abort callback", callback);
        }

        let wakers = std::mem::take(&mut *self.state.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.get()
    }

    /// Whether both handles control the same abort state
    pub fn same_as(&self, other: &AbortController) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for AbortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Observer side of an [`AbortController`].
#[derive(Clone)]
pub struct AbortSignal {
    state: Rc<AbortState>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.get()
    }

    /// `Err(ReactiveError::Aborted)` once aborted.
    pub fn throw_if_aborted(&self) -> Result<(), ReactiveError> {
        if self.is_aborted() {
            Err(ReactiveError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Run `callback` on abort, or right away if already aborted.
    pub fn on_abort(&self, callback: impl FnOnce() + 'static) {
        if self.is_aborted() {
            catch_and_report("abort callback", callback);
            return;
        }
        self.state.callbacks.borrow_mut().push(Box::new(callback));
    }

    /// Future that resolves once aborted.
    pub fn aborted(&self) -> Aborted {
        Aborted {
            state: self.state.clone(),
        }
    }

    /// Race `future` against this signal: an abort drops the future and
    /// yields `Err(ReactiveError::Aborted)`.
    pub fn wrap<F>(
        &self,
        future: F,
    ) -> impl Future<Output = Result<F::Output, ReactiveError>> + use<F>
    where
        F: Future,
    {
        let (handle, registration) = AbortHandle::new_pair();
        if self.is_aborted() {
            handle.abort();
        } else {
            self.on_abort(move || handle.abort());
        }
        Abortable::new(future, registration)
            .map(|result| result.map_err(|_| ReactiveError::Aborted))
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Future returned by [`AbortSignal::aborted`].
pub struct Aborted {
    state: Rc<AbortState>,
}

impl Future for Aborted {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.aborted.get() {
            return Poll::Ready(());
        }
        let mut wakers = self.state.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactivity::scheduling::{run_until_idle, spawn_local};
    use futures::channel::oneshot;

    #[test]
    fn abort_runs_callbacks_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        signal.on_abort(move || c.set(c.get() + 1));
        assert!(signal.throw_if_aborted().is_ok());

        controller.abort();
        controller.abort();
        assert_eq!(count.get(), 1);
        assert!(signal.is_aborted());
        assert_eq!(signal.throw_if_aborted(), Err(ReactiveError::Aborted));

        // Late registration fires immediately
        let c = count.clone();
        signal.on_abort(move || c.set(c.get() + 10));
        assert_eq!(count.get(), 11);
    }

    #[test]
    fn aborted_future_wakes() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let done = Rc::new(Cell::new(false));

        let d = done.clone();
        spawn_local(async move {
            signal.aborted().await;
            d.set(true);
        });
        run_until_idle();
        assert!(!done.get());

        controller.abort();
        run_until_idle();
        assert!(done.get());
    }

    #[test]
    fn wrap_drops_the_future_on_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let (_tx, rx) = oneshot::channel::<u32>();
        let result = Rc::new(RefCell::new(None));

        let r = result.clone();
        spawn_local(async move {
            let outcome = signal.wrap(rx).await;
            *r.borrow_mut() = Some(outcome.map(|inner| inner.ok()));
        });
        run_until_idle();
        assert!(result.borrow().is_none());

        controller.abort();
        run_until_idle();
        assert_eq!(*result.borrow(), Some(Err(ReactiveError::Aborted)));
    }
}
