// ============================================================================
// spark-reactive - Batching
// Group multiple writes into one frame-aligned notification flush
// ============================================================================

use crate::core::context::with_context;
use crate::reactivity::scheduling::flush_batch_queue;

// =============================================================================
// BATCH
// =============================================================================

/// Batch multiple signal writes into a single frame-aligned flush.
///
/// Writes inside the batch take effect immediately (reads see them), but the
/// effects they trigger are collected in the batch queue. When the outermost
/// batch exits, everything queued runs in one animation-frame task, so an
/// effect reading several written signals re-runs once.
///
/// # Example
///
/// ```
/// use spark_reactive::{batch, effect, run_until_idle, signal};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = signal(1);
/// let b = signal(2);
/// let run_count = Rc::new(Cell::new(0));
///
/// let run_count_clone = run_count.clone();
/// let a_clone = a.clone();
/// let b_clone = b.clone();
/// let _effect = effect(move || {
///     let _ = a_clone.get() + b_clone.get();
///     run_count_clone.set(run_count_clone.get() + 1);
/// });
/// assert_eq!(run_count.get(), 1);
///
/// batch(|| {
///     a.set(10);
///     b.set(20);
/// });
///
/// run_until_idle();
/// assert_eq!(run_count.get(), 2);
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    with_context(|ctx| ctx.enter_batch());

    // Use a guard pattern to ensure we exit the batch even on panic
    struct BatchGuard;

    impl Drop for BatchGuard {
        fn drop(&mut self) {
            let depth = with_context(|ctx| ctx.exit_batch());

            // When outermost batch completes, hand the queue to one frame
            if depth == 0 {
                flush_batch_queue();
            }
        }
    }

    let _guard = BatchGuard;
    f()
}

/// Check if currently inside a batch.
///
/// # Example
///
/// ```
/// use spark_reactive::{batch, is_batching};
///
/// assert!(!is_batching());
/// batch(|| assert!(is_batching()));
/// assert!(!is_batching());
/// ```
pub fn is_batching() -> bool {
    with_context(|ctx| ctx.is_batching())
}

// =============================================================================
// UNTRACK
// =============================================================================

/// Read signals without creating dependencies.
///
/// # Example
///
/// ```
/// use spark_reactive::{effect, flush_microtasks, signal, untrack};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = signal(1);
/// let b = signal(2);
/// let run_count = Rc::new(Cell::new(0));
///
/// let (a2, b2, runs) = (a.clone(), b.clone(), run_count.clone());
/// let _effect = effect(move || {
///     let _ = a2.get();
///     let _ = untrack(|| b2.get());
///     runs.set(runs.get() + 1);
/// });
///
/// b.set(20);
/// flush_microtasks();
/// assert_eq!(run_count.get(), 1);
///
/// a.set(10);
/// flush_microtasks();
/// assert_eq!(run_count.get(), 2);
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_context(|ctx| ctx.set_untracking(true));

    // Use a guard pattern to ensure we restore even on panic
    struct UntrackGuard {
        prev: bool,
    }

    impl Drop for UntrackGuard {
        fn drop(&mut self) {
            with_context(|ctx| ctx.set_untracking(self.prev));
        }
    }

    let _guard = UntrackGuard { prev };
    f()
}

/// Alias for `untrack()`.
pub fn peek<T>(f: impl FnOnce() -> T) -> T {
    untrack(f)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactivity::scheduling::{flush_animation_frame, flush_microtasks, run_until_idle};
    use crate::{computed, effect, signal};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn batch_defers_effects_to_one_frame() {
        let a = signal(1);
        let b = signal(2);
        let run_count = Rc::new(Cell::new(0));

        let run_count_clone = run_count.clone();
        let a_clone = a.clone();
        let b_clone = b.clone();
        let _effect = effect(move || {
            let _ = a_clone.get() + b_clone.get();
            run_count_clone.set(run_count_clone.get() + 1);
        });
        assert_eq!(run_count.get(), 1);

        batch(|| {
            a.set(10);
            b.set(20);
            assert_eq!(a.get() + b.get(), 30, "writes are visible immediately");
        });

        // Not a microtask: the batch flush waits for the frame
        flush_microtasks();
        assert_eq!(run_count.get(), 1);

        flush_animation_frame();
        assert_eq!(run_count.get(), 2);
    }

    #[test]
    fn batch_returns_value() {
        assert_eq!(batch(|| 42), 42);
        assert_eq!(batch(|| String::from("hello")), "hello");
    }

    #[test]
    fn nested_batches_flush_once() {
        let a = signal(0);
        let run_count = Rc::new(Cell::new(0));

        let run_count_clone = run_count.clone();
        let a_clone = a.clone();
        let _effect = effect(move || {
            let _ = a_clone.get();
            run_count_clone.set(run_count_clone.get() + 1);
        });

        batch(|| {
            a.set(1);
            batch(|| {
                a.set(2);
                a.set(3);
            });
            run_until_idle();
            assert_eq!(run_count.get(), 1, "inner batch exit does not flush");
            a.set(4);
        });

        run_until_idle();
        assert_eq!(run_count.get(), 2);
        assert_eq!(a.get(), 4);
    }

    #[test]
    fn computed_stays_consistent_inside_batch() {
        let a = signal(1);
        let doubled = computed({
            let a = a.clone();
            move || a.get() * 2
        });

        batch(|| {
            a.set(5);
            assert_eq!(doubled.get(), 10);
        });
    }

    #[test]
    fn is_batching_flag() {
        assert!(!is_batching());
        batch(|| {
            assert!(is_batching());
            batch(|| assert!(is_batching()));
            assert!(is_batching());
        });
        assert!(!is_batching());
    }

    #[test]
    fn untrack_restores_after_panic() {
        let result = std::panic::catch_unwind(|| untrack(|| -> i32 { panic!("inside untrack") }));
        assert!(result.is_err());
        assert!(!crate::core::context::is_untracking());
    }
}
