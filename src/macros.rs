// ============================================================================
// spark-reactive - Ergonomic Macros
// ============================================================================

/// Clone variables into a move closure.
///
/// Handles (`Signal`, `Computed`, `Resource`, `Rc`) are cheap to clone, and
/// every closure handed to the runtime needs its own copies.
///
/// # Usage
///
/// ```rust
/// use spark_reactive::{cloned, computed, signal};
///
/// let a = signal(1);
/// let b = signal(2);
///
/// let sum = computed(cloned!(a, b => move || a.get() + b.get()));
/// assert_eq!(sum.get(), 3);
/// a.set(10); // `a` is still usable here
/// ```
#[macro_export]
macro_rules! cloned {
    ($($n:ident),+ => $e:expr) => {
        {
            $( let $n = $n.clone(); )+
            $e
        }
    };
}

/// Create a computed value with automatic variable capturing.
///
/// Wraps `computed(cloned!(... => move || ...))`.
///
/// # Usage
///
/// ```rust
/// use spark_reactive::{computed, signal};
///
/// let a = signal(1);
/// let b = signal(2);
///
/// let sum = computed!(a, b => a.get() + b.get());
/// b.set(5);
/// assert_eq!(sum.get(), 6);
/// ```
#[macro_export]
macro_rules! computed {
    // With dependencies
    ($($deps:ident),+ => $body:expr) => {
        $crate::computed($crate::cloned!($($deps),+ => move || $body))
    };
    // No dependencies
    ($body:expr) => {
        $crate::computed(move || $body)
    };
}

/// Create an effect with automatic variable capturing.
///
/// Wraps `effect(cloned!(... => move || ...))`.
///
/// # Usage
///
/// ```rust
/// use spark_reactive::{effect, flush_microtasks, signal};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let count = signal(0);
/// let seen = Rc::new(Cell::new(0));
///
/// let _fx = effect!(count, seen => seen.set(count.get()));
/// count.set(3);
/// flush_microtasks();
/// assert_eq!(seen.get(), 3);
/// ```
#[macro_export]
macro_rules! effect {
    // With dependencies
    ($($deps:ident),+ => $body:expr) => {
        $crate::effect($crate::cloned!($($deps),+ => move || { $body; }))
    };
    // No dependencies
    ($body:expr) => {
        $crate::effect(move || { $body; })
    };
}
