// ============================================================================
// spark-reactive - Equality Functions
// Change detection predicates for signals and dependency lists
// ============================================================================

use crate::core::types::EqualsFn;

// =============================================================================
// SAME-VALUE EQUALITY (floats)
// =============================================================================

/// Same-value equality for f64: NaN equals NaN, and 0.0 differs from -0.0.
///
/// `PartialEq` would report every NaN write as a change, so a signal holding
/// NaN would notify forever.
///
/// ```
/// use spark_reactive::reactivity::equality::same_value_f64;
///
/// assert!(same_value_f64(&f64::NAN, &f64::NAN));
/// assert!(!same_value_f64(&0.0, &-0.0));
/// assert!(same_value_f64(&1.5, &1.5));
/// ```
pub fn same_value_f64(a: &f64, b: &f64) -> bool {
    if a.is_nan() {
        return b.is_nan();
    }
    a.to_bits() == b.to_bits()
}

/// Same-value equality for f32.
pub fn same_value_f32(a: &f32, b: &f32) -> bool {
    if a.is_nan() {
        return b.is_nan();
    }
    a.to_bits() == b.to_bits()
}

/// Ready-made [`EqualsFn`] for `f64` signals.
pub fn same_value_f64_fn() -> EqualsFn<f64> {
    same_value_f64
}

// =============================================================================
// SHALLOW EQUALITY
// =============================================================================

/// Element-wise comparison of two slices.
pub fn shallow_equals_slice<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::signal::signal_with_equals;

    #[test]
    fn same_value_handles_nan_and_signed_zero() {
        assert!(same_value_f64(&f64::NAN, &f64::NAN));
        assert!(!same_value_f64(&f64::NAN, &1.0));
        assert!(!same_value_f64(&1.0, &f64::NAN));
        assert!(!same_value_f64(&0.0, &-0.0));
        assert!(same_value_f64(&f64::INFINITY, &f64::INFINITY));

        assert!(same_value_f32(&f32::NAN, &f32::NAN));
        assert!(!same_value_f32(&0.0f32, &-0.0f32));
    }

    #[test]
    fn nan_signal_does_not_renotify() {
        let s = signal_with_equals(f64::NAN, same_value_f64_fn());
        assert!(!s.set(f64::NAN));
        assert!(s.set(1.0));
    }

    #[test]
    fn shallow_slices() {
        assert!(shallow_equals_slice(&[1, 2, 3], &[1, 2, 3]));
        assert!(!shallow_equals_slice(&[1, 2, 3], &[1, 2, 4]));
        assert!(!shallow_equals_slice(&[1, 2], &[1, 2, 3]));
        assert!(shallow_equals_slice::<i32>(&[], &[]));
    }
}
