// ============================================================================
// spark-reactive - Errors
// One error type for user callback failures, aborts and contract violations
// ============================================================================

use std::any::Any;
use std::fmt::Display;

use thiserror::Error;

use super::context::with_context;

/// Errors produced or routed by the reactive runtime.
///
/// The type is `Clone` so it can be stored in an `error` signal and handed to
/// several observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A run was cancelled through its `AbortSignal`.
    #[error("AbortError: the operation was aborted")]
    Aborted,

    /// Failure reported by user code (fetchers, mutation functions).
    #[error("{0}")]
    Message(String),

    /// A panic caught at a runtime boundary.
    #[error("panic in {origin}: {message}")]
    Panicked {
        origin: &'static str,
        message: String,
    },

    /// Attempt to write a computed value.
    #[error("computed values are read-only")]
    ReadOnly,

    /// A cache key is already bound to a resource of another value type.
    #[error("cache key `{key}` is already bound to a resource of a different type")]
    KeyTypeMismatch { key: String },

    /// A query key could not be serialized.
    #[error("failed to encode query key: {0}")]
    KeyEncoding(String),

    /// One or more scope cleanups failed during disposal.
    #[error("{} scope cleanup(s) failed", .0.len())]
    CleanupFailed(Vec<ReactiveError>),

    /// A scheduler queue kept refilling itself past its iteration cap.
    #[error("{queue} queue exceeded {limit} flush iterations; remaining tasks discarded")]
    IterationLimit { queue: &'static str, limit: usize },
}

impl ReactiveError {
    /// Build a user-facing error from anything printable.
    pub fn msg(message: impl Display) -> Self {
        ReactiveError::Message(message.to_string())
    }

    /// Normalize an arbitrary error into a `ReactiveError`.
    pub fn from_error(err: impl std::error::Error) -> Self {
        ReactiveError::Message(err.to_string())
    }

    /// Normalize a panic payload captured by `catch_unwind`.
    pub fn from_panic(origin: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("non-string panic payload")
        };
        ReactiveError::Panicked { origin, message }
    }

    /// Whether this is the named abort error.
    pub fn is_abort(&self) -> bool {
        matches!(self, ReactiveError::Aborted)
    }
}

// =============================================================================
// ERROR ROUTING
// =============================================================================

/// Global handler for errors that escape effects, cleanups and scheduled tasks.
pub type ErrorHandler = std::rc::Rc<dyn Fn(&ReactiveError)>;

/// Install (or remove, with `None`) the global effect error handler.
///
/// Without a handler, errors are logged with `tracing::error!`.
pub fn set_effect_error_handler(handler: Option<ErrorHandler>) {
    with_context(|ctx| {
        *ctx.error_handler.borrow_mut() = handler;
    });
}

/// Route an error to the global handler, or log it.
///
/// Never panics and never propagates: the reactive graph keeps running.
pub fn report_error(err: ReactiveError) {
    let handler = with_context(|ctx| ctx.error_handler.borrow().clone());
    match handler {
        Some(handler) => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&err)));
            if result.is_err() {
                tracing::error!(error = %err, "effect error handler panicked");
            }
        }
        None => tracing::error!(error = %err, "unhandled reactive error"),
    }
}

/// Run `f`, converting a panic into a reported error. Returns `None` on panic.
pub(crate) fn catch_and_report<R>(origin: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            report_error(ReactiveError::from_panic(origin, payload));
            None
        }
    }
}
