// ============================================================================
// spark-reactive - Primitives Module
// Core reactive primitives: scope, signal, computed, effect, abort
// ============================================================================

pub mod abort;
pub mod computed;
pub mod effect;
pub mod scope;
pub mod signal;

// Re-export for convenience
pub use abort::{AbortController, AbortSignal, Aborted};
pub use computed::{computed, Computed, ComputedInner};
pub use effect::{
    destroy_effect, effect, effect_async, effect_with_cleanup, update_effect, CleanupFn, Effect,
    EffectFn, EffectInner,
};
pub use scope::{
    create_scope, get_current_scope, on_cleanup, with_scope, Scope, ScopeCleanupFn, WeakScope,
};
pub use signal::{signal, signal_with_equals, Signal, Writable};
