// ============================================================================
// spark-reactive - A Fine-Grained Reactive Runtime for Rust
// ============================================================================
//
// Signals, computed values and effects on a single-threaded graph, owned by
// scopes and driven by a host scheduler (microtask, animation-frame and batch
// queues). On top of it: cancellation-safe async resources, a keyed resource
// cache and a query/mutation client.
// ============================================================================

//! # spark-reactive
//!
//! A fine-grained reactive runtime.
//!
//! ```
//! use spark_reactive::{computed, effect, flush_microtasks, signal};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let count = signal(1);
//! let doubled = computed({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! let seen = Rc::new(Cell::new(0));
//! let _fx = effect({
//!     let (doubled, seen) = (doubled.clone(), seen.clone());
//!     move || seen.set(doubled.get())
//! });
//! assert_eq!(seen.get(), 2);
//!
//! count.set(5);
//! assert_eq!(doubled.get(), 10); // computed values are consistent at once
//! flush_microtasks();            // effects re-run on the next microtask
//! assert_eq!(seen.get(), 10);
//! ```
//!
//! Nothing runs in the background: the embedder drives the runtime with
//! [`flush_microtasks`], [`flush_animation_frame`] or [`run_until_idle`].

pub mod core;
pub mod primitives;
pub mod query;
pub mod reactivity;
pub mod resource;

mod macros;

// Re-export core items at crate root
pub use core::constants;
pub use core::context::{is_tracking, is_untracking, with_context, ReactiveContext};
pub use core::error::{report_error, set_effect_error_handler, ErrorHandler, ReactiveError};
pub use core::types::{default_equals, never_equals, AnyReaction, AnySource, EqualsFn, NodeId};

// Primitives
pub use primitives::abort::{AbortController, AbortSignal};
pub use primitives::computed::{computed, Computed};
pub use primitives::effect::{effect, effect_async, effect_with_cleanup, CleanupFn, Effect};
pub use primitives::scope::{
    create_scope, get_current_scope, on_cleanup, with_scope, Scope, WeakScope,
};
pub use primitives::signal::{signal, signal_with_equals, Signal, Writable};

// Scheduling and batching
pub use reactivity::batching::{batch, is_batching, peek, untrack};
pub use reactivity::equality::{same_value_f64, shallow_equals_slice};
pub use reactivity::scheduling::{
    advance_time, clear_timeout, configure_scheduler, flush_animation_frame, flush_microtasks,
    now, queue_in_batch, run_until_idle, schedule, schedule_microtask, set_timeout, sleep,
    spawn_local, use_manual_clock, SchedulerConfig, TimerId,
};

// Resources
pub use resource::{
    create_dependent_resource, create_resource, Deps, DepsMode, RefreshHandle, RefreshOptions,
    Resource, ResourceOptions,
};

// Query layer
pub use query::{
    cached_resource, configure_resource_cache, create_mutation, create_query_client, CacheConfig,
    CacheOptions, Mutation, MutationOptions, Query, QueryClient, QueryKey, QueryOptions,
};

// =============================================================================
// TESTS
// =============================================================================
