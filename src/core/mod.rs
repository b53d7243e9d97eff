// ============================================================================
// spark-reactive - Core Module
// Fundamental types, traits, errors and context for the reactive system
// ============================================================================

pub mod constants;
pub mod context;
pub mod error;
pub mod types;

// Re-export commonly used items
pub use constants::*;
pub use context::{is_batching, is_tracking, is_untracking, with_context, ReactiveContext};
pub use error::{report_error, set_effect_error_handler, ErrorHandler, ReactiveError};
pub use types::{
    default_equals, never_equals, AnyReaction, AnySource, EqualsFn, NodeId, SourceInner,
    Subscribers,
};
