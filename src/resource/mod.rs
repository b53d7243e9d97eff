// ============================================================================
// spark-reactive - Resource Module
// Async state with cancellation-safe refresh
// ============================================================================

pub mod dependent;
pub mod resource;

pub use dependent::{create_dependent_resource, Deps, DepsMode};
pub use resource::{
    create_resource, ErrorCallback, FetchFuture, RefreshHandle, RefreshOptions, Resource,
    ResourceOptions, SuccessCallback,
};
