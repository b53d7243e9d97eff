// ============================================================================
// spark-reactive - Query Module
// Keyed resource cache, reactive queries and mutations
// ============================================================================

pub mod cache;
pub mod client;
pub mod key;
pub mod mutation;

pub use cache::{
    cached_resource, configure_resource_cache, resource_cache_config, CacheConfig, CacheEntryInfo,
    CacheOptions,
};
pub use client::{create_query_client, Query, QueryClient, QueryDefaults, QueryOptions};
pub use key::QueryKey;
pub use mutation::{create_mutation, Mutation, MutationFuture, MutationOptions};
