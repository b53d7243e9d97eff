// ============================================================================
// spark-reactive - Constants
// Flag bits for reactive graph nodes and scheduler defaults
// ============================================================================

// =============================================================================
// NODE TYPE FLAGS
// =============================================================================

/// Plain writable source (signal)
pub const SOURCE: u32 = 1 << 0;

/// Lazily evaluated derived value (its invalidator is also a reaction)
pub const COMPUTED: u32 = 1 << 1;

/// Re-run unit tied to a user callback
pub const EFFECT: u32 = 1 << 2;

/// Reaction runs immediately when triggered instead of being queued.
/// Only computed invalidators carry this flag.
pub const SYNC: u32 = 1 << 3;

// =============================================================================
// NODE STATE FLAGS
// =============================================================================

/// Effect is already sitting in a queue for the current tick
pub const QUEUED: u32 = 1 << 10;

/// Terminal state - scheduling and execution become no-ops
pub const DISPOSED: u32 = 1 << 11;

/// Computed value must be re-evaluated before the next read
pub const DIRTY: u32 = 1 << 12;

/// Reaction is currently executing
pub const RUNNING: u32 = 1 << 13;

// =============================================================================
// SCHEDULER DEFAULTS
// =============================================================================

/// Flush passes allowed for the microtask queue before the remainder is dropped
pub const DEFAULT_MAX_MICROTASK_ITERATIONS: usize = 1000;

/// Flush passes allowed for the animation-frame queue
pub const DEFAULT_MAX_RAF_ITERATIONS: usize = 100;

// =============================================================================
// CACHE DEFAULTS
// =============================================================================

/// Default upper bound on cache entries before LRU eviction kicks in
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;
