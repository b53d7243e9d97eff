// ============================================================================
// spark-reactive - Reactivity Module
// Dependency tracking, batching and the host scheduler
// ============================================================================

pub mod batching;
pub mod equality;
pub mod scheduling;
pub mod tracking;

// Re-export main tracking functions
pub use tracking::{notify_write, track_read, unsubscribe_all};

// Re-export scheduling functions
pub use scheduling::{
    advance_time, clear_timeout, configure_scheduler, flush_animation_frame, flush_microtasks,
    has_pending_tasks, now, poll_futures, queue_in_batch, run_until_idle, schedule,
    schedule_microtask, scheduler_config, set_timeout, sleep, spawn_local, use_manual_clock,
    BatchTask, SchedulerConfig, Sleep, Task, TimerId,
};

// Re-export equality helpers
pub use equality::{same_value_f32, same_value_f64, shallow_equals_slice};

// Re-export batching functions
pub use batching::{batch, is_batching, peek, untrack};
