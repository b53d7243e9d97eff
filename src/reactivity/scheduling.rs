// ============================================================================
// spark-reactive - Scheduler
// FIFO microtask, animation-frame and batch queues plus the host driver
// ============================================================================
//
// There is no ambient event loop in Rust, so the scheduler models one:
//
// - schedule()            -> RAF queue, arms one pending "frame" callback
// - schedule_microtask()  -> microtask queue, arms one pending hop
// - queue_in_batch()      -> batch queue, deduped by task identity, flushed as
//                            a single RAF task when the outermost batch exits
//
// The embedder plays the host: flush_microtasks() is the resolved-promise hop,
// flush_animation_frame() is the frame (or setTimeout(0) fallback), and
// run_until_idle() drains microtasks before frames, fires due timers and polls
// spawned futures until nothing is left to do.
//
// Each flush drains its queue a whole pass at a time, so a task that enqueues
// more work causes another pass rather than growing the current one. Passes
// are capped; overrunning the cap logs an error and discards the remainder,
// which is what stops reactive feedback loops from spinning forever.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use futures::FutureExt;

use crate::core::constants::{DEFAULT_MAX_MICROTASK_ITERATIONS, DEFAULT_MAX_RAF_ITERATIONS};
use crate::core::context::with_context;
use crate::core::error::{catch_and_report, report_error, ReactiveError};

// =============================================================================
// TYPES
// =============================================================================

/// A one-shot unit of scheduled work
pub type Task = Box<dyn FnOnce()>;

/// A batch task. Identity (the `Rc` allocation) is what dedupes it.
pub type BatchTask = Rc<dyn Fn()>;

/// Handle returned by [`set_timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Iteration caps for the flush loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Passes over the microtask queue per flush
    pub max_microtask_iterations: usize,
    /// Passes over the animation-frame queue per flush
    pub max_raf_iterations: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_microtask_iterations: DEFAULT_MAX_MICROTASK_ITERATIONS,
            max_raf_iterations: DEFAULT_MAX_RAF_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    System { origin: Instant },
    Manual { now: Duration },
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::System { origin } => origin.elapsed(),
            Clock::Manual { now } => *now,
        }
    }
}

#[derive(Clone, Copy)]
enum QueueKind {
    Microtask,
    AnimationFrame,
}

impl QueueKind {
    fn name(self) -> &'static str {
        match self {
            QueueKind::Microtask => "microtask",
            QueueKind::AnimationFrame => "animation-frame",
        }
    }
}

// =============================================================================
// SCHEDULER STATE
// =============================================================================

struct Scheduler {
    config: Cell<SchedulerConfig>,

    raf_queue: RefCell<Vec<Task>>,
    raf_armed: Cell<bool>,

    microtask_queue: RefCell<Vec<Task>>,
    microtask_armed: Cell<bool>,

    batch_queue: RefCell<Vec<BatchTask>>,
    batch_seen: RefCell<HashSet<*const ()>>,

    clock: Cell<Clock>,
    timers: RefCell<BTreeMap<(Duration, u64), Task>>,
    timer_deadlines: RefCell<HashMap<u64, Duration>>,
    next_timer: Cell<u64>,

    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    driving: Cell<bool>,
}

impl Scheduler {
    fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            config: Cell::new(SchedulerConfig::default()),
            raf_queue: RefCell::new(Vec::new()),
            raf_armed: Cell::new(false),
            microtask_queue: RefCell::new(Vec::new()),
            microtask_armed: Cell::new(false),
            batch_queue: RefCell::new(Vec::new()),
            batch_seen: RefCell::new(HashSet::new()),
            clock: Cell::new(Clock::System {
                origin: Instant::now(),
            }),
            timers: RefCell::new(BTreeMap::new()),
            timer_deadlines: RefCell::new(HashMap::new()),
            next_timer: Cell::new(1),
            pool: RefCell::new(pool),
            spawner,
            driving: Cell::new(false),
        }
    }

    fn queue(&self, kind: QueueKind) -> &RefCell<Vec<Task>> {
        match kind {
            QueueKind::Microtask => &self.microtask_queue,
            QueueKind::AnimationFrame => &self.raf_queue,
        }
    }

    fn armed(&self, kind: QueueKind) -> &Cell<bool> {
        match kind {
            QueueKind::Microtask => &self.microtask_armed,
            QueueKind::AnimationFrame => &self.raf_armed,
        }
    }

    fn limit(&self, kind: QueueKind) -> usize {
        let config = self.config.get();
        match kind {
            QueueKind::Microtask => config.max_microtask_iterations,
            QueueKind::AnimationFrame => config.max_raf_iterations,
        }
    }
}

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
}

fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    SCHEDULER.with(f)
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Replace the scheduler's iteration caps.
pub fn configure_scheduler(config: SchedulerConfig) {
    with_scheduler(|s| s.config.set(config));
}

/// Current scheduler configuration.
pub fn scheduler_config() -> SchedulerConfig {
    with_scheduler(|s| s.config.get())
}

// =============================================================================
// ENQUEUE
// =============================================================================

/// Append a task to the animation-frame queue, arming a frame if none is pending.
pub fn schedule(task: impl FnOnce() + 'static) {
    enqueue(QueueKind::AnimationFrame, Box::new(task));
}

/// Append a task to the microtask queue, arming a hop if none is pending.
pub fn schedule_microtask(task: impl FnOnce() + 'static) {
    enqueue(QueueKind::Microtask, Box::new(task));
}

fn enqueue(kind: QueueKind, task: Task) {
    with_scheduler(|s| {
        s.queue(kind).borrow_mut().push(task);
        s.armed(kind).set(true);
    });
}

/// Queue a task to run when the current batch flushes.
///
/// The same `Rc` queued twice before the flush runs once. Outside a batch the
/// queue is flushed right away (as a single frame task).
pub fn queue_in_batch(task: BatchTask) {
    let key = Rc::as_ptr(&task) as *const ();
    with_scheduler(|s| {
        if s.batch_seen.borrow_mut().insert(key) {
            s.batch_queue.borrow_mut().push(task);
        }
    });

    if !with_context(|ctx| ctx.is_batching()) {
        flush_batch_queue();
    }
}

/// Move everything queued in the batch into one animation-frame task.
pub(crate) fn flush_batch_queue() {
    let tasks = with_scheduler(|s| {
        s.batch_seen.borrow_mut().clear();
        std::mem::take(&mut *s.batch_queue.borrow_mut())
    });

    if tasks.is_empty() {
        return;
    }

    tracing::trace!(count = tasks.len(), "flushing batch queue in one frame");
    schedule(move || {
        for task in tasks {
            catch_and_report("batched task", || task());
        }
    });
}

/// Whether any queue, timer or spawned future may still have work.
pub fn has_pending_tasks() -> bool {
    with_scheduler(|s| {
        !s.microtask_queue.borrow().is_empty()
            || !s.raf_queue.borrow().is_empty()
            || !s.batch_queue.borrow().is_empty()
            || !s.timers.borrow().is_empty()
    })
}

// =============================================================================
// FLUSH
// =============================================================================

/// Run the pending microtask hop: drain the microtask queue.
pub fn flush_microtasks() {
    drain(QueueKind::Microtask);
}

/// Run the pending animation frame: drain the animation-frame queue.
pub fn flush_animation_frame() {
    drain(QueueKind::AnimationFrame);
}

fn drain(kind: QueueKind) {
    let limit = with_scheduler(|s| {
        s.armed(kind).set(false);
        s.limit(kind)
    });

    let mut passes = 0usize;
    loop {
        let tasks = with_scheduler(|s| std::mem::take(&mut *s.queue(kind).borrow_mut()));
        if tasks.is_empty() {
            break;
        }

        passes += 1;
        if passes > limit {
            let discarded = tasks.len();
            let err = ReactiveError::IterationLimit {
                queue: kind.name(),
                limit,
            };
            tracing::warn!(discarded, queue = kind.name(), "possible reactive feedback loop");
            report_error(err);
            break;
        }

        for task in tasks {
            catch_and_report(kind.name(), task);
        }
    }

    with_scheduler(|s| {
        s.armed(kind).set(!s.queue(kind).borrow().is_empty());
    });
}

// =============================================================================
// FUTURES
// =============================================================================

/// Spawn a future onto the thread-local executor.
///
/// The future is polled by [`run_until_idle`]. A panic inside it is caught and
/// routed to the effect error handler.
pub fn spawn_local(future: impl Future<Output = ()> + 'static) {
    let guarded = std::panic::AssertUnwindSafe(future)
        .catch_unwind()
        .map(|result| {
            if let Err(payload) = result {
                report_error(ReactiveError::from_panic("spawned future", payload));
            }
        });

    let spawned = with_scheduler(|s| s.spawner.spawn_local(guarded));
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "failed to spawn local future");
    }
}

/// Poll spawned futures until none can make progress.
///
/// Re-entrant calls (from inside a polled future) are ignored.
pub fn poll_futures() {
    with_scheduler(|s| {
        if let Ok(mut pool) = s.pool.try_borrow_mut() {
            pool.run_until_stalled();
        }
    });
}

// =============================================================================
// HOST DRIVER
// =============================================================================

/// Drive the runtime until it is quiescent.
///
/// Order per turn: poll futures, fire due timers, drain microtasks, and only
/// when no microtask is pending, run one animation frame.
pub fn run_until_idle() {
    let already = with_scheduler(|s| s.driving.replace(true));
    if already {
        return;
    }

    loop {
        poll_futures();

        if fire_due_timers() {
            continue;
        }

        let (micro, raf) = with_scheduler(|s| {
            (
                s.microtask_armed.get() || !s.microtask_queue.borrow().is_empty(),
                s.raf_armed.get() || !s.raf_queue.borrow().is_empty(),
            )
        });

        if micro {
            flush_microtasks();
            continue;
        }
        if raf {
            flush_animation_frame();
            continue;
        }
        break;
    }

    with_scheduler(|s| s.driving.set(false));
}

// =============================================================================
// CLOCK & TIMERS
// =============================================================================

/// Time elapsed on the runtime clock.
pub fn now() -> Duration {
    with_scheduler(|s| s.clock.get().now())
}

/// Switch to a manual clock frozen at the current time.
///
/// Time then only moves through [`advance_time`].
pub fn use_manual_clock() {
    with_scheduler(|s| {
        let now = s.clock.get().now();
        s.clock.set(Clock::Manual { now });
    });
}

/// Advance the manual clock, firing timers in deadline order.
///
/// The runtime is driven to idle after each timer so chained timers observe
/// the time they were due at.
pub fn advance_time(delta: Duration) {
    let manual = with_scheduler(|s| matches!(s.clock.get(), Clock::Manual { .. }));
    if !manual {
        tracing::warn!("advance_time() called without a manual clock; switching to one");
        use_manual_clock();
    }

    run_until_idle();
    let target = now() + delta;

    loop {
        let next = with_scheduler(|s| {
            s.timers
                .borrow()
                .keys()
                .next()
                .map(|(deadline, _)| *deadline)
                .filter(|deadline| *deadline <= target)
        });

        match next {
            Some(deadline) => {
                set_manual_now(deadline);
                run_until_idle();
            }
            None => break,
        }
    }

    set_manual_now(target);
    run_until_idle();
}

fn set_manual_now(at: Duration) {
    with_scheduler(|s| {
        if let Clock::Manual { now } = s.clock.get() {
            s.clock.set(Clock::Manual { now: now.max(at) });
        }
    });
}

/// Run `task` once `delay` has elapsed on the runtime clock.
pub fn set_timeout(delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
    with_scheduler(|s| {
        let id = s.next_timer.get();
        s.next_timer.set(id + 1);
        let deadline = s.clock.get().now() + delay;
        s.timers.borrow_mut().insert((deadline, id), Box::new(task));
        s.timer_deadlines.borrow_mut().insert(id, deadline);
        TimerId(id)
    })
}

/// Cancel a pending timer. Unknown or already-fired ids are ignored.
///
/// Safe to call from destructors that run while the thread shuts down.
pub fn clear_timeout(id: TimerId) {
    let removed = SCHEDULER.try_with(|s| {
        let deadline = s.timer_deadlines.borrow_mut().remove(&id.0)?;
        s.timers.borrow_mut().remove(&(deadline, id.0))
    });
    // The task is dropped outside the borrow
    drop(removed);
}

/// Fire every timer whose deadline has passed. Returns whether any fired.
fn fire_due_timers() -> bool {
    let due: Vec<Task> = with_scheduler(|s| {
        let now = s.clock.get().now();
        let mut timers = s.timers.borrow_mut();
        let mut deadlines = s.timer_deadlines.borrow_mut();
        let later = timers.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut *timers, later);
        due.into_iter()
            .map(|((_, id), task)| {
                deadlines.remove(&id);
                task
            })
            .collect()
    });

    let fired = !due.is_empty();
    for task in due {
        catch_and_report("timer", task);
    }
    fired
}

// =============================================================================
// SLEEP
// =============================================================================

struct SleepState {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// Future that completes after a delay on the runtime clock.
pub struct Sleep {
    delay: Duration,
    state: Rc<SleepState>,
    timer: Option<TimerId>,
}

/// Wait for `delay` on the runtime clock.
pub fn sleep(delay: Duration) -> Sleep {
    Sleep {
        delay,
        state: Rc::new(SleepState {
            fired: Cell::new(false),
            waker: RefCell::new(None),
        }),
        timer: None,
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.fired.get() {
            return Poll::Ready(());
        }

        *self.state.waker.borrow_mut() = Some(cx.waker().clone());

        if self.timer.is_none() {
            let state = self.state.clone();
            let delay = self.delay;
            self.timer = Some(set_timeout(delay, move || {
                state.fired.set(true);
                if let Some(waker) = state.waker.borrow_mut().take() {
                    waker.wake();
                }
            }));
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            if !self.state.fired.get() {
                clear_timeout(timer);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
