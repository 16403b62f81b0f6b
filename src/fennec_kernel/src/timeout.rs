//! Manages timeouts (timed events) and the system clock.
//!
//! # Ticks
//!
//! **A tick** is a point of time that can be used as a reference to represent
//! points of time in proximity. The first tick is created at boot time. A new
//! tick is created whenever [`PortToKernel::timer_tick`] is called.
//!
//! The system tracks the latest tick that was created, which the system will
//! use to derive the current time by comparing [the `tick_count` associated
//! with the tick] to [the current `tick_count`].
//!
//! [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
//! [the `tick_count` associated with the tick]: TimeoutGlobals::last_tick_count
//! [the current `tick_count`]: crate::PortTimer::tick_count
//!
//! It's important to create ticks at a steady rate. Tick counts only have a
//! limited range (`0..=`[`MAX_TICK_COUNT`]), and we can't calculate the
//! correct duration between the current time and the last tick if they are
//! too far away. The kernel ensures this by never asking the port to delay the
//! next tick by more than [`MAX_TIMEOUT`].
//!
//! [`MAX_TICK_COUNT`]: crate::PortTimer::MAX_TICK_COUNT
//! [`MAX_TIMEOUT`]: crate::PortTimer::MAX_TIMEOUT
//!
//! # Event Times
//!
//! This line represents the value range of [`Ticks`]. The current time (CT)
//! is a mobile point on the line, constantly moving left to right. When it
//! reaches the end of the line, it goes back to the other end and keeps
//! moving. The arrival times of timeouts are immobile points on the line.
//!
//! ```text
//!                                       critical point
//!                                              │     overdue
//! ▃▃▃▃▃▃                                       │▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃▃
//! ═════╤═══════════════════════════════════════╧══════════════════
//! ▓▓▓▓▓│░░░░░░░░░░░░░░░░░░░░░░░░░░░░░░░▓▓▓▓▓▓▓▓▒▒▒▒▒▒▒▒▒▒▒▒▒▒▒▒▒▓▓
//!      CT         enqueueable    user headroom   hard headroom
//! ```
//!
//!  - `CT ..= CT + DURATION_MAX`: Newly registered timeouts always belong to
//!    this **enqueueable zone**.
//!
//!  - Timeouts move into the headroom zones because of overdue timer
//!    interrupts. A periodic timer whose ticks arrive late is re-armed
//!    relative to its previous arrival time, so its next arrival time can be
//!    in the past.
//!
//!  - `CT - USER_HEADROOM - HARD_HEADROOM ..= CT`: Timeouts in this **overdue
//!    zone** are said to be overdue. They will be processed the next time
//!    [`handle_tick`] is called.
//!
//! The earlier endpoint of the hard headroom zone is called **the critical
//! point**. No timeouts shall go past this point. Event times `x` and `y`
//! can have their chronological order determined by
//! `x.wrapping_sub(critical_point).cmp(&y.wrapping_sub(critical_point))`.
use alloc::vec::Vec;
use core::fmt;
use slab::Slab;

use crate::{
    error::{BadContextError, BadParamError},
    klock::lock_cpu,
    state::{globals, Globals, ObjectTable},
    task::{self, TaskCb, TaskId, TaskState},
    timer::{self, TimerCb, TimerId},
    utils::binary_heap::{BinaryHeap, BinaryHeapCtx},
    wait, KernelTraits,
};

/// Unsigned integer type representing a tick count or a duration, measured
/// in ticks.
pub type Ticks = u32;

/// The maximum duration that can be passed to [`Timeout::After`].
pub const DURATION_MAX: Ticks = 1 << 31;

const USER_HEADROOM: Ticks = 1 << 29;

const HARD_HEADROOM: Ticks = 1 << 30;

/// Specifies how long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Don't wait. The operation fails with `Timeout` if it can't complete
    /// immediately.
    Poll,
    /// Wait indefinitely.
    Forever,
    /// Wait for the specified number of ticks at most. Must not exceed
    /// [`DURATION_MAX`]. `After(0)` is equivalent to [`Poll`].
    ///
    /// [`Poll`]: Self::Poll
    After(Ticks),
    /// Wait until the specified point of time at most. A point of time that
    /// is not in the range `now + 1 ..= now + DURATION_MAX` is considered to
    /// be in the past, in which case this is equivalent to [`Poll`].
    ///
    /// [`Poll`]: Self::Poll
    At(Ticks),
}

/// [`Timeout`] resolved against the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    Poll,
    Forever,
    At(Ticks),
}

impl Deadline {
    #[inline]
    pub(crate) fn is_poll(self) -> bool {
        self == Self::Poll
    }
}

/// The object a timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutTarget {
    /// A task waiting with a deadline.
    Task(TaskId),
    /// An armed timer.
    Timer(TimerId),
}

/// A heap entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutRef {
    /// The arrival time.
    at: Ticks,
    target: TimeoutTarget,
}

/// The value of `heap_pos` indicating the object is not in the heap.
pub(crate) const HEAP_POS_NONE: usize = usize::MAX;

/// A kernel-global state for timed event management.
pub(crate) struct TimeoutGlobals {
    /// The value of [`PortTimer::tick_count`] on the previous tick.
    ///
    /// [`PortTimer::tick_count`]: crate::PortTimer::tick_count
    last_tick_count: Ticks,

    /// The event time on the previous tick.
    last_tick_time: Ticks,

    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival time.
    heap: Vec<TimeoutRef>,

    /// Flag indicating whether `handle_tick` is in progress or not.
    handle_tick_in_progress: bool,

    /// The event time when the running task's current time slice started.
    slice_start: Ticks,
}

impl TimeoutGlobals {
    pub(crate) fn new() -> Self {
        Self {
            last_tick_count: 0,
            last_tick_time: 0,
            heap: Vec::new(),
            handle_tick_in_progress: false,
            slice_start: 0,
        }
    }

    /// Get a flag indicating whether there are outstanding timeouts.
    pub(crate) fn has_timeouts(&self) -> bool {
        !self.heap.is_empty()
    }
}

impl fmt::Debug for TimeoutGlobals {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("last_tick_count", &self.last_tick_count)
            .field("last_tick_time", &self.last_tick_time)
            .field("heap", &self.heap)
            .field("handle_tick_in_progress", &self.handle_tick_in_progress)
            .finish()
    }
}

/// The context type for the timeout heap. Keeps `heap_pos` of the heap
/// entries' targets up-to-date.
struct TimeoutHeapCtx<'a> {
    critical_point: Ticks,
    tasks: &'a mut Slab<TaskCb>,
    timers: &'a mut Slab<TimerCb>,
}

impl BinaryHeapCtx<TimeoutRef> for TimeoutHeapCtx<'_> {
    #[inline]
    fn lt(&mut self, x: &TimeoutRef, y: &TimeoutRef) -> bool {
        let critical_point = self.critical_point;
        x.at.wrapping_sub(critical_point) < y.at.wrapping_sub(critical_point)
    }

    #[inline]
    fn on_move(&mut self, e: &mut TimeoutRef, new_index: usize) {
        *heap_pos_mut(self.tasks, self.timers, e.target) = new_index;
    }
}

#[inline]
fn heap_pos_mut<'a>(
    tasks: &'a mut Slab<TaskCb>,
    timers: &'a mut Slab<TimerCb>,
    target: TimeoutTarget,
) -> &'a mut usize {
    match target {
        TimeoutTarget::Task(task) => &mut tasks.obj_mut(task).heap_pos,
        TimeoutTarget::Timer(timer) => &mut timers.obj_mut(timer).heap_pos,
    }
}

// Initialization
// ---------------------------------------------------------------------------

/// Create the first tick.
///
/// The time origin is the tick count `0`, so timeouts registered before boot
/// stay valid.
pub(crate) fn init<Traits: KernelTraits>(g: &mut Globals) {
    mark_tick::<Traits>(g);

    let current_time = g.timeout.last_tick_time;
    pend_next_tick::<Traits>(g, current_time);
}

// Global Time Management
// ---------------------------------------------------------------------------

/// Implements [`System::time`].
///
/// [`System::time`]: crate::System::time
pub(crate) fn system_time<Traits: KernelTraits>() -> Result<Ticks, BadContextError> {
    let mut lock = lock_cpu::<Traits>()?;
    Ok(current_time::<Traits>(globals(&mut *lock)))
}

/// Calculate the elapsed time since the last tick.
///
/// Returns two values:
///
///  1. The duration in range `0..=Traits::MAX_TICK_COUNT`.
///  2. The value of `Traits::tick_count()` used for calculation.
fn duration_since_last_tick<Traits: KernelTraits>(g: &Globals) -> (Ticks, Ticks) {
    // Safety: CPU Lock active
    let tick_count = unsafe { Traits::tick_count() };

    let last_tick_count = g.timeout.last_tick_count;

    // Guess the current time, taking the wrap-around behavior into account.
    let elapsed = if Traits::MAX_TICK_COUNT == Ticks::MAX || tick_count >= last_tick_count {
        // last_tick_count    tick_count
        // ┌──────┴────────────────┴────────┬───────────┐
        // 0      ╚════════════════╝  MAX_TICK_COUNT    MAX
        //              elapsed
        tick_count.wrapping_sub(last_tick_count)
    } else {
        //   tick_count     last_tick_count
        // ┌──────┴────────────────┴────────┬───────────┐
        // 0 ═════╝                ╚════════           MAX
        //                          elapsed
        tick_count.wrapping_sub(last_tick_count) - (Ticks::MAX - Traits::MAX_TICK_COUNT)
    };

    (elapsed, tick_count)
}

/// Create a tick now.
fn mark_tick<Traits: KernelTraits>(g: &mut Globals) {
    let (duration_since_last_tick, tick_count) = duration_since_last_tick::<Traits>(g);

    g.timeout.last_tick_count = tick_count;
    g.timeout.last_tick_time = g
        .timeout
        .last_tick_time
        .wrapping_add(duration_since_last_tick);
}

/// Get the current event time.
pub(crate) fn current_time<Traits: KernelTraits>(g: &Globals) -> Ticks {
    let (duration_since_last_tick, _) = duration_since_last_tick::<Traits>(g);
    g.timeout
        .last_tick_time
        .wrapping_add(duration_since_last_tick)
}

/// Resolve `timeout` against the current time.
pub(crate) fn resolve<Traits: KernelTraits>(
    g: &Globals,
    timeout: Timeout,
) -> Result<Deadline, BadParamError> {
    match timeout {
        Timeout::Poll | Timeout::After(0) => Ok(Deadline::Poll),
        Timeout::Forever => Ok(Deadline::Forever),
        Timeout::After(duration) if duration > DURATION_MAX => Err(BadParamError::BadParam),
        Timeout::After(duration) => Ok(Deadline::At(
            current_time::<Traits>(g).wrapping_add(duration),
        )),
        Timeout::At(at) => {
            let duration = at.wrapping_sub(current_time::<Traits>(g));
            if duration == 0 || duration > DURATION_MAX {
                Ok(Deadline::Poll)
            } else {
                Ok(Deadline::At(at))
            }
        }
    }
}

/// Validate a duration given as an object parameter (e.g., a timer period).
pub(crate) fn validate_duration(duration: Ticks) -> Result<Ticks, BadParamError> {
    if duration > DURATION_MAX {
        Err(BadParamError::BadParam)
    } else {
        Ok(duration)
    }
}

/// Handle a tick.
///
/// Precondition: CPU Lock inactive, an interrupt context
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    let g = globals(&mut *lock);
    mark_tick::<Traits>(g);

    let current_time = g.timeout.last_tick_time;
    let critical_point = critical_point(current_time);

    // Set `handle_tick_in_progress`. This will suppress redundant calls to
    // `pend_next_tick` made by timeout handlers.
    g.timeout.handle_tick_in_progress = true;

    log::trace!("handle_tick: current_time = {}", current_time);

    // Process expired timeouts.
    //
    // For each iteration, check the top element (representing the earliest
    // timeout) in the heap. Exit from the loop if the heap is empty.
    loop {
        let g = globals(&mut *lock);
        let timeout_ref = match g.timeout.heap.first() {
            Some(&timeout_ref) => timeout_ref,
            None => break,
        };

        // How much time do we have before the timeout becomes overdue?
        if saturating_duration_until_timeout(timeout_ref.at, current_time) > 0 {
            break;
        }

        // The timeout has expired. Remove it from the heap.
        let Globals {
            timeout, tasks, timers, ..
        } = g;
        debug_assert_eq!(*heap_pos_mut(tasks, timers, timeout_ref.target), 0);
        timeout.heap.heap_remove(
            0,
            TimeoutHeapCtx {
                critical_point,
                tasks,
                timers,
            },
        );
        *heap_pos_mut(tasks, timers, timeout_ref.target) = HEAP_POS_NONE;

        match timeout_ref.target {
            TimeoutTarget::Task(task) => {
                log::trace!("task {:?} timed out", task);
                wait::interrupt_task(g, task, Err(crate::WaitError::Timeout));
            }
            TimeoutTarget::Timer(timer) => {
                lock = timer::handle_expiry::<Traits>(lock, timer, timeout_ref.at);
            }
        }
    }

    let g = globals(&mut *lock);
    g.timeout.handle_tick_in_progress = false;

    check_time_slice::<Traits>(g, current_time);

    // Schedule the next tick
    pend_next_tick::<Traits>(g, current_time);

    // Timeout handlers might have woken up some tasks. Check for dispatch and
    // release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

/// Rotate the running task to the back of its priority level if it has
/// exhausted its time slice.
fn check_time_slice<Traits: KernelTraits>(g: &mut Globals, current_time: Ticks) {
    let slice = match time_slice::<Traits>() {
        Some(slice) => slice,
        None => return,
    };

    let running_task = match g.running_task {
        Some(task) if g.tasks.obj(task).st == TaskState::Running => task,
        _ => return,
    };

    if current_time.wrapping_sub(g.timeout.slice_start) < slice {
        return;
    }

    let pri = g.tasks.obj(running_task).effective_priority;
    if g.ready_queue.has_ready_task_in_priority_range(..pri + 1) {
        log::trace!("task {:?} exhausted its time slice", running_task);
        // Put the running task at the back of its priority level. The next
        // dispatch will pick the task at the front.
        task::make_ready(g, running_task);
    }

    g.timeout.slice_start = current_time;
}

/// Get the time-slice length if round-robin scheduling is enabled.
#[inline]
fn time_slice<Traits: KernelTraits>() -> Option<Ticks> {
    if cfg!(feature = "cooperative") {
        None
    } else {
        Traits::TIME_SLICE.filter(|&slice| slice > 0)
    }
}

/// Start a new time slice for a newly dispatched task.
pub(crate) fn reset_time_slice<Traits: KernelTraits>(g: &mut Globals) {
    if time_slice::<Traits>().is_some() {
        let current_time = current_time::<Traits>(g);
        g.timeout.slice_start = current_time;
        if !g.timeout.handle_tick_in_progress {
            pend_next_tick::<Traits>(g, current_time);
        }
    }
}

/// Schedule the next tick.
fn pend_next_tick<Traits: KernelTraits>(g: &Globals, current_time: Ticks) {
    let mut delay = Traits::MAX_TIMEOUT;

    // Check the top element (representing the earliest timeout) in the heap
    if let Some(timeout_ref) = g.timeout.heap.first() {
        // How much time do we have before `timeout` becomes overdue?
        delay = delay.min(saturating_duration_until_timeout(
            timeout_ref.at,
            current_time,
        ));
    }

    // Also wake up when the running task exhausts its time slice
    if let (Some(slice), Some(task)) = (time_slice::<Traits>(), g.running_task) {
        if g.tasks.obj(task).st == TaskState::Running {
            let elapsed = current_time.wrapping_sub(g.timeout.slice_start);
            delay = delay.min(slice.saturating_sub(elapsed));
        }
    }

    // Safety: CPU Lock active
    unsafe {
        if delay == 0 {
            Traits::pend_tick();
        } else {
            Traits::pend_tick_after(delay);
        }
    }
}

// Timeout Management
// ---------------------------------------------------------------------------

/// Find the critical point based on the current event time.
#[inline]
fn critical_point(current_time: Ticks) -> Ticks {
    current_time.wrapping_sub(HARD_HEADROOM + USER_HEADROOM)
}

/// Calculate the duration until the specified arrival time is reached.
/// Returns `0` if the arrival time is already overdue.
#[inline]
fn saturating_duration_until_timeout(at: Ticks, current_time: Ticks) -> Ticks {
    let critical_point = critical_point(current_time);

    let duration_until_violating_critical_point = at.wrapping_sub(critical_point);

    duration_until_violating_critical_point.saturating_sub(HARD_HEADROOM + USER_HEADROOM)
}

/// Register a timeout for `target`, arriving at `at`.
///
/// Panics if `target` already has a registered timeout.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    g: &mut Globals,
    target: TimeoutTarget,
    at: Ticks,
) {
    let current_time = current_time::<Traits>(g);
    let critical_point = critical_point(current_time);

    let Globals {
        timeout, tasks, timers, ..
    } = &mut *g;

    assert_eq!(
        *heap_pos_mut(tasks, timers, target),
        HEAP_POS_NONE,
        "timeout is already registered",
    );

    let pos = timeout.heap.heap_push(
        TimeoutRef { at, target },
        TimeoutHeapCtx {
            critical_point,
            tasks,
            timers,
        },
    );

    // If the timeout is at the top, reschedule the next tick
    if pos == 0 && !timeout.handle_tick_in_progress {
        pend_next_tick::<Traits>(g, current_time);
    }
}

/// Unregister the timeout of `target` if there's one.
pub(crate) fn remove_timeout(g: &mut Globals, target: TimeoutTarget) {
    let Globals {
        timeout, tasks, timers, ..
    } = g;

    let pos = *heap_pos_mut(tasks, timers, target);
    if pos == HEAP_POS_NONE {
        return;
    }

    // The elements' relative order doesn't change between ticks, so any
    // recent critical point works here
    let critical_point = critical_point(timeout.last_tick_time);

    let timeout_ref = timeout.heap.heap_remove(
        pos,
        TimeoutHeapCtx {
            critical_point,
            tasks,
            timers,
        },
    );
    debug_assert_eq!(timeout_ref.map(|r| r.target), Some(target));

    *heap_pos_mut(tasks, timers, target) = HEAP_POS_NONE;
}
