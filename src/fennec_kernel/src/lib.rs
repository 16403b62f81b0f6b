//! A preemptive real-time kernel for single-core systems.
//!
//! The kernel schedules prioritized tasks and provides the usual
//! synchronization and communication primitives: [mutexes](Mutex) with
//! priority inheritance, [semaphores](Semaphore), [condition
//! variables](Condvar), [event flags](EventFlags), [barriers](Barrier),
//! [timers](Timer), [mailboxes](Mailbox), [message queues](MessageQueue),
//! [stream buffers](StreamBuffer), [memory pools](MemoryPool),
//! [lists](List), and [dispatch queues](DispatchQueue).
//!
//! # Ports
//!
//! The kernel doesn't know how to switch contexts or how to measure time. A
//! *port* supplies these by implementing [`PortThreading`] and
//! [`PortTimer`], and a kernel instance is configured by [`KernelCfg`]. All
//! three are implemented on a single *kernel trait type*, which then
//! implements [`KernelTraits`] and [`PortToKernel`] automatically.
//!
//! # Objects
//!
//! Objects are created at runtime and referenced by `Copy` handles such as
//! [`Semaphore<Traits>`](Semaphore). Every object kind supports `kill`
//! (reset it and fail its waiters with `Stopped`) and `delete` (kill it and
//! free its id). Using a deleted object's handle results in `BadId`.
//!
//! # Contexts
//!
//! Blocking operations can only be used in a task context. Calling one from
//! an interrupt context (including timer callbacks) or while the boot phase
//! is in progress results in `BadContext`, except when the operation is
//! given [`Timeout::Poll`].
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_ret_no_self)]
extern crate alloc;

use core::{convert::Infallible, fmt, marker::PhantomData};

/// Define a handle type for a kernel object.
macro_rules! define_object_handle {
    (
        $( #[$meta:meta] )*
        pub struct $Name:ident;
    ) => {
        $( #[$meta] )*
        pub struct $Name<Traits>($crate::state::Id, core::marker::PhantomData<fn() -> Traits>);

        impl<Traits> Clone for $Name<Traits> {
            #[inline]
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<Traits> Copy for $Name<Traits> {}

        impl<Traits> PartialEq for $Name<Traits> {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }

        impl<Traits> Eq for $Name<Traits> {}

        impl<Traits> core::hash::Hash for $Name<Traits> {
            #[inline]
            fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl<Traits> core::fmt::Debug for $Name<Traits> {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.debug_tuple(stringify!($Name)).field(&self.0).finish()
            }
        }

        impl<Traits> $Name<Traits> {
            /// Construct a handle from a raw object id.
            ///
            /// The id isn't checked here. Operations on a handle with an
            /// invalid id fail with `BadId`.
            #[inline]
            pub const fn from_id(id: $crate::state::Id) -> Self {
                Self(id, core::marker::PhantomData)
            }

            /// Get the raw object id.
            #[inline]
            pub const fn id(self) -> $crate::state::Id {
                self.0
            }
        }
    };
}

mod barrier;
mod condvar;
mod dispatch;
mod error;
mod event_flags;
mod klock;
mod list;
mod mutex;
mod pool;
mod queue;
mod semaphore;
mod state;
mod task;
mod timeout;
mod timer;
mod utils;
mod wait;

pub use self::{
    barrier::{Barrier, BarrierWaitResult},
    condvar::Condvar,
    dispatch::{DispatchQueue, Job},
    error::*,
    event_flags::{EventFlags, EventFlagsBits, EventFlagsWaitFlags},
    list::List,
    mutex::{Mutex, MutexPolicy},
    pool::MemoryPool,
    queue::{Mailbox, MessageQueue, StreamBuffer},
    semaphore::{Semaphore, SemaphoreValue},
    state::{Id, State},
    task::{Task, TaskDefiner, TaskId, TaskState},
    timeout::{Ticks, Timeout, DURATION_MAX},
    timer::{Timer, TimerDefiner},
    wait::QueueOrder,
};

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Transfer the control to the task chosen by the kernel, discarding the
    /// current (startup) context. [`State::running_task`] indicates which
    /// task to run; if it's `None`, the port idles until an interrupt makes
    /// a task ready.
    ///
    /// Precondition: CPU Lock active, a boot context
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control to
    /// a dispatcher. The dispatcher calls
    /// [`PortToKernel::choose_running_task`] to find the next task to run
    /// and transfers the control to that task.
    ///
    /// In an interrupt context, the effect of this method is deferred until
    /// the processor leaves the interrupt context.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task (`task`, which has
    /// already been removed from [`State::running_task`]) and proceed to the
    /// dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(task: TaskId) -> !;

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the task for activation. More specifically, set the current
    /// program counter to the task's entry point and discard any context
    /// the task may have had.
    ///
    /// Precondition: CPU Lock active, the task is in the Stopped state
    unsafe fn initialize_task_state(task: TaskId);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;
}

/// Implemented by a port. This trait contains items related to controlling
/// a system timer.
pub trait PortTimer {
    /// The maximum value that [`tick_count`] can return. Must be greater
    /// than zero.
    ///
    /// [`tick_count`]: Self::tick_count
    const MAX_TICK_COUNT: Ticks = Ticks::MAX;

    /// The maximum value that can be passed to [`pend_tick_after`]. Must be
    /// greater than zero.
    ///
    /// This value should be considerably smaller than [`MAX_TICK_COUNT`] so
    /// that the kernel can handle a delayed tick.
    ///
    /// [`pend_tick_after`]: Self::pend_tick_after
    /// [`MAX_TICK_COUNT`]: Self::MAX_TICK_COUNT
    const MAX_TIMEOUT: Ticks = Ticks::MAX;

    /// Read the current tick count (timer value).
    ///
    /// This value wraps around to zero after [`MAX_TICK_COUNT`].
    ///
    /// Precondition: CPU Lock active
    ///
    /// [`MAX_TICK_COUNT`]: Self::MAX_TICK_COUNT
    unsafe fn tick_count() -> Ticks;

    /// Indicate that `tick_count_delta` ticks may elapse before the kernel
    /// should receive a call to [`PortToKernel::timer_tick`].
    ///
    /// Precondition: CPU Lock active, `tick_count_delta` is in range
    /// `1..=MAX_TIMEOUT`
    unsafe fn pend_tick_after(tick_count_delta: Ticks) {
        let _ = tick_count_delta;
    }

    /// Pend a call to [`PortToKernel::timer_tick`] as soon as possible.
    ///
    /// Precondition: CPU Lock active
    unsafe fn pend_tick() {}
}

/// Associates a kernel trait type with its kernel configuration.
///
/// # Safety
///
/// This is only intended to be implemented by a port's `use_port!` macro
/// (or by hand for testing).
pub unsafe trait KernelCfg: Sized + Send + Sync + 'static {
    /// The number of task priority levels. Priorities are in range
    /// `0..NUM_TASK_PRIORITY_LEVELS`, `0` being the most urgent.
    const NUM_TASK_PRIORITY_LEVELS: usize;

    /// The length of a round-robin time slice. Tasks of the same priority
    /// rotate every time slice if this is `Some(_)`.
    const TIME_SLICE: Option<Ticks> = None;

    /// Get the kernel-global state of this kernel instance.
    fn state() -> &'static State<Self>;
}

/// Represents a complete kernel trait type.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg {}

impl<T: PortThreading + PortTimer + KernelCfg> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
pub trait PortToKernel {
    /// Initialize runtime structures and start the first task.
    ///
    /// Objects can be created before calling this. Timeouts registered
    /// before this call are measured from the same origin.
    ///
    /// Precondition: CPU Lock inactive, a boot context
    unsafe fn boot() -> !;

    /// Determine the next task to run and store it in
    /// [`State::running_task`].
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Called by a port timer driver to "announce" new ticks.
    ///
    /// This method can be called anytime, but the driver is expected to
    /// attempt to ensure the calls occur near tick count values indicated by
    /// [`PortTimer::pend_tick_after`] or [`PortTimer::pend_tick`].
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();

    /// Return a flag indicating whether any timeouts (task wait deadlines or
    /// active timers) are pending. A port can use this to decide whether an
    /// idle system will ever wake up.
    ///
    /// Precondition: CPU Lock active
    unsafe fn has_timeouts() -> bool;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // The precondition includes CPU Lock being inactive
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let g = state::globals(&mut *lock);

        timeout::init::<Traits>(g);
        task::choose_next_running_task::<Traits>(g);

        log::debug!("boot: first task = {:?}", g.running_task);

        core::mem::forget(lock);

        // Safety: CPU Lock active, a boot context
        unsafe { Traits::dispatch_first_task() }
    }

    #[inline]
    unsafe fn choose_running_task() {
        // Safety: CPU Lock active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        task::choose_next_running_task::<Traits>(state::globals(&mut *lock));

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }

    unsafe fn has_timeouts() -> bool {
        // Safety: CPU Lock active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let has_timeouts = state::globals(&mut *lock).timeout.has_timeouts();
        core::mem::forget(lock);
        has_timeouts
    }
}

/// Provides access to the global functionalities of a kernel instance.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("System")
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Terminate the current task, putting it into the Stopped state.
    ///
    /// This function doesn't return. Returning from a task's entry function
    /// has the same effect.
    ///
    /// The mutexes held by the task are abandoned and passed to their next
    /// waiters.
    ///
    /// # Safety
    ///
    /// On a successful call, this function destroys the current task's
    /// stack without running any destructors on stack-allocated objects.
    pub unsafe fn exit_task() -> Result<Infallible, ExitTaskError> {
        // Safety: Just forwarding the function call
        unsafe { task::exit_current_task::<Traits>() }.map_err(Into::into)
    }

    /// Put the current task into the Waiting state until the specified
    /// timeout elapses. `Timeout::Forever` is rejected with `BadParam`.
    pub fn sleep(timeout: Timeout) -> Result<(), SleepError> {
        task::put_current_task_on_sleep_timeout::<Traits>(timeout)
    }

    /// Move the current task to the back of its priority level, letting the
    /// other ready tasks of the same priority run.
    pub fn yield_now() -> Result<(), YieldError> {
        task::yield_current_task::<Traits>()
    }

    /// Get the current system time, in ticks since boot.
    ///
    /// The value wraps around, so use `wrapping_sub` to compare points of
    /// time.
    pub fn time() -> Result<Ticks, TimeError> {
        timeout::system_time::<Traits>().map_err(Into::into)
    }
}
