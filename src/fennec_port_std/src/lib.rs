//! Simulation environment for running Fennec on a hosted environment.
//!
//! Each task runs on its own OS thread, but only one thread runs at a time,
//! so a simulated system behaves exactly like a single-core one and runs
//! deterministically.
//!
//! Time is virtual. It advances only when every task is blocked (the
//! simulator jumps to the next timer interrupt) or when a task calls
//! [`consume_time`] to simulate a computation, during which timer
//! interrupts are delivered and may preempt the task.
//!
//! # Example
//!
//! ```
//! use fennec_kernel::{QueueOrder, Semaphore, Task, Timeout};
//!
//! fennec_port_std::use_port!(unsafe struct SystemTraits);
//!
//! fn main() {
//!     fennec_port_std::run::<SystemTraits>(|| {
//!         let sem = Semaphore::<SystemTraits>::new(0, 1, QueueOrder::Fifo).unwrap();
//!         Task::<SystemTraits>::define()
//!             .entry(move || sem.wait(Timeout::Forever).unwrap())
//!             .active(true)
//!             .finish()
//!             .unwrap();
//!         Task::<SystemTraits>::define()
//!             .entry(move || sem.signal(Timeout::Poll).unwrap())
//!             .priority(1)
//!             .active(true)
//!             .finish()
//!             .unwrap();
//!     });
//! }
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use fennec_kernel::{KernelTraits, PortToKernel, System, TaskId, Ticks};
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    thread::JoinHandle,
};

mod sched;
use self::sched::{Evicted, Holder, Sched, SchedState, Serial};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate fennec_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate once_cell;

/// Options for [`run_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// The number of ticks by which the delivery of every timer interrupt
    /// requested by the kernel is delayed.
    pub tick_latency: Ticks,
}

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelTraits + PortToKernel {
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    sched: Sched,
    options: OnceCell<Options>,
    /// The threads spawned by the port. They're joined on shutdown.
    ///
    /// This field is only accessed by the thread holding the baton, so
    /// `SpinMutex` is sufficient.
    join_handles: SpinMutex<Vec<JoinHandle<()>>>,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The thread that called `run`. Timer interrupts are handled here.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The current thread's serial number. `None` for the dispatcher.
    static THREAD_SERIAL: Cell<Option<Serial>> = Cell::new(None);

    /// `true` while the current thread is unwinding to exit. Port hooks
    /// called by destructors in the meantime are ignored.
    static EXITING: Cell<bool> = Cell::new(false);
}

/// The unwinding payload used to terminate a thread.
struct ThreadExit;

/// Unwind and terminate the current thread.
fn exit_thread() -> ! {
    EXITING.with(|x| x.set(true));
    panic::resume_unwind(Box::new(ThreadExit))
}

#[inline]
fn is_exiting() -> bool {
    EXITING.with(Cell::get)
}

/// Assert that the current thread is a worker thread.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(Cell::get);
    assert_ne!(role, ThreadRole::Unknown);
    role
}

fn current_serial() -> Serial {
    THREAD_SERIAL
        .with(Cell::get)
        .expect("the dispatcher has no serial number")
}

#[allow(clippy::missing_safety_doc)]
impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            sched: Sched::new(),
            options: OnceCell::new(),
            join_handles: SpinMutex::new(Vec::new()),
        }
    }

    pub const MAX_TICK_COUNT: Ticks = Ticks::MAX;
    pub const MAX_TIMEOUT: Ticks = Ticks::MAX / 2;

    fn options(&self) -> Options {
        self.options.get().copied().unwrap_or_default()
    }

    /// Spawn a thread that waits for the baton and then runs `body`.
    fn spawn_thread(
        &'static self,
        st: &mut SchedState,
        role: ThreadRole,
        body: impl FnOnce() + Send + 'static,
    ) -> Serial {
        let serial = st.alloc_serial();

        let join_handle = std::thread::Builder::new()
            .name(format!("fennec-{serial}"))
            .spawn(move || {
                THREAD_ROLE.with(|x| x.set(role));
                THREAD_SERIAL.with(|x| x.set(Some(serial)));

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    match self.sched.wait_for_baton(self.sched.lock(), serial) {
                        Ok(st) => drop(st),
                        Err(Evicted) => exit_thread(),
                    }
                    body();
                }));

                if let Err(payload) = result {
                    if !payload.is::<ThreadExit>() {
                        log::trace!("thread {serial} panicked");
                        let mut st = self.sched.lock();
                        st.panic.get_or_insert(payload);
                        self.sched.hand_over(&mut st, Holder::Dispatcher);
                    }
                }

                log::trace!("thread {serial} exited");
            })
            .expect("failed to spawn a thread");

        self.join_handles.lock().push(join_handle);
        log::trace!("spawned thread {serial} ({role:?})");
        serial
    }

    /// Give the baton to the dispatcher and wait until it comes back.
    fn switch_to_dispatcher(&self) {
        let serial = current_serial();
        let mut st = self.sched.lock();
        self.sched.hand_over(&mut st, Holder::Dispatcher);
        if let Err(Evicted) = self.sched.wait_for_baton(st, serial) {
            exit_thread();
        }
    }

    /// The dispatcher loop. Returns when the system becomes idle for good or
    /// a thread panics.
    fn dispatch<Traits: PortInstance>(&'static self) {
        loop {
            let mut st = self.sched.wait_for_dispatcher(self.sched.lock());
            if st.panic.is_some() {
                return;
            }

            if st.is_tick_due() {
                st.tick_at = None;
                drop(st);

                log::trace!("timer interrupt");
                // Safety: CPU Lock inactive, an interrupt context
                unsafe { Traits::timer_tick() };
                continue;
            }
            drop(st);

            // Safety: CPU Lock inactive, we are the dispatcher
            let (running_task, has_timeouts) = unsafe {
                Traits::enter_cpu_lock();
                Traits::choose_running_task();
                let running_task = Traits::state()
                    .running_task()
                    .map(|task| (task, Traits::state().task_entry(task)));
                let has_timeouts = Traits::has_timeouts();
                Traits::leave_cpu_lock();
                (running_task, has_timeouts)
            };

            let mut st = self.sched.lock();
            match running_task {
                Some((task, entry)) => {
                    let serial = match st.task_threads.get(&task).copied() {
                        Some(serial) => serial,
                        None => {
                            let entry = entry.expect("running task has no control block");
                            let serial = self.spawn_thread(&mut st, ThreadRole::Task, move || {
                                log::debug!("task {task:?} is now running");
                                entry();

                                // Safety: Nothing on this thread's stack is
                                //         unsafe to discard
                                unsafe { System::<Traits>::exit_task().unwrap() };
                            });
                            st.task_threads.insert(task, serial);
                            serial
                        }
                    };
                    self.sched.hand_over(&mut st, Holder::Thread(serial));
                }
                None if has_timeouts => {
                    // Idle. Fast-forward to the next timer interrupt.
                    let now = st.now;
                    let at = *st.tick_at.get_or_insert(now);
                    st.now = now.max(at);
                    log::trace!("idle until {}", st.now);
                }
                None => {
                    log::debug!("no runnable tasks and no timeouts at {}", st.now);
                    return;
                }
            }
        }
    }

    /// Evict all threads and wait for them to exit. Returns the panic payload
    /// of a thread that panicked, if any.
    fn shutdown(&self) -> Option<Box<dyn Any + Send>> {
        let mut st = self.sched.lock();
        st.shutdown = true;
        self.sched.notify_all();
        let payload = st.panic.take();
        drop(st);

        let join_handles = std::mem::take(&mut *self.join_handles.lock());
        log::trace!("joining {} threads", join_handles.len());
        for join_handle in join_handles {
            let _ = join_handle.join();
        }

        payload
    }

    pub unsafe fn dispatch_first_task(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);

        let mut st = self.sched.lock();
        assert!(st.cpu_lock);
        st.cpu_lock = false;
        self.sched.hand_over(&mut st, Holder::Dispatcher);
        drop(st);

        // The boot thread is no longer needed
        exit_thread()
    }

    pub unsafe fn yield_cpu(&'static self) {
        log::trace!("yield_cpu");
        let role = expect_worker_thread();
        assert!(!self.is_cpu_lock_active());

        // The dispatcher checks for dispatch after every interrupt and
        // after the boot phase anyway
        if role == ThreadRole::Task {
            self.switch_to_dispatcher();
        }
    }

    pub unsafe fn exit_and_dispatch(&'static self, task: TaskId) -> ! {
        log::trace!("exit_and_dispatch({task:?})");
        assert_eq!(expect_worker_thread(), ThreadRole::Task);

        let mut st = self.sched.lock();
        assert!(st.cpu_lock);

        // Dissociate this thread from the task
        let serial = st.task_threads.remove(&task);
        debug_assert_eq!(serial, Some(current_serial()));

        st.cpu_lock = false;
        self.sched.hand_over(&mut st, Holder::Dispatcher);
        drop(st);

        exit_thread()
    }

    pub unsafe fn enter_cpu_lock(&self) {
        if is_exiting() {
            return;
        }
        log::trace!("enter_cpu_lock");
        expect_worker_thread();

        let mut st = self.sched.lock();
        assert!(!st.cpu_lock);
        st.cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock(&self) {
        if is_exiting() {
            return;
        }
        log::trace!("leave_cpu_lock");
        let role = expect_worker_thread();

        let mut st = self.sched.lock();
        assert!(st.cpu_lock);
        st.cpu_lock = false;

        // A pended timer interrupt is taken as soon as it's unmasked
        if role == ThreadRole::Task && st.is_tick_due() {
            drop(st);
            self.switch_to_dispatcher();
        }
    }

    pub unsafe fn initialize_task_state(&self, task: TaskId) {
        log::trace!("initialize_task_state({task:?})");
        expect_worker_thread();

        let mut st = self.sched.lock();
        assert!(st.cpu_lock);

        // The task might have been killed while its thread was preempted or
        // blocked. That thread must never run again.
        if let Some(serial) = st.orphan_task_thread(task) {
            log::trace!("evicting thread {serial} of task {task:?}");
            self.sched.notify_all();
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        expect_worker_thread();
        self.sched.lock().cpu_lock
    }

    pub fn is_task_context(&self) -> bool {
        match expect_worker_thread() {
            ThreadRole::Task => true,
            ThreadRole::Boot | ThreadRole::Interrupt => false,
            ThreadRole::Unknown => unreachable!(),
        }
    }

    pub fn tick_count(&self) -> Ticks {
        expect_worker_thread();
        // Wraps around at `MAX_TICK_COUNT`
        self.sched.lock().now as Ticks
    }

    pub fn pend_tick_after(&self, tick_count_delta: Ticks) {
        expect_worker_thread();
        log::trace!("pend_tick_after({tick_count_delta:?})");

        let latency = self.options().tick_latency;
        let mut st = self.sched.lock();
        st.tick_at = Some(st.now + u64::from(tick_count_delta) + u64::from(latency));
    }

    pub fn pend_tick(&self) {
        expect_worker_thread();
        log::trace!("pend_tick");

        let mut st = self.sched.lock();
        st.tick_at = Some(st.now);
    }
}

/// Boot the simulated system and run it until no task is runnable and no
/// timeout is pending.
///
/// `startup` is called in a boot context before the first task is
/// dispatched. It usually creates the application's objects and tasks.
///
/// A panic in a task or a timer callback is propagated to the caller after
/// all threads have been shut down.
///
/// A kernel trait type can only be run once.
pub fn run<Traits: PortInstance>(startup: impl FnOnce() + Send + 'static) {
    run_with::<Traits>(Options::default(), startup)
}

/// [`run`] with custom [`Options`].
pub fn run_with<Traits: PortInstance>(options: Options, startup: impl FnOnce() + Send + 'static) {
    // `is_test(true)` would drop log messages from other threads
    let _ = env_logger::try_init();

    assert_eq!(
        THREAD_ROLE.with(Cell::get),
        ThreadRole::Unknown,
        "this function cannot be called from a port-managed thread"
    );

    let state = Traits::port_state();
    assert!(
        state.options.set(options).is_ok(),
        "this system has already been run"
    );

    THREAD_ROLE.with(|x| x.set(ThreadRole::Interrupt));

    {
        let mut st = state.sched.lock();
        let serial = state.spawn_thread(&mut st, ThreadRole::Boot, move || {
            startup();

            // Safety: CPU Lock inactive, a boot context
            unsafe { Traits::boot() }
        });
        state.sched.hand_over(&mut st, Holder::Thread(serial));
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| state.dispatch::<Traits>()));
    let thread_panic = state.shutdown();

    THREAD_ROLE.with(|x| x.set(ThreadRole::Unknown));

    if let Err(payload) = result {
        panic::resume_unwind(payload);
    }
    if let Some(payload) = thread_panic {
        panic::resume_unwind(payload);
    }
}

/// Simulate a computation that takes `duration` ticks. Timer interrupts due
/// in the meantime are delivered and may cause the current task to be
/// preempted.
///
/// # Panics
///
/// Panics if the current context is not a task context or CPU Lock is
/// active.
pub fn consume_time<Traits: PortInstance>(duration: Ticks) {
    assert_eq!(
        expect_worker_thread(),
        ThreadRole::Task,
        "time can only be consumed by a task"
    );

    let state = Traits::port_state();
    let mut st = state.sched.lock();
    assert!(!st.cpu_lock);

    let end = st.now + u64::from(duration);
    loop {
        match st.tick_at {
            Some(at) if at <= end => {
                st.now = st.now.max(at);
                drop(st);
                state.switch_to_dispatcher();
                st = state.sched.lock();
            }
            _ => {
                st.now = st.now.max(end);
                return;
            }
        }
    }
}

/// Get the current virtual time, in ticks.
pub fn now<Traits: PortInstance>() -> u64 {
    Traits::port_state().sched.lock().now
}

/// Implement the port and kernel configuration traits on a new kernel trait
/// type.
///
/// ```text
/// use_port!(unsafe struct SystemTraits);
/// use_port!(unsafe struct SystemTraits {
///     num_task_priority_levels: 8,
///     time_slice: Some(10),
/// });
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $crate::use_port! {
            unsafe $vis struct $SystemTraits {
                num_task_priority_levels: 16,
                time_slice: None,
            }
        }
    };

    (unsafe $vis:vis struct $SystemTraits:ident {
        num_task_priority_levels: $num_task_priority_levels:expr,
        time_slice: $time_slice:expr $(,)?
    }) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::fennec_kernel::{
                KernelCfg, PortThreading, PortTimer, State as KernelState, TaskId, Ticks,
            };
            use $crate::once_cell::sync::Lazy;
            use $crate::{PortInstance, State};

            pub(super) static PORT_STATE: State = State::new();

            static KERNEL_STATE: Lazy<KernelState<$SystemTraits>> = Lazy::new(KernelState::new);

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl KernelCfg for $SystemTraits {
                const NUM_TASK_PRIORITY_LEVELS: usize = $num_task_priority_levels;
                const TIME_SLICE: Option<Ticks> = $time_slice;

                #[inline]
                fn state() -> &'static KernelState<Self> {
                    &KERNEL_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu() }
                }

                unsafe fn exit_and_dispatch(task: TaskId) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch(task) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn initialize_task_state(task: TaskId) {
                    unsafe { PORT_STATE.initialize_task_state(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }
            }

            impl PortTimer for $SystemTraits {
                const MAX_TICK_COUNT: Ticks = State::MAX_TICK_COUNT;
                const MAX_TIMEOUT: Ticks = State::MAX_TIMEOUT;

                unsafe fn tick_count() -> Ticks {
                    PORT_STATE.tick_count()
                }

                unsafe fn pend_tick_after(tick_count_delta: Ticks) {
                    PORT_STATE.pend_tick_after(tick_count_delta)
                }

                unsafe fn pend_tick() {
                    PORT_STATE.pend_tick()
                }
            }
        }
    };
}
