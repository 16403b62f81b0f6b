//! Tasks
use alloc::sync::Arc;
use core::{convert::Infallible, fmt, marker::PhantomData};
use slab::Slab;

use crate::{
    error::{
        BadContextError, CreateError, DetachTaskError, GetCurrentTaskError, JoinTaskError,
        KillTaskError, QueryError, SetTaskPriorityError, SleepError, StartTaskError,
        SuspendTaskError, YieldError,
    },
    klock::{self, lock_cpu, CpuLockGuard, CpuLockTokenRefMut},
    mutex::{self, MutexId},
    state::{self, globals, Globals, Id, ObjectTable},
    timeout::{self, Deadline, Timeout, HEAP_POS_NONE},
    utils::intrusive_list::{Link, LinkPool},
    wait::{self, QueueOrder, TaskWait, WaitPayload, WaitQueueId},
    KernelTraits,
};

pub(crate) mod readyqueue;
use self::readyqueue::ScheduleDecision;

/// The identifier of a task.
pub type TaskId = Id;

define_object_handle! {
    /// Represents a single task in a system.
    ///
    /// A task is a unit of concurrency. Each task has a priority, an entry
    /// function, and a state that the scheduler maintains.
    ///
    /// A joinable task's control block persists after termination until it's
    /// [joined](Self::join). A detached one is freed as soon as it
    /// terminates.
    pub struct Task;
}

/// The state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// The task hasn't started or has terminated.
    Stopped,
    /// The task is waiting to be scheduled.
    Ready,
    /// The task is the one currently running.
    Running,
    /// The task is blocked on an object and/or a deadline.
    Waiting,
    /// The task is suspended and won't be scheduled until resumed.
    Suspended,
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb {
    pub(crate) entry: Arc<dyn Fn() + Send + Sync>,

    /// The task's base priority. `0` is the most urgent.
    pub(crate) base_priority: usize,

    /// The task's effective priority. It's calculated based on
    /// `base_priority` and the priorities of the tasks waiting on the mutexes
    /// held by this task. It's never less urgent than `base_priority`.
    pub(crate) effective_priority: usize,

    pub(crate) st: TaskState,

    /// `true` if the task should enter the Suspended state instead of Ready
    /// when it's woken up.
    pub(crate) suspended: bool,

    /// Links the task into the ready queue or a wait queue.
    pub(crate) link: Option<Link<TaskId>>,

    pub(crate) wait: TaskWait,

    /// The position of the task's timeout in the timeout heap.
    pub(crate) heap_pos: usize,

    /// The last mutex locked by the task. The rest are reachable through
    /// [`MutexCb::prev_mutex_held`].
    ///
    /// [`MutexCb::prev_mutex_held`]: crate::mutex::MutexCb::prev_mutex_held
    pub(crate) last_mutex_held: Option<MutexId>,

    pub(crate) detached: bool,

    /// The tasks waiting for this task to terminate.
    pub(crate) join_queue: WaitQueueId,
}

impl fmt::Debug for TaskCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("suspended", &self.suspended)
            .field("link", &self.link)
            .field("wait", &self.wait)
            .field("heap_pos", &self.heap_pos)
            .field("last_mutex_held", &self.last_mutex_held)
            .field("detached", &self.detached)
            .finish()
    }
}

impl LinkPool<TaskId> for Slab<TaskCb> {
    #[inline]
    fn link(&self, i: TaskId) -> Option<Link<TaskId>> {
        self.obj(i).link
    }

    #[inline]
    fn set_link(&mut self, i: TaskId, link: Option<Link<TaskId>>) {
        self.obj_mut(i).link = link;
    }
}

/// The builder for [`Task`], created by [`Task::define`].
#[must_use = "call `finish` to create a task"]
pub struct TaskDefiner<Traits> {
    entry: Option<Arc<dyn Fn() + Send + Sync>>,
    priority: usize,
    joinable: bool,
    active: bool,
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits: KernelTraits> Task<Traits> {
    /// Construct a `TaskDefiner` to define a task.
    pub fn define() -> TaskDefiner<Traits> {
        TaskDefiner {
            entry: None,
            priority: 0,
            joinable: true,
            active: false,
            _phantom: PhantomData,
        }
    }

    /// Get the current task (i.e., the task that is assigned to the current
    /// processor and in the Running state).
    ///
    /// Returns `None` if the current context is not a task context.
    pub fn current() -> Result<Option<Self>, GetCurrentTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        if !Traits::is_task_context() {
            return Ok(None);
        }
        Ok(globals(&mut *lock).running_task.map(Self::from_id))
    }

    /// Start the task. The task must be in the Stopped state.
    pub fn start(self) -> Result<(), StartTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        if g.tasks.cb(self.0)?.st != TaskState::Stopped {
            return Err(StartTaskError::QueueOverflow);
        }

        activate::<Traits>(g, self.0);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Terminate the task forcibly.
    ///
    /// The mutexes held by the task are abandoned and passed to their next
    /// waiters. Killing the current task is equivalent to
    /// [`System::exit_task`].
    ///
    /// [`System::exit_task`]: crate::System::exit_task
    pub fn kill(self) -> Result<(), KillTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let st = g.tasks.cb(self.0)?.st;
        if st == TaskState::Stopped {
            return Err(KillTaskError::BadObjectState);
        }

        let is_running = g.running_task == Some(self.0) && st == TaskState::Running;

        if is_running && Traits::is_task_context() {
            drop(lock);
            // Safety: Killing oneself is an explicit request to terminate
            //         without unwinding
            match unsafe { exit_current_task::<Traits>() } {
                Ok(x) => match x {},
                Err(e) => return Err(e.into()),
            }
        }

        log::debug!("killing task {:?}", self.0);
        terminate(g, self.0);

        if is_running {
            // The running task was killed by an interrupt handler. Make sure
            // the port dispatches another task when the handler completes.
            drop(lock);
            // Safety: CPU Lock inactive
            unsafe { Traits::yield_cpu() };
        } else {
            unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// Wait until the task terminates, and then free its control block.
    ///
    /// After this method returns `Ok(())`, the task's id is invalid.
    pub fn join(self, timeout: Timeout) -> Result<(), JoinTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;

        if g.tasks.cb(self.0)?.detached {
            return Err(JoinTaskError::BadObjectState);
        }
        if g.running_task == Some(self.0) && Traits::is_task_context() {
            return Err(JoinTaskError::WouldDeadlock);
        }

        loop {
            let g = globals(&mut *lock);
            let task_cb = g.tasks.obj(self.0);
            if task_cb.st == TaskState::Stopped {
                free_task(g, self.0);
                return Ok(());
            }

            let join_queue = task_cb.join_queue;
            if !wait::is_empty(g, join_queue) {
                return Err(JoinTaskError::BadObjectState);
            }

            if deadline.is_poll() {
                return Err(JoinTaskError::Timeout);
            }

            state::expect_waitable_context::<Traits>()?;

            let (_, result) = wait::wait::<Traits>(
                lock.borrow_mut(),
                Some(join_queue),
                WaitPayload::Join,
                deadline,
            );
            result?;
        }
    }

    /// Detach the task. A detached task's control block is freed as soon as
    /// it terminates (immediately if it's already Stopped).
    pub fn detach(self) -> Result<(), DetachTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let task_cb = g.tasks.cb(self.0)?;
        if task_cb.detached || !wait::is_empty(g, task_cb.join_queue) {
            return Err(DetachTaskError::BadObjectState);
        }

        if task_cb.st == TaskState::Stopped {
            free_task(g, self.0);
        } else {
            g.tasks.obj_mut(self.0).detached = true;
        }
        Ok(())
    }

    /// Suspend the task. A suspended task is not scheduled until
    /// [`resume`](Self::resume) is called. A Waiting task keeps waiting and
    /// becomes Suspended when the wait completes.
    pub fn suspend(self) -> Result<(), SuspendTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let task_cb = g.tasks.cb_mut(self.0)?;
        if task_cb.suspended || task_cb.st == TaskState::Stopped {
            return Err(SuspendTaskError::BadObjectState);
        }
        task_cb.suspended = true;

        match task_cb.st {
            TaskState::Ready => {
                let pri = task_cb.effective_priority;
                task_cb.st = TaskState::Suspended;
                g.ready_queue.remove_task(&mut g.tasks, self.0, pri);
            }
            TaskState::Running => {
                task_cb.st = TaskState::Suspended;
                log::trace!("task {:?} suspended while running", self.0);
                if Traits::is_task_context() {
                    wait_until_running::<Traits>(lock.borrow_mut(), self.0);
                } else {
                    drop(lock);
                    // Safety: CPU Lock inactive
                    unsafe { Traits::yield_cpu() };
                }
            }
            TaskState::Waiting => {}
            TaskState::Suspended | TaskState::Stopped => unreachable!(),
        }

        Ok(())
    }

    /// Resume the task suspended by [`suspend`](Self::suspend).
    pub fn resume(self) -> Result<(), SuspendTaskError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let task_cb = g.tasks.cb_mut(self.0)?;
        if !task_cb.suspended {
            return Err(SuspendTaskError::BadObjectState);
        }
        task_cb.suspended = false;

        if task_cb.st == TaskState::Suspended {
            make_ready(g, self.0);
            unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// Set the task's base priority.
    ///
    /// The effective priority is re-evaluated, taking the priority
    /// inheritance from the mutexes held by the task into account.
    pub fn set_priority(self, priority: usize) -> Result<(), SetTaskPriorityError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        if priority >= g.ready_queue.num_priority_levels() {
            return Err(SetTaskPriorityError::BadParam);
        }

        let task_cb = g.tasks.cb_mut(self.0)?;
        task_cb.base_priority = priority;

        if task_cb.st == TaskState::Stopped {
            task_cb.effective_priority = priority;
        } else {
            mutex::update_effective_priority(g, self.0);
        }

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the task's base priority.
    pub fn priority(self) -> Result<usize, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).tasks.cb(self.0)?.base_priority)
    }

    /// Get the task's effective priority.
    pub fn effective_priority(self) -> Result<usize, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).tasks.cb(self.0)?.effective_priority)
    }

    /// Get the task's state.
    pub fn state(self) -> Result<TaskState, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).tasks.cb(self.0)?.st)
    }
}

impl<Traits: KernelTraits> TaskDefiner<Traits> {
    /// \[**Required**\] Specify the task's entry point.
    pub fn entry(self, entry: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            entry: Some(Arc::new(entry)),
            ..self
        }
    }

    /// Specify the task's initial base priority. Defaults to `0`.
    pub fn priority(self, priority: usize) -> Self {
        Self { priority, ..self }
    }

    /// Specify whether the task is joinable. Defaults to `true`.
    pub fn joinable(self, joinable: bool) -> Self {
        Self { joinable, ..self }
    }

    /// Specify whether the task should be started on creation. Defaults to
    /// `false`.
    pub fn active(self, active: bool) -> Self {
        Self { active, ..self }
    }

    /// Create the task.
    pub fn finish(self) -> Result<Task<Traits>, CreateError> {
        let entry = self.entry.ok_or(CreateError::BadParam)?;

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        if self.priority >= g.ready_queue.num_priority_levels() {
            return Err(CreateError::BadParam);
        }

        let join_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let task = g.tasks.insert_cb(TaskCb {
            entry,
            base_priority: self.priority,
            effective_priority: self.priority,
            st: TaskState::Stopped,
            suspended: false,
            link: None,
            wait: TaskWait::default(),
            heap_pos: HEAP_POS_NONE,
            last_mutex_held: None,
            detached: !self.joinable,
            join_queue,
        });

        log::debug!("created task {:?} (priority {})", task, self.priority);

        if self.active {
            activate::<Traits>(g, task);
            unlock_cpu_and_check_preemption(lock);
        }

        Ok(Task::from_id(task))
    }
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state.
fn activate<Traits: KernelTraits>(g: &mut Globals, task: TaskId) {
    // Safety: CPU Lock active, the task is Stopped
    unsafe { Traits::initialize_task_state(task) };

    let task_cb = g.tasks.obj_mut(task);
    debug_assert_eq!(task_cb.st, TaskState::Stopped);
    task_cb.effective_priority = task_cb.base_priority;
    task_cb.suspended = false;
    task_cb.wait = TaskWait::default();

    make_ready(g, task);
}

/// Transition the task into the Ready state (or Suspended if a suspension is
/// pending) and insert it at the back of its priority level in the ready
/// queue.
///
/// The previous state must be Stopped, Running, Waiting, or Suspended. The
/// task must not be linked to any queue.
pub(crate) fn make_ready(g: &mut Globals, task: TaskId) {
    let task_cb = g.tasks.obj_mut(task);
    if task_cb.suspended {
        task_cb.st = TaskState::Suspended;
        return;
    }

    task_cb.st = TaskState::Ready;
    let pri = task_cb.effective_priority;
    g.ready_queue.push_back_task(&mut g.tasks, task, pri);
}

/// Terminate the task: abandon its mutexes, remove it from any queue, wake up
/// its joiner, and free it if it's detached.
pub(crate) fn terminate(g: &mut Globals, task: TaskId) {
    // Abandon mutexes, waking up the next waiters of the mutexes (if any)
    mutex::abandon_held_mutexes(g, task);
    debug_assert!(g.tasks.obj(task).last_mutex_held.is_none());

    let task_cb = g.tasks.obj(task);
    match task_cb.st {
        TaskState::Waiting => wait::abort_wait(g, task),
        TaskState::Ready => {
            let pri = task_cb.effective_priority;
            g.ready_queue.remove_task(&mut g.tasks, task, pri);
        }
        TaskState::Running | TaskState::Suspended | TaskState::Stopped => {}
    }

    if g.running_task == Some(task) {
        g.running_task = None;
    }

    let task_cb = g.tasks.obj_mut(task);
    task_cb.st = TaskState::Stopped;
    task_cb.suspended = false;
    task_cb.effective_priority = task_cb.base_priority;
    let join_queue = task_cb.join_queue;
    let detached = task_cb.detached;

    wait::wake_up_all(g, join_queue, Ok(()));

    if detached {
        free_task(g, task);
    }
}

/// Free the control block of a Stopped task.
fn free_task(g: &mut Globals, task: TaskId) {
    if let Ok(task_cb) = g.tasks.remove_cb(task) {
        debug_assert_eq!(task_cb.st, TaskState::Stopped);
        wait::free_wait_queue(g, task_cb.join_queue);
        log::debug!("freed task {:?}", task);
    }
}

/// Implements [`System::exit_task`].
///
/// [`System::exit_task`]: crate::System::exit_task
pub(crate) unsafe fn exit_current_task<Traits: KernelTraits>(
) -> Result<Infallible, BadContextError> {
    if !Traits::is_task_context() {
        return Err(BadContextError::BadContext);
    }

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let g = globals(&mut *lock);
    let running_task = g.running_task.unwrap();
    assert_eq!(g.tasks.obj(running_task).st, TaskState::Running);

    log::debug!("task {:?} exiting", running_task);
    terminate(g, running_task);

    core::mem::forget(lock);

    // Safety: (1) The caller acknowledges that all preexisting data on the
    // task stack will be invalidated. (2) CPU Lock active
    unsafe {
        Traits::exit_and_dispatch(running_task);
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// the running task, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let g = globals(&mut *lock);

    let prev_task_priority = match g.running_task {
        Some(task) if g.tasks.obj(task).st == TaskState::Running => {
            if cfg!(feature = "cooperative") {
                // The running task keeps running until it yields or blocks
                return;
            }
            g.tasks.obj(task).effective_priority
        }
        _ => usize::MAX,
    };

    let has_preempting_task = g
        .ready_queue
        .has_ready_task_in_priority_range(..prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `PortToKernel::choose_running_task`.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(g: &mut Globals) {
    // The priority of `running_task`
    let prev_running_task = g.running_task;
    let prev_task_priority = match prev_running_task {
        Some(task) if g.tasks.obj(task).st == TaskState::Running => {
            if cfg!(feature = "cooperative") {
                return;
            }
            g.tasks.obj(task).effective_priority
        }
        _ => usize::MAX,
    };

    // Decide the next task to run
    let next_running_task = match g
        .ready_queue
        .pop_front_task(&mut g.tasks, prev_task_priority)
    {
        ScheduleDecision::SwitchTo(task) => task,
        ScheduleDecision::Keep => return,
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        g.tasks.obj_mut(task).st = TaskState::Running;

        if prev_running_task == Some(task) {
            // The task yielded but is still the best candidate
            timeout::reset_time_slice::<Traits>(g);
            return;
        }
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(task) = prev_running_task {
        if g.tasks.obj(task).st == TaskState::Running {
            // Preempted; goes to the back of its priority level
            make_ready(g, task);
        }
    }

    log::trace!(
        "switching from {:?} to {:?}",
        prev_running_task,
        next_running_task
    );

    g.running_task = next_running_task;
    timeout::reset_time_slice::<Traits>(g);
}

/// Yield the processor until the current task `task` is in the Running state
/// again.
///
/// The caller must have already moved the task out of the Running state.
pub(crate) fn wait_until_running<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if globals(&mut *lock).tasks.obj(task).st == TaskState::Running {
            break;
        }
    }
}

/// Implements [`System::sleep`].
///
/// [`System::sleep`]: crate::System::sleep
pub(crate) fn put_current_task_on_sleep_timeout<Traits: KernelTraits>(
    timeout: Timeout,
) -> Result<(), SleepError> {
    if timeout == Timeout::Forever {
        return Err(SleepError::BadParam);
    }

    let mut lock = lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let deadline = timeout::resolve::<Traits>(globals(&mut *lock), timeout)?;
    if deadline == Deadline::Poll {
        return Ok(());
    }

    let (_, result) = wait::wait::<Traits>(lock.borrow_mut(), None, WaitPayload::Sleep, deadline);
    crate::error::expect_timeout(result);

    Ok(())
}

/// Implements [`System::yield_now`].
///
/// [`System::yield_now`]: crate::System::yield_now
pub(crate) fn yield_current_task<Traits: KernelTraits>() -> Result<(), YieldError> {
    state::expect_task_context::<Traits>()?;
    let mut lock = lock_cpu::<Traits>()?;

    let g = globals(&mut *lock);
    let running_task = g.running_task.unwrap();
    make_ready(g, running_task);

    wait_until_running::<Traits>(lock.borrow_mut(), running_task);
    Ok(())
}
