//! Mutexes
//!
//! Mutexes implement the priority inheritance protocol. While a task waits on
//! a mutex, the mutex's owner runs at an effective priority at least as
//! urgent as the waiting task's. The boost propagates transitively when the
//! owner is itself waiting on another mutex.
use crate::{
    error::{
        CreateError, DeleteError, KillError, LockMutexError, QueryError, UnlockMutexError,
    },
    klock::{lock_cpu, CpuLockTokenRefMut},
    state::{self, globals, Globals, Id, ObjectTable},
    task::{self, Task, TaskId, TaskState},
    timeout::{self, Deadline, Timeout},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

/// The identifier of a mutex.
pub(crate) type MutexId = Id;

define_object_handle! {
    /// Represents a single mutex in a system.
    ///
    /// Waiting tasks are granted the ownership in FIFO order. The owner's
    /// effective priority is raised to the most urgent effective priority
    /// among the tasks waiting on the mutexes it holds.
    pub struct Mutex;
}

/// Specifies the behavior of a mutex when it's locked by its owner or
/// unlocked by a task other than its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexPolicy {
    /// Relocking by the owner fails with `WouldDeadlock`. Unlocking by a
    /// non-owner fails with `NotOwner`.
    ErrorCheck,
    /// Relocking by the owner blocks. Any task can unlock a locked mutex.
    Normal,
    /// Relocking by the owner increments the lock count, and the mutex is
    /// released after as many unlocks.
    Recursive,
}

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb {
    pub(crate) owner: Option<TaskId>,

    /// The number of times the owner relocked the mutex (for
    /// [`MutexPolicy::Recursive`]).
    pub(crate) count: u32,

    policy: MutexPolicy,

    wait_queue: WaitQueueId,

    /// The previous mutex in the owner's list of held mutexes.
    pub(crate) prev_mutex_held: Option<MutexId>,
}

impl core::fmt::Debug for MutexCb {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("MutexCb")
            .field("owner", &self.owner)
            .field("count", &self.count)
            .field("policy", &self.policy)
            .field("wait_queue", &self.wait_queue)
            .field("prev_mutex_held", &self.prev_mutex_held)
            .finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Create a mutex.
    pub fn new(policy: MutexPolicy) -> Result<Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let mutex = g.mutexes.insert_cb(MutexCb {
            owner: None,
            count: 0,
            policy,
            wait_queue,
            prev_mutex_held: None,
        });
        log::debug!("created mutex {:?} ({:?})", mutex, policy);
        Ok(Self::from_id(mutex))
    }

    /// Acquire the mutex, blocking the current task until it can do so or
    /// `timeout` expires. [`Timeout::Poll`] makes this a `try_lock`.
    pub fn lock(self, timeout: Timeout) -> Result<(), LockMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        let deadline = timeout::resolve::<Traits>(globals(&mut *lock), timeout)?;
        state::expect_task_context::<Traits>()?;
        lock_inner::<Traits>(lock.borrow_mut(), self.0, deadline)
    }

    /// Release the mutex.
    pub fn unlock(self) -> Result<(), UnlockMutexError> {
        let mut lock = lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        let g = globals(&mut *lock);
        let running_task = g.running_task.unwrap();

        let mutex_cb = g.mutexes.cb_mut(self.0)?;
        let owner = mutex_cb.owner.ok_or(UnlockMutexError::NotOwner)?;
        if owner != running_task && mutex_cb.policy != MutexPolicy::Normal {
            return Err(UnlockMutexError::NotOwner);
        }

        if mutex_cb.count > 0 {
            mutex_cb.count -= 1;
            return Ok(());
        }

        unlock_unchecked(g, self.0);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get a flag indicating whether the mutex is locked.
    pub fn is_locked(self) -> Result<bool, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).mutexes.cb(self.0)?.owner.is_some())
    }

    /// Get the task owning the mutex.
    pub fn owner(self) -> Result<Option<Task<Traits>>, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock)
            .mutexes
            .cb(self.0)?
            .owner
            .map(Task::from_id))
    }

    /// Release the mutex forcibly and fail all waiting tasks with
    /// `Stopped`. The mutex remains usable.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.mutexes.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the mutex and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.mutexes.cb(self.0)?;
        kill_inner(g, self.0);
        let mutex_cb = g.mutexes.obj(self.0);
        let wait_queue = mutex_cb.wait_queue;
        g.mutexes.remove_cb(self.0)?;
        wait::free_wait_queue(g, wait_queue);
        log::debug!("deleted mutex {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Lock the mutex on behalf of the running task.
///
/// The caller must have checked that the current context is a task context.
pub(crate) fn lock_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: MutexId,
    deadline: Deadline,
) -> Result<(), LockMutexError> {
    let g = globals(&mut *lock);
    let running_task = g.running_task.unwrap();

    let mutex_cb = g.mutexes.cb_mut(mutex)?;
    let (owner, policy, wait_queue) = (mutex_cb.owner, mutex_cb.policy, mutex_cb.wait_queue);

    let owner = match owner {
        None => {
            acquire(g, mutex, running_task);
            return Ok(());
        }
        Some(owner) if owner == running_task => match policy {
            MutexPolicy::Recursive => {
                let mutex_cb = g.mutexes.obj_mut(mutex);
                mutex_cb.count = mutex_cb.count.saturating_add(1);
                return Ok(());
            }
            MutexPolicy::ErrorCheck => return Err(LockMutexError::WouldDeadlock),
            MutexPolicy::Normal => owner,
        },
        Some(owner) => owner,
    };

    if deadline.is_poll() {
        return Err(LockMutexError::Timeout);
    }

    // Lend our priority to the owner
    let pri = g.tasks.obj(running_task).effective_priority;
    boost_effective_priority(g, owner, pri);

    let (_, result) = wait::wait::<Traits>(
        lock.borrow_mut(),
        Some(wait_queue),
        WaitPayload::Mutex(mutex),
        deadline,
    );
    result?;

    // The unlocker has handed the ownership over to us
    debug_assert_eq!(
        globals(&mut *lock).mutexes.obj(mutex).owner,
        Some(running_task)
    );

    Ok(())
}

/// Make `task` the owner of the unowned `mutex`.
fn acquire(g: &mut Globals, mutex: MutexId, task: TaskId) {
    let task_cb = g.tasks.obj_mut(task);
    let prev_mutex_held = task_cb.last_mutex_held.replace(mutex);

    let mutex_cb = g.mutexes.obj_mut(mutex);
    debug_assert!(mutex_cb.owner.is_none());
    mutex_cb.owner = Some(task);
    mutex_cb.count = 0;
    mutex_cb.prev_mutex_held = prev_mutex_held;
}

/// Remove `mutex` from `task`'s list of held mutexes.
fn remove_from_held_list(g: &mut Globals, task: TaskId, mutex: MutexId) {
    let mut prev: Option<MutexId> = None;
    let mut cursor = g.tasks.obj(task).last_mutex_held;

    while let Some(held) = cursor {
        let next = g.mutexes.obj(held).prev_mutex_held;
        if held == mutex {
            match prev {
                None => g.tasks.obj_mut(task).last_mutex_held = next,
                Some(prev) => g.mutexes.obj_mut(prev).prev_mutex_held = next,
            }
            g.mutexes.obj_mut(mutex).prev_mutex_held = None;
            return;
        }
        prev = Some(held);
        cursor = next;
    }

    unreachable!("mutex {:?} is not held by task {:?}", mutex, task);
}

/// Release the locked `mutex` regardless of its lock count, and pass the
/// ownership to the oldest waiting task.
///
/// This might make a task Ready. The caller should check for preemption.
pub(crate) fn unlock_unchecked(g: &mut Globals, mutex: MutexId) {
    let mutex_cb = g.mutexes.obj_mut(mutex);
    let owner = mutex_cb.owner.take().expect("mutex is not locked");
    mutex_cb.count = 0;
    let wait_queue = mutex_cb.wait_queue;

    remove_from_held_list(g, owner, mutex);

    if let Some(next_owner) = wait::first_waiting_task(g, wait_queue) {
        log::trace!("mutex {:?} handed over to task {:?}", mutex, next_owner);
        acquire(g, mutex, next_owner);
        wait::wake_up(g, next_owner, Ok(()));
        // Inherit the boosts of the remaining waiters
        update_effective_priority(g, next_owner);
    }

    update_effective_priority(g, owner);
}

/// Release all mutexes held by `task`, which is being terminated.
pub(crate) fn abandon_held_mutexes(g: &mut Globals, task: TaskId) {
    while let Some(mutex) = g.tasks.obj(task).last_mutex_held {
        log::trace!("task {:?} abandoning mutex {:?}", task, mutex);
        unlock_unchecked(g, mutex);
    }
}

fn kill_inner(g: &mut Globals, mutex: MutexId) {
    let wait_queue = g.mutexes.obj(mutex).wait_queue;
    wait::wake_up_all(g, wait_queue, Err(crate::WaitError::Stopped));

    let mutex_cb = g.mutexes.obj_mut(mutex);
    mutex_cb.count = 0;
    if let Some(owner) = mutex_cb.owner.take() {
        remove_from_held_list(g, owner, mutex);
        update_effective_priority(g, owner);
    }
    log::debug!("killed mutex {:?}", mutex);
}

/// Save the lock count of `mutex` and release it for a condition variable
/// wait. Returns `None` if the running task doesn't own the mutex.
pub(crate) fn release_for_condvar(g: &mut Globals, mutex: MutexId, task: TaskId) -> Option<u32> {
    let mutex_cb = g.mutexes.obj(mutex);
    if mutex_cb.owner != Some(task) {
        return None;
    }
    let count = mutex_cb.count;
    unlock_unchecked(g, mutex);
    Some(count)
}

// Priority inheritance
// ---------------------------------------------------------------------------

/// Calculate the effective priority of `task` from scratch.
fn evaluate_effective_priority(g: &Globals, task: TaskId) -> usize {
    let task_cb = g.tasks.obj(task);
    let mut pri = task_cb.base_priority;

    let mut cursor = task_cb.last_mutex_held;
    while let Some(mutex) = cursor {
        let mutex_cb = g.mutexes.obj(mutex);
        for waiter in wait::waiting_tasks(g, mutex_cb.wait_queue) {
            pri = pri.min(g.tasks.obj(waiter).effective_priority);
        }
        cursor = mutex_cb.prev_mutex_held;
    }

    pri
}

/// Set the effective priority of `task` and reposition it in the queue it's
/// in. If `task` is waiting on a mutex, return the mutex's owner, whose
/// effective priority may depend on `task`'s.
fn set_effective_priority(g: &mut Globals, task: TaskId, pri: usize) -> Option<TaskId> {
    let task_cb = g.tasks.obj_mut(task);
    let old_pri = task_cb.effective_priority;
    task_cb.effective_priority = pri;

    let st = task_cb.st;
    let waited_mutex = match (&task_cb.wait.queue, &task_cb.wait.payload) {
        (Some(_), Some(WaitPayload::Mutex(mutex))) => Some(*mutex),
        _ => None,
    };

    match st {
        TaskState::Ready => {
            g.ready_queue.reorder_task(&mut g.tasks, task, pri, old_pri);
            None
        }
        TaskState::Waiting => {
            wait::reorder_wait(g, task);
            waited_mutex.and_then(|mutex| g.mutexes.obj(mutex).owner)
        }
        _ => None,
    }
}

/// Re-evaluate the effective priority of `task` and propagate the change
/// through the chain of mutex owners.
pub(crate) fn update_effective_priority(g: &mut Globals, task: TaskId) {
    let mut cursor = Some(task);

    // A wait chain can't be longer than the number of tasks
    for _ in 0..=g.tasks.len() {
        let task = match cursor {
            Some(task) => task,
            None => return,
        };

        let pri = evaluate_effective_priority(g, task);
        if pri == g.tasks.obj(task).effective_priority {
            return;
        }

        log::trace!("task {:?}: effective priority -> {}", task, pri);
        cursor = set_effective_priority(g, task, pri);
    }
}

/// Raise the effective priority of `task` to at least `pri` and propagate
/// the change through the chain of mutex owners.
fn boost_effective_priority(g: &mut Globals, task: TaskId, pri: usize) {
    let mut cursor = Some(task);

    for _ in 0..=g.tasks.len() {
        let task = match cursor {
            Some(task) => task,
            None => return,
        };

        if g.tasks.obj(task).effective_priority <= pri {
            return;
        }

        log::trace!("task {:?}: boosted to {}", task, pri);
        cursor = set_effective_priority(g, task, pri);
    }
}
