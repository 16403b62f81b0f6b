//! The wait/wake protocol shared by all blocking operations
//!
//! A blocking operation puts the current task into a *wait queue* owned by a
//! kernel object, along with a [`WaitPayload`] describing what the task is
//! waiting for. The object's operations look at the payloads of waiting tasks
//! to decide whom to wake up and can update them in place (e.g., to hand over
//! a received message) before calling [`wake_up`].
use alloc::boxed::Box;
use core::{fmt, ptr::NonNull};

use crate::{
    error::WaitError,
    event_flags::EventFlagsWaitFlags,
    klock::CpuLockTokenRefMut,
    mutex,
    state::{globals, Globals, Id, ObjectTable},
    task::{self, TaskId, TaskState},
    timeout::{self, Deadline, TimeoutTarget},
    utils::intrusive_list::{ListAccessor, ListHead},
    KernelTraits,
};

/// The identifier of a wait queue.
pub(crate) type WaitQueueId = Id;

/// Specifies the order in which tasks are woken up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOrder {
    /// The tasks are woken up in the order in which they started waiting.
    Fifo,
    /// The tasks are woken up in the order of their effective priorities.
    /// Tasks with the same priority are woken up in FIFO order.
    TaskPriority,
}

/// A queue of waiting tasks.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    waiters: ListHead<TaskId>,
    order: QueueOrder,
}

/// The waiting state of a task.
pub(crate) struct TaskWait {
    /// The wait queue the task is in. `None` for a sleep or if the task is
    /// not waiting.
    pub(crate) queue: Option<WaitQueueId>,
    pub(crate) payload: Option<WaitPayload>,
    /// The wait result, set by the waker.
    pub(crate) result: Result<(), WaitError>,
}

impl Default for TaskWait {
    fn default() -> Self {
        Self {
            queue: None,
            payload: None,
            result: Ok(()),
        }
    }
}

impl fmt::Debug for TaskWait {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .field("result", &self.result)
            .finish()
    }
}

/// Describes what a waiting task is waiting for.
pub(crate) enum WaitPayload {
    Sleep,
    Join,
    Mutex(mutex::MutexId),
    SemaphoreTake,
    SemaphoreGive,
    Condvar,
    EventFlags {
        bits: u32,
        flags: EventFlagsWaitFlags,
        /// The bits of `bits` not given yet
        remaining: u32,
        /// The matched bits, set by the waker
        result: u32,
    },
    Barrier(Id),
    Timer,
    /// A queue transfer. The buffer belongs to the waiting task, which keeps
    /// it alive while waiting.
    Transfer(Transfer),
    PoolBlock(Option<NonNull<u8>>),
    ListItem(Option<usize>),
    Job(Option<Box<dyn FnOnce() + Send>>),
}

/// The state of a partially-completed queue transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transfer {
    /// The waiting task's buffer.
    pub(crate) ptr: NonNull<u8>,
    /// The length of the buffer, in bytes.
    pub(crate) len: usize,
    /// The number of bytes already transferred.
    pub(crate) done: usize,
}

impl Transfer {
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.len - self.done
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.done == self.len
    }
}

impl fmt::Debug for WaitPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sleep => f.write_str("Sleep"),
            Self::Join => f.write_str("Join"),
            Self::Mutex(mutex) => f.debug_tuple("Mutex").field(mutex).finish(),
            Self::SemaphoreTake => f.write_str("SemaphoreTake"),
            Self::SemaphoreGive => f.write_str("SemaphoreGive"),
            Self::Condvar => f.write_str("Condvar"),
            Self::EventFlags {
                bits,
                flags,
                remaining,
                result,
            } => f
                .debug_struct("EventFlags")
                .field("bits", bits)
                .field("flags", flags)
                .field("remaining", remaining)
                .field("result", result)
                .finish(),
            Self::Barrier(barrier) => f.debug_tuple("Barrier").field(barrier).finish(),
            Self::Timer => f.write_str("Timer"),
            Self::Transfer(transfer) => f.debug_tuple("Transfer").field(transfer).finish(),
            Self::PoolBlock(block) => f.debug_tuple("PoolBlock").field(block).finish(),
            Self::ListItem(item) => f.debug_tuple("ListItem").field(item).finish(),
            Self::Job(job) => f
                .debug_tuple("Job")
                .field(&job.as_ref().map(|_| ()))
                .finish(),
        }
    }
}

// Wait queue management
// ---------------------------------------------------------------------------

/// Create an empty wait queue.
pub(crate) fn new_wait_queue(g: &mut Globals, order: QueueOrder) -> WaitQueueId {
    g.wait_queues.insert_cb(WaitQueue {
        waiters: ListHead::new(),
        order,
    })
}

/// Free a wait queue. The queue must be empty.
pub(crate) fn free_wait_queue(g: &mut Globals, queue: WaitQueueId) {
    let wait_queue = g.wait_queues.remove_cb(queue);
    debug_assert!(matches!(&wait_queue, Ok(q) if q.waiters.is_empty()));
}

#[inline]
fn accessor(
    g: &mut Globals,
    queue: WaitQueueId,
) -> ListAccessor<'_, TaskId, slab::Slab<task::TaskCb>> {
    let Globals {
        wait_queues, tasks, ..
    } = g;
    ListAccessor::new(&mut wait_queues.obj_mut(queue).waiters, tasks)
}

/// Get a flag indicating whether the wait queue is empty.
pub(crate) fn is_empty(g: &Globals, queue: WaitQueueId) -> bool {
    g.wait_queues.obj(queue).waiters.is_empty()
}

/// Get the first waiting task.
pub(crate) fn first_waiting_task(g: &Globals, queue: WaitQueueId) -> Option<TaskId> {
    g.wait_queues.obj(queue).waiters.first
}

/// Iterate over the waiting tasks in the queue order.
pub(crate) fn waiting_tasks(
    g: &Globals,
    queue: WaitQueueId,
) -> impl Iterator<Item = TaskId> + '_ {
    g.wait_queues.obj(queue).waiters.iter(&g.tasks)
}

/// Get the waiting task following `task`.
pub(crate) fn next_waiting_task(
    g: &mut Globals,
    queue: WaitQueueId,
    task: TaskId,
) -> Option<TaskId> {
    accessor(g, queue).next(task)
}

/// Get the payload of a waiting task.
pub(crate) fn payload_mut(g: &mut Globals, task: TaskId) -> &mut WaitPayload {
    g.tasks
        .obj_mut(task)
        .wait
        .payload
        .as_mut()
        .expect("task is not waiting")
}

/// Insert `task` into `queue` according to the queue's order.
pub(crate) fn insert_waiter(g: &mut Globals, queue: WaitQueueId, task: TaskId) {
    let order = g.wait_queues.obj(queue).order;
    let pri = g.tasks.obj(task).effective_priority;

    let mut accessor = accessor(g, queue);

    let insert_at = match order {
        QueueOrder::Fifo => None,
        QueueOrder::TaskPriority => {
            // Insert before the first task with a less urgent priority
            let mut cursor = accessor.front();
            while let Some(next) = cursor {
                if accessor.pool().obj(next).effective_priority > pri {
                    break;
                }
                cursor = accessor.next(next);
            }
            cursor
        }
    };

    accessor.insert(task, insert_at);
}

/// Reposition a waiting task in its wait queue after a change in its
/// effective priority.
pub(crate) fn reorder_wait(g: &mut Globals, task: TaskId) {
    let queue = match g.tasks.obj(task).wait.queue {
        Some(queue) => queue,
        None => return,
    };

    if g.wait_queues.obj(queue).order == QueueOrder::TaskPriority {
        accessor(g, queue).remove(task);
        insert_waiter(g, queue, task);
    }
}

// Waiting
// ---------------------------------------------------------------------------

/// Put the current task into the Waiting state and wait until it's woken up.
/// Returns the (possibly updated) payload and the wait result.
///
/// `deadline` must not be [`Deadline::Poll`]. The caller must have checked
/// that the current context is waitable.
pub(crate) fn wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: Option<WaitQueueId>,
    payload: WaitPayload,
    deadline: Deadline,
) -> (WaitPayload, Result<(), WaitError>) {
    debug_assert_ne!(deadline, Deadline::Poll);

    let g = globals(&mut *lock);
    let task = g.running_task.unwrap();

    let task_cb = g.tasks.obj_mut(task);
    assert_eq!(task_cb.st, TaskState::Running);
    task_cb.st = TaskState::Waiting;
    task_cb.wait = TaskWait {
        queue,
        payload: Some(payload),
        result: Ok(()),
    };

    log::trace!("task {:?} waiting on {:?}", task, queue);

    if let Some(queue) = queue {
        insert_waiter(g, queue, task);
    }

    if let Deadline::At(at) = deadline {
        timeout::insert_timeout::<Traits>(g, TimeoutTarget::Task(task), at);
    }

    task::wait_until_running::<Traits>(lock.borrow_mut(), task);

    let task_wait = core::mem::take(&mut globals(&mut *lock).tasks.obj_mut(task).wait);
    (task_wait.payload.unwrap(), task_wait.result)
}

// Waking up
// ---------------------------------------------------------------------------

/// Finish the wait of a task that has already been removed from its wait
/// queue, and make it Ready.
fn complete_wait(g: &mut Globals, task: TaskId, result: Result<(), WaitError>) {
    let task_cb = g.tasks.obj_mut(task);
    debug_assert_eq!(task_cb.st, TaskState::Waiting);
    debug_assert!(task_cb.link.is_none());
    task_cb.wait.queue = None;
    task_cb.wait.result = result;

    timeout::remove_timeout(g, TimeoutTarget::Task(task));

    task::make_ready(g, task);
}

/// Remove `task` from its wait queue and wake it up with `result`.
pub(crate) fn wake_up(g: &mut Globals, task: TaskId, result: Result<(), WaitError>) {
    if let Some(queue) = g.tasks.obj(task).wait.queue {
        accessor(g, queue).remove(task);
    }
    complete_wait(g, task, result);
}

/// Wake up the first waiting task with `result`. Returns the woken task.
pub(crate) fn wake_up_one(
    g: &mut Globals,
    queue: WaitQueueId,
    result: Result<(), WaitError>,
) -> Option<TaskId> {
    let task = accessor(g, queue).pop_front()?;
    complete_wait(g, task, result);
    Some(task)
}

/// Wake up all waiting tasks with `result`. Returns the number of woken
/// tasks.
pub(crate) fn wake_up_all(
    g: &mut Globals,
    queue: WaitQueueId,
    result: Result<(), WaitError>,
) -> usize {
    let mut count = 0;
    while wake_up_one(g, queue, result).is_some() {
        count += 1;
    }
    count
}

/// Visit waiting tasks in the queue order, waking up each task for which
/// `f` returns `true`.
pub(crate) fn wake_up_all_conditional(
    g: &mut Globals,
    queue: WaitQueueId,
    mut f: impl FnMut(&mut WaitPayload) -> bool,
) {
    let mut cursor = first_waiting_task(g, queue);
    while let Some(task) = cursor {
        cursor = next_waiting_task(g, queue, task);
        if f(payload_mut(g, task)) {
            wake_up(g, task, Ok(()));
        }
    }
}

/// Interrupt the wait of a task (e.g., because of a timeout), undoing the
/// effects of its waiting on the waited object.
pub(crate) fn interrupt_task(g: &mut Globals, task: TaskId, result: Result<(), WaitError>) {
    debug_assert_eq!(g.tasks.obj(task).st, TaskState::Waiting);
    withdraw(g, task);
    complete_wait(g, task, result);
}

/// Abort the wait of a task being terminated. The task is left in no queue.
pub(crate) fn abort_wait(g: &mut Globals, task: TaskId) {
    withdraw(g, task);
    timeout::remove_timeout(g, TimeoutTarget::Task(task));
    g.tasks.obj_mut(task).wait = TaskWait::default();
}

/// Remove a waiting task from its wait queue and let the waited object react
/// to its departure.
fn withdraw(g: &mut Globals, task: TaskId) {
    let queue = match g.tasks.obj(task).wait.queue {
        Some(queue) => queue,
        None => return,
    };
    accessor(g, queue).remove(task);
    g.tasks.obj_mut(task).wait.queue = None;

    let (mutex, barrier) = match payload_mut(g, task) {
        &mut WaitPayload::Mutex(mutex) => (Some(mutex), None),
        &mut WaitPayload::Barrier(barrier) => (None, Some(barrier)),
        _ => (None, None),
    };

    if let Some(mutex) = mutex {
        // The task no longer boosts the mutex owner
        if let Some(owner) = g.mutexes.obj(mutex).owner {
            mutex::update_effective_priority(g, owner);
        }
    }

    if let Some(barrier) = barrier {
        g.barriers.obj_mut(barrier).arrived -= 1;
    }
}
