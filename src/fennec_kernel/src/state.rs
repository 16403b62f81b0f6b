//! The kernel-global state
use alloc::sync::Arc;
use core::{fmt, num::NonZeroUsize};
use slab::Slab;

use crate::{
    barrier, condvar,
    dispatch,
    error::{BadContextError, BadIdError},
    event_flags, klock, list, mutex, pool, queue, semaphore,
    task::{self, readyqueue::ReadyQueue, TaskId},
    timeout, timer, wait, KernelCfg, KernelTraits,
};

/// The type of object identifiers.
///
/// An identifier is an index into one of the kernel's object tables, offset by
/// one so that `Option<Id>` is as compact as `Id`.
pub type Id = NonZeroUsize;

#[inline]
pub(crate) fn id_from_key(key: usize) -> Id {
    Id::new(key.wrapping_add(1)).expect("object table is full")
}

#[inline]
pub(crate) fn key_from_id(id: Id) -> usize {
    id.get() - 1
}

/// Extends [`Slab`] with accessors taking [`Id`]s.
pub(crate) trait ObjectTable<T> {
    fn cb(&self, id: Id) -> Result<&T, BadIdError>;
    fn cb_mut(&mut self, id: Id) -> Result<&mut T, BadIdError>;
    fn insert_cb(&mut self, cb: T) -> Id;
    fn remove_cb(&mut self, id: Id) -> Result<T, BadIdError>;

    /// Get the object for an `id` known to be live. Panics otherwise.
    fn obj(&self, id: Id) -> &T;
    fn obj_mut(&mut self, id: Id) -> &mut T;
}

impl<T> ObjectTable<T> for Slab<T> {
    #[inline]
    fn cb(&self, id: Id) -> Result<&T, BadIdError> {
        self.get(key_from_id(id)).ok_or(BadIdError::BadId)
    }

    #[inline]
    fn cb_mut(&mut self, id: Id) -> Result<&mut T, BadIdError> {
        self.get_mut(key_from_id(id)).ok_or(BadIdError::BadId)
    }

    #[inline]
    fn insert_cb(&mut self, cb: T) -> Id {
        id_from_key(self.insert(cb))
    }

    #[inline]
    fn remove_cb(&mut self, id: Id) -> Result<T, BadIdError> {
        self.try_remove(key_from_id(id)).ok_or(BadIdError::BadId)
    }

    #[inline]
    fn obj(&self, id: Id) -> &T {
        &self[key_from_id(id)]
    }

    #[inline]
    fn obj_mut(&mut self, id: Id) -> &mut T {
        &mut self[key_from_id(id)]
    }
}

/// Global kernel state.
///
/// One instance exists per kernel trait type. [`KernelCfg::state`] returns a
/// reference to it.
pub struct State<Traits> {
    globals: klock::CpuLockCell<Traits, Globals>,
}

// Safety: The contents are only accessed with CPU Lock active, which
//         serializes all accesses on a single-processor system.
unsafe impl<Traits> Send for State<Traits> {}
unsafe impl<Traits> Sync for State<Traits> {}

impl<Traits: KernelCfg> State<Traits> {
    /// Construct the initial state.
    pub fn new() -> Self {
        Self {
            globals: klock::CpuLockCell::new(Globals::new(Traits::NUM_TASK_PRIORITY_LEVELS)),
        }
    }
}

impl<Traits: KernelCfg> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> State<Traits> {
    /// Get the currently running task.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. Only meant to be called by a port.
    pub unsafe fn running_task(&'static self) -> Option<TaskId> {
        // Safety: CPU Lock active, and the port doesn't hold a guard
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let running_task = self.globals.read(&*lock).running_task;
        core::mem::forget(lock);
        running_task
    }

    /// Get the entry point of the specified task.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. Only meant to be called by a port.
    pub unsafe fn task_entry(&'static self, task: TaskId) -> Option<Arc<dyn Fn() + Send + Sync>> {
        // Safety: CPU Lock active, and the port doesn't hold a guard
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let entry = ObjectTable::cb(&self.globals.read(&*lock).tasks, task)
            .ok()
            .map(|task_cb| Arc::clone(&task_cb.entry));
        core::mem::forget(lock);
        entry
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("globals", &self.globals)
            .finish()
    }
}

/// The contents of [`State`], protected by CPU Lock.
pub(crate) struct Globals {
    /// The currently or recently running task. Can be in a Running, Waiting,
    /// Suspended, or Stopped state.
    pub(crate) running_task: Option<TaskId>,
    pub(crate) ready_queue: ReadyQueue,
    pub(crate) timeout: timeout::TimeoutGlobals,
    pub(crate) tasks: Slab<task::TaskCb>,
    pub(crate) wait_queues: Slab<wait::WaitQueue>,
    pub(crate) mutexes: Slab<mutex::MutexCb>,
    pub(crate) semaphores: Slab<semaphore::SemaphoreCb>,
    pub(crate) condvars: Slab<condvar::CondvarCb>,
    pub(crate) event_flags: Slab<event_flags::EventFlagsCb>,
    pub(crate) barriers: Slab<barrier::BarrierCb>,
    pub(crate) timers: Slab<timer::TimerCb>,
    pub(crate) queues: Slab<queue::QueueCb>,
    pub(crate) pools: Slab<pool::PoolCb>,
    pub(crate) lists: Slab<list::ListCb>,
    pub(crate) dispatch_queues: Slab<dispatch::DispatchQueueCb>,
}

impl Globals {
    pub(crate) fn new(num_task_priority_levels: usize) -> Self {
        Self {
            running_task: None,
            ready_queue: ReadyQueue::new(num_task_priority_levels),
            timeout: timeout::TimeoutGlobals::new(),
            tasks: Slab::new(),
            wait_queues: Slab::new(),
            mutexes: Slab::new(),
            semaphores: Slab::new(),
            condvars: Slab::new(),
            event_flags: Slab::new(),
            barriers: Slab::new(),
            timers: Slab::new(),
            queues: Slab::new(),
            pools: Slab::new(),
            lists: Slab::new(),
            dispatch_queues: Slab::new(),
        }
    }
}

impl fmt::Debug for Globals {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Globals")
            .field("running_task", &self.running_task)
            .field("ready_queue", &self.ready_queue)
            .field("timeout", &self.timeout)
            .field("tasks", &self.tasks.len())
            .field("wait_queues", &self.wait_queues.len())
            .field("mutexes", &self.mutexes.len())
            .field("semaphores", &self.semaphores.len())
            .field("condvars", &self.condvars.len())
            .field("event_flags", &self.event_flags.len())
            .field("barriers", &self.barriers.len())
            .field("timers", &self.timers.len())
            .field("queues", &self.queues.len())
            .field("pools", &self.pools.len())
            .field("lists", &self.lists.len())
            .field("dispatch_queues", &self.dispatch_queues.len())
            .finish()
    }
}

/// Borrow the kernel-global state.
#[inline]
pub(crate) fn globals<Traits: KernelCfg>(lock: &mut klock::CpuLockToken<Traits>) -> &mut Globals {
    Traits::state().globals.write(lock)
}

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    expect_task_context::<Traits>()
}
