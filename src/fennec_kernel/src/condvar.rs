//! Condition variables
use crate::{
    error::{
        CreateError, DeleteError, KillError, LockMutexError, UpdateError, WaitCondvarError,
        WaitError,
    },
    klock::lock_cpu,
    mutex::{self, Mutex},
    state::{self, globals, Globals, Id, ObjectTable},
    task,
    timeout::{self, Deadline, Timeout},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

define_object_handle! {
    /// Represents a single condition variable in a system.
    ///
    /// A condition variable is used together with a [`Mutex`] protecting the
    /// condition.
    pub struct Condvar;
}

/// *Condition variable control block* - the state data of a condition
/// variable.
#[derive(Debug)]
pub(crate) struct CondvarCb {
    wait_queue: WaitQueueId,
}

impl<Traits: KernelTraits> Condvar<Traits> {
    /// Create a condition variable.
    pub fn new(order: QueueOrder) -> Result<Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, order);
        let condvar = g.condvars.insert_cb(CondvarCb { wait_queue });
        log::debug!("created condvar {:?}", condvar);
        Ok(Self::from_id(condvar))
    }

    /// Release `mutex`, block until the condition variable is signaled, and
    /// then re-acquire `mutex`.
    ///
    /// The current task must own `mutex`. All recursion levels are released
    /// and restored. The mutex is re-acquired even if the wait times out.
    pub fn wait(self, mutex: Mutex<Traits>, timeout: Timeout) -> Result<(), WaitCondvarError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        state::expect_waitable_context::<Traits>()?;

        let wait_queue = g.condvars.cb(self.0)?.wait_queue;
        let mutex_cb = g.mutexes.cb(mutex.id())?;
        let running_task = g.running_task.unwrap();
        if mutex_cb.owner != Some(running_task) {
            return Err(WaitCondvarError::NotOwner);
        }

        if deadline.is_poll() {
            return Err(WaitCondvarError::Timeout);
        }

        let count = mutex::release_for_condvar(g, mutex.id(), running_task)
            .ok_or(WaitCondvarError::NotOwner)?;

        let (_, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::Condvar,
            deadline,
        );

        match mutex::lock_inner::<Traits>(lock.borrow_mut(), mutex.id(), Deadline::Forever) {
            Ok(()) => {}
            Err(LockMutexError::BadId) => return Err(WaitCondvarError::BadId),
            Err(LockMutexError::Stopped) => return Err(WaitCondvarError::Stopped),
            Err(e) => unreachable!("unexpected relock failure: {:?}", e),
        }
        globals(&mut *lock).mutexes.obj_mut(mutex.id()).count = count;

        Ok(result?)
    }

    /// Wake up one waiting task.
    pub fn signal(self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = g.condvars.cb(self.0)?.wait_queue;
        wait::wake_up_one(g, wait_queue, Ok(()));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake up all waiting tasks.
    pub fn broadcast(self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = g.condvars.cb(self.0)?.wait_queue;
        wait::wake_up_all(g, wait_queue, Ok(()));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.condvars.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the condition variable and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.condvars.cb(self.0)?;
        kill_inner(g, self.0);
        let condvar_cb = g.condvars.remove_cb(self.0)?;
        wait::free_wait_queue(g, condvar_cb.wait_queue);
        log::debug!("deleted condvar {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

fn kill_inner(g: &mut Globals, condvar: Id) {
    let wait_queue = g.condvars.obj(condvar).wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
}
