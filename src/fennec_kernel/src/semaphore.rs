//! Semaphores
use crate::{
    error::{CreateError, DeleteError, KillError, QueryError, WaitError, WaitObjectError},
    klock::lock_cpu,
    state::{self, globals, Globals, Id, ObjectTable},
    task,
    timeout::{self, Timeout},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

define_object_handle! {
    /// Represents a single counting semaphore in a system.
    ///
    /// The count stays within `0..=limit`. [`wait`](Self::wait) blocks while
    /// the count is zero, and [`signal`](Self::signal) blocks while the count
    /// is at the limit.
    pub struct Semaphore;
}

/// The type of semaphore counter values.
pub type SemaphoreValue = usize;

/// *Semaphore control block* - the state data of a semaphore.
#[derive(Debug)]
pub(crate) struct SemaphoreCb {
    count: SemaphoreValue,
    limit: SemaphoreValue,
    initial: SemaphoreValue,

    /// The tasks waiting for a permit (if `count == 0`) or for room (if
    /// `count == limit`). Never both.
    wait_queue: WaitQueueId,
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Create a semaphore.
    ///
    /// `limit` must be non-zero, and `initial` must not exceed `limit`.
    pub fn new(
        initial: SemaphoreValue,
        limit: SemaphoreValue,
        order: QueueOrder,
    ) -> Result<Self, CreateError> {
        if limit == 0 || initial > limit {
            return Err(CreateError::BadParam);
        }

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, order);
        let semaphore = g.semaphores.insert_cb(SemaphoreCb {
            count: initial,
            limit,
            initial,
            wait_queue,
        });
        log::debug!("created semaphore {:?} ({}/{})", semaphore, initial, limit);
        Ok(Self::from_id(semaphore))
    }

    /// Acquire a permit, blocking until one is available.
    pub fn wait(self, timeout: Timeout) -> Result<(), WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let semaphore_cb = g.semaphores.cb_mut(self.0)?;

        if semaphore_cb.count > 0 {
            take_unchecked(g, self.0);
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        let wait_queue = semaphore_cb.wait_queue;
        state::expect_waitable_context::<Traits>()?;
        let (_, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::SemaphoreTake,
            deadline,
        );
        Ok(result?)
    }

    /// Release a permit, blocking while the count is at the limit.
    pub fn signal(self, timeout: Timeout) -> Result<(), WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let semaphore_cb = g.semaphores.cb_mut(self.0)?;

        if semaphore_cb.count < semaphore_cb.limit {
            give_unchecked(g, self.0);
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        let wait_queue = semaphore_cb.wait_queue;
        state::expect_waitable_context::<Traits>()?;
        let (_, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::SemaphoreGive,
            deadline,
        );
        Ok(result?)
    }

    /// Get the current count.
    pub fn count(self) -> Result<SemaphoreValue, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).semaphores.cb(self.0)?.count)
    }

    /// Fail all waiting tasks with `Stopped` and reset the count to its
    /// initial value.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.semaphores.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the semaphore and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.semaphores.cb(self.0)?;
        kill_inner(g, self.0);
        let semaphore_cb = g.semaphores.remove_cb(self.0)?;
        wait::free_wait_queue(g, semaphore_cb.wait_queue);
        log::debug!("deleted semaphore {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Take a permit from a semaphore with a non-zero count. If a task is
/// waiting to give a permit (the count was at the limit), its permit fills
/// the freed slot.
fn take_unchecked(g: &mut Globals, semaphore: Id) {
    let semaphore_cb = g.semaphores.obj_mut(semaphore);
    debug_assert!(semaphore_cb.count > 0);
    let wait_queue = semaphore_cb.wait_queue;

    if wait::wake_up_one(g, wait_queue, Ok(())).is_none() {
        g.semaphores.obj_mut(semaphore).count -= 1;
    }
}

/// Give a permit to a semaphore whose count is below the limit. If a task is
/// waiting for a permit (the count was zero), the permit goes directly to
/// it.
fn give_unchecked(g: &mut Globals, semaphore: Id) {
    let semaphore_cb = g.semaphores.obj_mut(semaphore);
    debug_assert!(semaphore_cb.count < semaphore_cb.limit);
    let wait_queue = semaphore_cb.wait_queue;

    if wait::wake_up_one(g, wait_queue, Ok(())).is_none() {
        g.semaphores.obj_mut(semaphore).count += 1;
    }
}

fn kill_inner(g: &mut Globals, semaphore: Id) {
    let semaphore_cb = g.semaphores.obj_mut(semaphore);
    semaphore_cb.count = semaphore_cb.initial;
    let wait_queue = semaphore_cb.wait_queue;
    let num_woken = wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
    log::debug!("killed semaphore {:?} ({} waiters)", semaphore, num_woken);
}
