//! Barriers
use crate::{
    error::{CreateError, DeleteError, KillError, WaitError, WaitObjectError},
    klock::lock_cpu,
    state::{self, globals, Globals, Id, ObjectTable},
    task,
    timeout::{self, Timeout},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

define_object_handle! {
    /// Represents a single barrier in a system.
    ///
    /// A barrier blocks tasks until the specified number of tasks (*parties*)
    /// have arrived at it, and then releases all of them at once. The barrier
    /// is reset for the next round.
    pub struct Barrier;
}

/// The result of [`Barrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    /// `true` for exactly one task in each round: the one whose arrival
    /// released the others.
    pub is_leader: bool,
}

/// *Barrier control block* - the state data of a barrier.
#[derive(Debug)]
pub(crate) struct BarrierCb {
    parties: usize,
    /// The number of tasks waiting on the barrier.
    pub(crate) arrived: usize,
    wait_queue: WaitQueueId,
}

impl<Traits: KernelTraits> Barrier<Traits> {
    /// Create a barrier for `parties` tasks. `parties` must be non-zero.
    pub fn new(parties: usize) -> Result<Self, CreateError> {
        if parties == 0 {
            return Err(CreateError::BadParam);
        }

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let barrier = g.barriers.insert_cb(BarrierCb {
            parties,
            arrived: 0,
            wait_queue,
        });
        log::debug!("created barrier {:?} ({} parties)", barrier, parties);
        Ok(Self::from_id(barrier))
    }

    /// Arrive at the barrier and wait for the other parties.
    ///
    /// A task whose wait times out withdraws its arrival.
    pub fn wait(self, timeout: Timeout) -> Result<BarrierWaitResult, WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let barrier_cb = g.barriers.cb_mut(self.0)?;

        if barrier_cb.arrived + 1 >= barrier_cb.parties {
            // We are the last one
            barrier_cb.arrived = 0;
            let wait_queue = barrier_cb.wait_queue;
            wait::wake_up_all(g, wait_queue, Ok(()));
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(BarrierWaitResult { is_leader: true });
        }

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        state::expect_waitable_context::<Traits>()?;

        let barrier_cb = g.barriers.obj_mut(self.0);
        barrier_cb.arrived += 1;
        let wait_queue = barrier_cb.wait_queue;

        let (_, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::Barrier(self.0),
            deadline,
        );
        result?;

        Ok(BarrierWaitResult { is_leader: false })
    }

    /// Reset the barrier and fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.barriers.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the barrier and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.barriers.cb(self.0)?;
        kill_inner(g, self.0);
        let barrier_cb = g.barriers.remove_cb(self.0)?;
        wait::free_wait_queue(g, barrier_cb.wait_queue);
        log::debug!("deleted barrier {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

fn kill_inner(g: &mut Globals, barrier: Id) {
    let barrier_cb = g.barriers.obj_mut(barrier);
    barrier_cb.arrived = 0;
    let wait_queue = barrier_cb.wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
}
