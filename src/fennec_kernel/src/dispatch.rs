//! Dispatch queues
use alloc::{boxed::Box, collections::VecDeque};
use core::fmt;

use crate::{
    error::{
        CreateError, DeleteError, KillError, QueryError, UpdateError, WaitError, WaitObjectError,
    },
    klock::lock_cpu,
    state::{self, globals, Globals, Id, ObjectTable},
    task,
    timeout::{self, Timeout},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

/// A unit of work submitted to a [`DispatchQueue`].
pub type Job = Box<dyn FnOnce() + Send>;

define_object_handle! {
    /// Represents a single dispatch queue in a system.
    ///
    /// A dispatch queue is a FIFO queue of jobs (closures) executed by worker
    /// tasks calling [`serve`](Self::serve).
    pub struct DispatchQueue;
}

/// *Dispatch queue control block* - the state data of a dispatch queue.
pub(crate) struct DispatchQueueCb {
    jobs: VecDeque<Job>,
    /// The idle workers.
    wait_queue: WaitQueueId,
}

impl fmt::Debug for DispatchQueueCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DispatchQueueCb")
            .field("jobs", &self.jobs.len())
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> DispatchQueue<Traits> {
    /// Create an empty dispatch queue.
    pub fn new() -> Result<Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let dispatch_queue = g.dispatch_queues.insert_cb(DispatchQueueCb {
            jobs: VecDeque::new(),
            wait_queue,
        });
        log::debug!("created dispatch queue {:?}", dispatch_queue);
        Ok(Self::from_id(dispatch_queue))
    }

    /// Submit a job. An idle worker receives it directly.
    pub fn dispatch(self, job: impl FnOnce() + Send + 'static) -> Result<(), UpdateError> {
        let job: Job = Box::new(job);

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = g.dispatch_queues.cb(self.0)?.wait_queue;

        match wait::first_waiting_task(g, wait_queue) {
            Some(worker) => {
                *wait::payload_mut(g, worker) = WaitPayload::Job(Some(job));
                wait::wake_up(g, worker, Ok(()));
                task::unlock_cpu_and_check_preemption(lock);
            }
            None => g.dispatch_queues.obj_mut(self.0).jobs.push_back(job),
        }
        Ok(())
    }

    /// Take the next job, blocking while there's none, and run it with CPU
    /// Lock released.
    pub fn serve(self, timeout: Timeout) -> Result<(), WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let dispatch_queue_cb = g.dispatch_queues.cb_mut(self.0)?;

        let job = match dispatch_queue_cb.jobs.pop_front() {
            Some(job) => job,
            None => {
                if deadline.is_poll() {
                    return Err(WaitObjectError::Timeout);
                }

                let wait_queue = dispatch_queue_cb.wait_queue;
                state::expect_waitable_context::<Traits>()?;
                let (payload, result) = wait::wait::<Traits>(
                    lock.borrow_mut(),
                    Some(wait_queue),
                    WaitPayload::Job(None),
                    deadline,
                );
                result?;

                match payload {
                    WaitPayload::Job(Some(job)) => job,
                    _ => unreachable!(),
                }
            }
        };

        drop(lock);
        job();
        Ok(())
    }

    /// Get the number of jobs waiting for a worker.
    pub fn pending(self) -> Result<usize, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).dispatch_queues.cb(self.0)?.jobs.len())
    }

    /// Drop all pending jobs and fail all idle workers with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.dispatch_queues.cb(self.0)?;
        let jobs = kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);

        // Run the destructors outside the critical section
        drop(jobs);
        Ok(())
    }

    /// [Kill](Self::kill) the dispatch queue and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.dispatch_queues.cb(self.0)?;
        let jobs = kill_inner(g, self.0);
        let dispatch_queue_cb = g.dispatch_queues.remove_cb(self.0)?;
        wait::free_wait_queue(g, dispatch_queue_cb.wait_queue);
        log::debug!("deleted dispatch queue {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);

        drop(jobs);
        Ok(())
    }
}

fn kill_inner(g: &mut Globals, dispatch_queue: Id) -> VecDeque<Job> {
    let dispatch_queue_cb = g.dispatch_queues.obj_mut(dispatch_queue);
    let jobs = core::mem::take(&mut dispatch_queue_cb.jobs);
    let wait_queue = dispatch_queue_cb.wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
    log::debug!(
        "killed dispatch queue {:?} ({} jobs dropped)",
        dispatch_queue,
        jobs.len()
    );
    jobs
}
