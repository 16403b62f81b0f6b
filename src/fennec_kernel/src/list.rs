//! Kernel-protected lists
use alloc::collections::VecDeque;

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

define_object_handle! {
    /// Represents a single list in a system.
    ///
    /// A list holds word-sized items. [`pop_front`](Self::pop_front) blocks
    /// while the list is empty, and an item pushed while tasks are waiting is
    /// handed directly to the oldest one.
    pub struct List;
}

/// *List control block* - the state data of a list.
#[derive(Debug)]
pub(crate) struct ListCb {
    items: VecDeque<usize>,
    wait_queue: WaitQueueId,
}

impl<Traits: KernelTraits> List<Traits> {
    /// Create an empty list.
    pub fn new() -> Result<Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let list = g.lists.insert_cb(ListCb {
            items: VecDeque::new(),
            wait_queue,
        });
        log::debug!("created list {:?}", list);
        Ok(Self::from_id(list))
    }

    /// Append an item to the back.
    pub fn push_back(self, item: usize) -> Result<(), UpdateError> {
        self.push(item, VecDeque::push_back)
    }

    /// Prepend an item to the front.
    pub fn push_front(self, item: usize) -> Result<(), UpdateError> {
        self.push(item, VecDeque::push_front)
    }

    fn push(
        self,
        item: usize,
        insert: fn(&mut VecDeque<usize>, usize),
    ) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = g.lists.cb(self.0)?.wait_queue;

        match wait::first_waiting_task(g, wait_queue) {
            Some(waiter) => {
                // The list is empty if someone is waiting
                *wait::payload_mut(g, waiter) = WaitPayload::ListItem(Some(item));
                wait::wake_up(g, waiter, Ok(()));
                task::unlock_cpu_and_check_preemption(lock);
            }
            None => insert(&mut g.lists.obj_mut(self.0).items, item),
        }
        Ok(())
    }

    /// Remove and return the front item, blocking while the list is empty.
    pub fn pop_front(self, timeout: Timeout) -> Result<usize, WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let list_cb = g.lists.cb_mut(self.0)?;

        if let Some(item) = list_cb.items.pop_front() {
            return Ok(item);
        }

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        let wait_queue = list_cb.wait_queue;
        state::expect_waitable_context::<Traits>()?;
        let (payload, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::ListItem(None),
            deadline,
        );
        result?;

        match payload {
            WaitPayload::ListItem(Some(item)) => Ok(item),
            _ => unreachable!(),
        }
    }

    /// Remove the first occurrence of `item`. Returns `true` if it was found.
    pub fn remove(self, item: usize) -> Result<bool, UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let items = &mut globals(&mut *lock).lists.cb_mut(self.0)?.items;
        match items.iter().position(|&x| x == item) {
            Some(i) => {
                items.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Get the number of items.
    pub fn len(self) -> Result<usize, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).lists.cb(self.0)?.items.len())
    }

    /// Remove all items and fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.lists.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the list and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.lists.cb(self.0)?;
        kill_inner(g, self.0);
        let list_cb = g.lists.remove_cb(self.0)?;
        wait::free_wait_queue(g, list_cb.wait_queue);
        log::debug!("deleted list {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

fn kill_inner(g: &mut Globals, list: Id) {
    let list_cb = g.lists.obj_mut(list);
    list_cb.items.clear();
    let wait_queue = list_cb.wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
}
