//! Task ready queue
use alloc::vec::Vec;
use core::{fmt, ops::RangeTo};
use slab::Slab;

use crate::{
    task::{TaskCb, TaskId},
    utils::{
        intrusive_list::{ListAccessor, ListHead},
        PrioBitmap,
    },
};

/// Tracks a list of Ready tasks, sorted by effective priority order.
///
/// The running task is not included in this queue.
pub(crate) struct ReadyQueue {
    /// The set of priorities for which there are one or more Ready tasks.
    bitmap: PrioBitmap,
    queues: Vec<ListHead<TaskId>>,
}

/// The result type of [`ReadyQueue::pop_front_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should not perform context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform context switch to the specified task.
    SwitchTo(T),
}

impl ReadyQueue {
    pub(crate) fn new(num_task_priority_levels: usize) -> Self {
        Self {
            bitmap: PrioBitmap::new(num_task_priority_levels),
            queues: (0..num_task_priority_levels)
                .map(|_| ListHead::new())
                .collect(),
        }
    }

    /// Get the number of priority levels.
    pub(crate) fn num_priority_levels(&self) -> usize {
        self.queues.len()
    }

    /// Return a flag indicating whether there's a task in Ready state whose
    /// priority is in the specified range.
    pub(crate) fn has_ready_task_in_priority_range(&self, range: RangeTo<usize>) -> bool {
        self.bitmap.find_set_before(range.end).is_some()
    }

    /// Insert `task` to the ready queue.
    ///
    /// `task` will be inserted after all tasks having the same priority.
    pub(crate) fn push_back_task(&mut self, tasks: &mut Slab<TaskCb>, task: TaskId, pri: usize) {
        ListAccessor::new(&mut self.queues[pri], tasks).push_back(task);
        self.bitmap.set(pri);
    }

    /// Remove `task` from the ready queue.
    pub(crate) fn remove_task(&mut self, tasks: &mut Slab<TaskCb>, task: TaskId, pri: usize) {
        let mut accessor = ListAccessor::new(&mut self.queues[pri], tasks);
        accessor.remove(task);
        if accessor.is_empty() {
            self.bitmap.clear(pri);
        }
    }

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// priority of the task that would keep running if no switch happened.
    /// If there's no such task, `prev_task_priority` should be `usize::MAX`,
    /// in which case this method will return `SwitchTo(_)`.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    ///
    /// | `prev_task_priority` | Has next task? |        Returns      |
    /// | -------------------- | -------------- | ------------------- |
    /// |   `== usize::MAX`    |       no       |  `SwitchTo(None)`   |
    /// |   `== usize::MAX`    |       yes      | `SwitchTo(Some(_))` |
    /// |   `!= usize::MAX`    |       no       |       `Keep`        |
    /// |   `!= usize::MAX`    |       yes      | `SwitchTo(Some(_))` |
    ///
    /// (A task only counts as "next" here if its priority is strictly higher
    /// than `prev_task_priority`.)
    pub(crate) fn pop_front_task(
        &mut self,
        tasks: &mut Slab<TaskCb>,
        prev_task_priority: usize,
    ) -> ScheduleDecision<Option<TaskId>> {
        // `usize::MAX - 1` never collides with an actual task priority because
        // the number of priority levels is bounded by `PRIO_BITMAP_MAX_LEN`.
        let next_task_priority = self.bitmap.find_set().unwrap_or(usize::MAX - 1);

        if prev_task_priority <= next_task_priority {
            ScheduleDecision::Keep
        } else if next_task_priority < self.queues.len() {
            let mut accessor = ListAccessor::new(&mut self.queues[next_task_priority], tasks);
            // The bitmap says there's at least one element
            let task = accessor.pop_front().unwrap();

            if accessor.is_empty() {
                self.bitmap.clear(next_task_priority);
            }

            ScheduleDecision::SwitchTo(Some(task))
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    /// Reposition `task` after a change in its effective priority from
    /// `old_pri` to `pri`. `task` is re-inserted after all tasks having the
    /// same priority.
    pub(crate) fn reorder_task(
        &mut self,
        tasks: &mut Slab<TaskCb>,
        task: TaskId,
        pri: usize,
        old_pri: usize,
    ) {
        debug_assert_ne!(pri, old_pri);
        self.remove_task(tasks, task, old_pri);
        self.push_back_task(tasks, task, pri);
    }

    /// Iterate over the tasks in the specified priority level.
    #[cfg(test)]
    pub(crate) fn tasks_at<'a>(
        &'a mut self,
        tasks: &'a mut Slab<TaskCb>,
        pri: usize,
    ) -> Vec<TaskId> {
        ListAccessor::new(&mut self.queues[pri], tasks).iter().collect()
    }
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("bitmap", &self.bitmap)
            .field("queues", &self.queues)
            .finish()
    }
}
