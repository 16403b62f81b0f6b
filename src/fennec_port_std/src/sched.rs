//! The baton that serializes the threads of a simulated system.
//!
//! Every thread managed by the port (the boot thread and one thread per
//! task) and the dispatcher (the thread that called [`run`]) only run while
//! they hold the baton. Exactly one of them holds it at any point, which
//! makes the simulation deterministic.
//!
//! [`run`]: crate::run
use fennec_kernel::TaskId;
use std::{
    any::Any,
    collections::BTreeMap,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

/// Identifies a thread spawned by the port.
pub(crate) type Serial = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holder {
    Dispatcher,
    Thread(Serial),
}

/// The error returned by [`Sched::wait_for_baton`] when the waiting thread
/// will never be given the baton and must exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evicted;

pub(crate) struct Sched {
    st: Mutex<SchedState>,
    cond: Condvar,
}

pub(crate) struct SchedState {
    pub(crate) holder: Holder,
    /// `true` if the simulated processor is in a CPU Lock state.
    pub(crate) cpu_lock: bool,
    /// The virtual time.
    pub(crate) now: u64,
    /// The virtual time when the timer interrupt is delivered next.
    pub(crate) tick_at: Option<u64>,
    /// The threads currently associated with tasks.
    pub(crate) task_threads: BTreeMap<TaskId, Serial>,
    /// The threads dissociated from their tasks without completing.
    orphans: Vec<Serial>,
    pub(crate) shutdown: bool,
    /// The panic payload of the first thread that panicked.
    pub(crate) panic: Option<Box<dyn Any + Send>>,
    next_serial: Serial,
}

impl SchedState {
    pub(crate) fn alloc_serial(&mut self) -> Serial {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    #[inline]
    pub(crate) fn is_tick_due(&self) -> bool {
        self.tick_at.map_or(false, |at| at <= self.now)
    }

    /// Dissociate the task's thread (if any) from the task. The thread exits
    /// the next time it's woken up.
    pub(crate) fn orphan_task_thread(&mut self, task: TaskId) -> Option<Serial> {
        let serial = self.task_threads.remove(&task)?;
        self.orphans.push(serial);
        Some(serial)
    }

    fn is_evicted(&self, serial: Serial) -> bool {
        self.shutdown || self.orphans.contains(&serial)
    }
}

impl Sched {
    pub(crate) const fn new() -> Self {
        Self {
            st: Mutex::new(SchedState {
                holder: Holder::Dispatcher,
                cpu_lock: false,
                now: 0,
                tick_at: None,
                task_threads: BTreeMap::new(),
                orphans: Vec::new(),
                shutdown: false,
                panic: None,
                next_serial: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        // A thread panicking while holding the lock doesn't leave the state
        // inconsistent
        self.st.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pass the baton to `holder`.
    pub(crate) fn hand_over(&self, st: &mut SchedState, holder: Holder) {
        log::trace!("baton: {:?} -> {:?}", st.holder, holder);
        st.holder = holder;
        self.cond.notify_all();
    }

    /// Wake up the waiting threads so that evicted ones can exit.
    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Block the current thread `me` until it's given the baton.
    pub(crate) fn wait_for_baton<'a>(
        &'a self,
        mut st: MutexGuard<'a, SchedState>,
        me: Serial,
    ) -> Result<MutexGuard<'a, SchedState>, Evicted> {
        loop {
            if st.is_evicted(me) {
                return Err(Evicted);
            }
            if st.holder == Holder::Thread(me) {
                return Ok(st);
            }
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block the dispatcher until it's given the baton.
    pub(crate) fn wait_for_dispatcher<'a>(
        &'a self,
        mut st: MutexGuard<'a, SchedState>,
    ) -> MutexGuard<'a, SchedState> {
        while st.holder != Holder::Dispatcher {
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st
    }
}
