//! Event flags
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
    /// Represents a single set of event flags in a system.
    ///
    /// Event flags are a 32-bit register. Tasks wait for some of its bits to
    /// become set.
    pub struct EventFlags;
}

/// The type of the event flags register.
pub type EventFlagsBits = u32;

bitflags::bitflags! {
    /// Options for [`EventFlags::wait`].
    pub struct EventFlagsWaitFlags: u8 {
        /// Wait for all of the specified bits to be set. Without this flag,
        /// any of them is enough.
        const ALL = 1 << 0;

        /// Clear the matched bits after waiting for them.
        const CLEAR = 1 << 1;

        /// Only count bits set after the wait began.
        const NEW_ONLY = 1 << 2;
    }
}

/// *Event flags control block* - the state data of event flags.
#[derive(Debug)]
pub(crate) struct EventFlagsCb {
    bits: EventFlagsBits,
    wait_queue: WaitQueueId,
}

impl<Traits: KernelTraits> EventFlags<Traits> {
    /// Create event flags with the specified initial register value.
    pub fn new(initial: EventFlagsBits) -> Result<Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let event_flags = g.event_flags.insert_cb(EventFlagsCb {
            bits: initial,
            wait_queue,
        });
        log::debug!("created event flags {:?}", event_flags);
        Ok(Self::from_id(event_flags))
    }

    /// Set the specified bits and wake up the tasks whose conditions are
    /// satisfied.
    pub fn set(self, bits: EventFlagsBits) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.event_flags.cb(self.0)?;
        set_unchecked(g, self.0, bits);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Clear the specified bits.
    pub fn clear(self, bits: EventFlagsBits) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;
        globals(&mut *lock).event_flags.cb_mut(self.0)?.bits &= !bits;
        Ok(())
    }

    /// Get the register value.
    pub fn get(self) -> Result<EventFlagsBits, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).event_flags.cb(self.0)?.bits)
    }

    /// Wait for the bits in `mask` to be set as specified by `flags`. Returns
    /// the matched bits.
    pub fn wait(
        self,
        mask: EventFlagsBits,
        flags: EventFlagsWaitFlags,
        timeout: Timeout,
    ) -> Result<EventFlagsBits, WaitObjectError> {
        if mask == 0 {
            return Err(WaitObjectError::BadParam);
        }

        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let event_flags_cb = g.event_flags.cb_mut(self.0)?;

        if !flags.contains(EventFlagsWaitFlags::NEW_ONLY) {
            let candidate = event_flags_cb.bits & mask;
            if is_satisfied(mask, flags, candidate) {
                if flags.contains(EventFlagsWaitFlags::CLEAR) {
                    event_flags_cb.bits &= !candidate;
                }
                return Ok(candidate);
            }
        }

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        let remaining = if flags.contains(EventFlagsWaitFlags::NEW_ONLY) {
            mask
        } else {
            mask & !event_flags_cb.bits
        };
        let wait_queue = event_flags_cb.wait_queue;
        state::expect_waitable_context::<Traits>()?;
        let (payload, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::EventFlags {
                bits: mask,
                flags,
                remaining,
                result: 0,
            },
            deadline,
        );
        result?;

        match payload {
            WaitPayload::EventFlags { result, .. } => Ok(result),
            _ => unreachable!(),
        }
    }

    /// Clear the register and fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.event_flags.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the event flags and free the id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.event_flags.cb(self.0)?;
        kill_inner(g, self.0);
        let event_flags_cb = g.event_flags.remove_cb(self.0)?;
        wait::free_wait_queue(g, event_flags_cb.wait_queue);
        log::debug!("deleted event flags {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

#[inline]
fn is_satisfied(
    mask: EventFlagsBits,
    flags: EventFlagsWaitFlags,
    candidate: EventFlagsBits,
) -> bool {
    if flags.contains(EventFlagsWaitFlags::ALL) {
        candidate == mask
    } else {
        candidate != 0
    }
}

/// OR `set_bits` into the register and wake up the satisfied waiters in
/// arrival order. Bits consumed by a waiter are invisible to the later ones.
///
/// A waiter remembers which bits of its mask it has been given, so a bit
/// cleared after being set still counts toward its condition.
fn set_unchecked(g: &mut Globals, event_flags: Id, set_bits: EventFlagsBits) {
    let event_flags_cb = g.event_flags.obj(event_flags);
    let mut bits = event_flags_cb.bits | set_bits;
    let wait_queue = event_flags_cb.wait_queue;

    wait::wake_up_all_conditional(g, wait_queue, |payload| {
        let (mask, flags, remaining, result) = match payload {
            WaitPayload::EventFlags {
                bits: mask,
                flags,
                remaining,
                result,
            } => (*mask, *flags, remaining, result),
            _ => unreachable!(),
        };

        *remaining &= !(set_bits & bits);
        let candidate = mask & !*remaining;

        if !is_satisfied(mask, flags, candidate) {
            return false;
        }

        if flags.contains(EventFlagsWaitFlags::CLEAR) {
            bits &= !candidate;
        }
        *result = candidate;
        true
    });

    g.event_flags.obj_mut(event_flags).bits = bits;
}

fn kill_inner(g: &mut Globals, event_flags: Id) {
    let event_flags_cb = g.event_flags.obj_mut(event_flags);
    event_flags_cb.bits = 0;
    let wait_queue = event_flags_cb.wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
}
