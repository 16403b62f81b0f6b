//! Bounded communication queues
//!
//! [`Mailbox`], [`MessageQueue`], and [`StreamBuffer`] share one algorithm
//! operating on a circular buffer of `limit` *units*, each `unit` bytes long.
//! A record queue (mailbox, message queue) transfers exactly one unit per
//! operation. A stream has one-byte units and transfers any number of them,
//! possibly across several partial steps.
//!
//! Receivers only wait while the buffer is empty, and senders only wait while
//! it's full. Data moves directly between a waiting task's buffer and the
//! active party whenever possible:
//!
//!  - A sender finding a waiting receiver copies into the receiver's buffer.
//!  - A receiver that frees space refills it from the oldest waiting sender's
//!    buffer.
//!
//! A waiting task is woken up once its whole request has moved.
use alloc::{boxed::Box, vec};
use core::{fmt, ptr::NonNull, slice};

use crate::{
    error::{CreateError, DeleteError, KillError, QueryError, WaitError, WaitObjectError},
    klock::lock_cpu,
    state::{self, globals, Globals, Id, ObjectTable},
    task::{self, TaskId},
    timeout::{self, Timeout},
    wait::{self, QueueOrder, Transfer, WaitPayload, WaitQueueId},
    KernelTraits,
};

mod mailbox;
mod message;
mod stream;
pub use self::{mailbox::*, message::*, stream::*};

/// The identifier of a queue.
pub(crate) type QueueId = Id;

/// *Queue control block* - the state data of a queue.
#[derive(Debug)]
pub(crate) struct QueueCb {
    unit: usize,
    ring: RingBuf,
    send_wait: WaitQueueId,
    recv_wait: WaitQueueId,
}

/// A circular byte buffer.
pub(crate) struct RingBuf {
    buf: Box<[u8]>,
    /// The byte offset of the first byte.
    head: usize,
    /// The number of stored bytes.
    len: usize,
}

impl RingBuf {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Append `src` to the back. `src` must fit in the free space.
    pub(crate) fn write(&mut self, src: &[u8]) {
        assert!(src.len() <= self.free());
        let cap = self.buf.len();
        if cap == 0 {
            return;
        }

        let tail = (self.head + self.len) % cap;
        let first = src.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&src[..first]);
        self.buf[..src.len() - first].copy_from_slice(&src[first..]);
        self.len += src.len();
    }

    /// Remove `dst.len()` bytes from the front into `dst`.
    pub(crate) fn read(&mut self, dst: &mut [u8]) {
        assert!(dst.len() <= self.len);
        let cap = self.buf.len();
        if cap == 0 {
            return;
        }

        let first = dst.len().min(cap - self.head);
        let rest = dst.len() - first;
        dst[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        dst[first..].copy_from_slice(&self.buf[..rest]);
        self.head = (self.head + dst.len()) % cap;
        self.len -= dst.len();
    }

    pub(crate) fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl fmt::Debug for RingBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RingBuf")
            .field("capacity", &self.buf.len())
            .field("head", &self.head)
            .field("len", &self.len)
            .finish()
    }
}

// Transfer buffers
// ---------------------------------------------------------------------------
//
// A `Transfer` points to the buffer of a task that is inside `send` or
// `recv`. The buffer stays borrowed by that task until the call returns, and
// the call doesn't return before the task is removed from the wait queue, so
// the pointer is valid whenever the transfer is reachable from a wait queue.

/// The untransferred part of a sender's buffer.
///
/// # Safety
///
/// `t` must describe a live buffer.
#[inline]
unsafe fn pending_src(t: &Transfer, n: usize) -> &[u8] {
    debug_assert!(n <= t.remaining());
    unsafe { slice::from_raw_parts(t.ptr.as_ptr().add(t.done), n) }
}

/// The unfilled part of a receiver's buffer.
///
/// # Safety
///
/// `t` must describe a live buffer obtained from a `&mut [u8]`, and no other
/// reference to the buffer may exist.
#[inline]
unsafe fn pending_dst(t: &mut Transfer, n: usize) -> &mut [u8] {
    debug_assert!(n <= t.remaining());
    unsafe { slice::from_raw_parts_mut(t.ptr.as_ptr().add(t.done), n) }
}

/// Round `bytes` down to a multiple of `unit`.
#[inline]
fn whole_units(bytes: usize, unit: usize) -> usize {
    bytes - bytes % unit
}

fn transfer_mut(g: &mut Globals, task: TaskId) -> &mut Transfer {
    match wait::payload_mut(g, task) {
        WaitPayload::Transfer(transfer) => transfer,
        _ => unreachable!(),
    }
}

/// Copy `n` bytes from `src` to `dst`.
fn copy_between(src: &mut Transfer, dst: &mut Transfer, n: usize) {
    // Safety: Both transfers describe live buffers of two different tasks
    unsafe { pending_dst(dst, n).copy_from_slice(pending_src(src, n)) };
    src.done += n;
    dst.done += n;
}

// The algorithm
// ---------------------------------------------------------------------------

/// Move data out of the sender's transfer `src`: first to the waiting
/// receivers, then into the buffer.
fn push(g: &mut Globals, queue: QueueId, src: &mut Transfer) {
    while !src.is_complete() {
        let queue_cb = g.queues.obj(queue);
        let unit = queue_cb.unit;

        if queue_cb.ring.is_empty() {
            if let Some(receiver) = wait::first_waiting_task(g, queue_cb.recv_wait) {
                let dst = transfer_mut(g, receiver);
                let n = whole_units(src.remaining().min(dst.remaining()), unit);
                if n == 0 {
                    return;
                }
                copy_between(src, dst, n);
                if dst.is_complete() {
                    wait::wake_up(g, receiver, Ok(()));
                }
                continue;
            }
        }

        let ring = &mut g.queues.obj_mut(queue).ring;
        let n = whole_units(src.remaining().min(ring.free()), unit);
        if n > 0 {
            // Safety: `src` is the current task's buffer
            ring.write(unsafe { pending_src(src, n) });
            src.done += n;
        }
        return;
    }
}

/// Move data into the receiver's transfer `dst`: from the buffer (refilling
/// it from the waiting senders), or directly from the oldest waiting sender.
fn pull(g: &mut Globals, queue: QueueId, dst: &mut Transfer) {
    while !dst.is_complete() {
        let queue_cb = g.queues.obj_mut(queue);
        let unit = queue_cb.unit;
        let send_wait = queue_cb.send_wait;

        if !queue_cb.ring.is_empty() {
            let n = whole_units(dst.remaining().min(queue_cb.ring.len()), unit);
            if n == 0 {
                return;
            }
            // Safety: `dst` is the current task's buffer
            queue_cb.ring.read(unsafe { pending_dst(dst, n) });
            dst.done += n;
            refill(g, queue);
            continue;
        }

        match wait::first_waiting_task(g, send_wait) {
            Some(sender) => {
                let src = transfer_mut(g, sender);
                let n = whole_units(src.remaining().min(dst.remaining()), unit);
                if n == 0 {
                    return;
                }
                copy_between(src, dst, n);
                if src.is_complete() {
                    wait::wake_up(g, sender, Ok(()));
                }
            }
            None => return,
        }
    }
}

/// Move data from the waiting senders into the buffer's free space.
fn refill(g: &mut Globals, queue: QueueId) {
    loop {
        let send_wait = g.queues.obj(queue).send_wait;
        let sender = match wait::first_waiting_task(g, send_wait) {
            Some(sender) => sender,
            None => return,
        };

        let Globals { queues, tasks, .. } = &mut *g;
        let queue_cb = queues.obj_mut(queue);
        let src = match &mut tasks.obj_mut(sender).wait.payload {
            Some(WaitPayload::Transfer(transfer)) => transfer,
            _ => unreachable!(),
        };

        let n = whole_units(src.remaining().min(queue_cb.ring.free()), queue_cb.unit);
        if n == 0 {
            return;
        }
        // Safety: `src` belongs to a waiting sender
        queue_cb.ring.write(unsafe { pending_src(src, n) });
        src.done += n;

        if src.is_complete() {
            wait::wake_up(g, sender, Ok(()));
        } else {
            return;
        }
    }
}

/// Convert the outcome of a blocking transfer to the number of moved bytes.
fn finish_transfer(
    payload: WaitPayload,
    result: Result<(), WaitError>,
    partial: bool,
) -> Result<usize, WaitObjectError> {
    let transfer = match payload {
        WaitPayload::Transfer(transfer) => transfer,
        _ => unreachable!(),
    };
    match result {
        Ok(()) => Ok(transfer.done),
        Err(WaitError::Timeout) if partial && transfer.done > 0 => Ok(transfer.done),
        Err(e) => Err(e.into()),
    }
}

// Operations shared by the queue types
// ---------------------------------------------------------------------------

pub(crate) fn create<Traits: KernelTraits>(unit: usize, limit: usize) -> Result<QueueId, CreateError> {
    if unit == 0 || limit == 0 {
        return Err(CreateError::BadParam);
    }
    let capacity = unit.checked_mul(limit).ok_or(CreateError::BadParam)?;

    let mut lock = lock_cpu::<Traits>()?;
    let g = globals(&mut *lock);
    let send_wait = wait::new_wait_queue(g, QueueOrder::Fifo);
    let recv_wait = wait::new_wait_queue(g, QueueOrder::Fifo);
    let queue = g.queues.insert_cb(QueueCb {
        unit,
        ring: RingBuf::new(capacity),
        send_wait,
        recv_wait,
    });
    log::debug!("created queue {:?} ({} x {} bytes)", queue, limit, unit);
    Ok(queue)
}

/// Send `data`. A record queue (`partial == false`) only accepts exactly one
/// unit. Returns the number of bytes sent.
pub(crate) fn send<Traits: KernelTraits>(
    queue: QueueId,
    data: &[u8],
    timeout: Timeout,
    partial: bool,
) -> Result<usize, WaitObjectError> {
    let mut lock = lock_cpu::<Traits>()?;
    let g = globals(&mut *lock);
    let deadline = timeout::resolve::<Traits>(g, timeout)?;
    let queue_cb = g.queues.cb(queue)?;
    if !partial && data.len() != queue_cb.unit {
        return Err(WaitObjectError::BadParam);
    }
    let send_wait = queue_cb.send_wait;
    if !deadline.is_poll() {
        state::expect_waitable_context::<Traits>()?;
    }

    let mut transfer = Transfer {
        ptr: NonNull::from(data).cast(),
        len: data.len(),
        done: 0,
    };

    // Don't overtake the senders already waiting
    if wait::is_empty(g, send_wait) {
        push(g, queue, &mut transfer);
    }

    if transfer.is_complete() || deadline.is_poll() {
        task::unlock_cpu_and_check_preemption(lock);
        let result = if transfer.is_complete() {
            Ok(())
        } else {
            Err(WaitError::Timeout)
        };
        return finish_transfer(WaitPayload::Transfer(transfer), result, partial);
    }

    let (payload, result) = wait::wait::<Traits>(
        lock.borrow_mut(),
        Some(send_wait),
        WaitPayload::Transfer(transfer),
        deadline,
    );
    finish_transfer(payload, result, partial)
}

/// Receive into `buf`. A record queue (`partial == false`) only accepts a
/// buffer of exactly one unit. Returns the number of bytes received.
pub(crate) fn recv<Traits: KernelTraits>(
    queue: QueueId,
    buf: &mut [u8],
    timeout: Timeout,
    partial: bool,
) -> Result<usize, WaitObjectError> {
    let mut lock = lock_cpu::<Traits>()?;
    let g = globals(&mut *lock);
    let deadline = timeout::resolve::<Traits>(g, timeout)?;
    let queue_cb = g.queues.cb(queue)?;
    if !partial && buf.len() != queue_cb.unit {
        return Err(WaitObjectError::BadParam);
    }
    let recv_wait = queue_cb.recv_wait;
    if !deadline.is_poll() {
        state::expect_waitable_context::<Traits>()?;
    }

    let len = buf.len();
    let mut transfer = Transfer {
        ptr: NonNull::from(buf).cast(),
        len,
        done: 0,
    };

    // Don't overtake the receivers already waiting
    if wait::is_empty(g, recv_wait) {
        pull(g, queue, &mut transfer);
    }

    if transfer.is_complete() || deadline.is_poll() {
        task::unlock_cpu_and_check_preemption(lock);
        let result = if transfer.is_complete() {
            Ok(())
        } else {
            Err(WaitError::Timeout)
        };
        return finish_transfer(WaitPayload::Transfer(transfer), result, partial);
    }

    let (payload, result) = wait::wait::<Traits>(
        lock.borrow_mut(),
        Some(recv_wait),
        WaitPayload::Transfer(transfer),
        deadline,
    );
    finish_transfer(payload, result, partial)
}

/// Get the number of stored units.
pub(crate) fn len<Traits: KernelTraits>(queue: QueueId) -> Result<usize, QueryError> {
    let mut lock = lock_cpu::<Traits>()?;
    let queue_cb = globals(&mut *lock).queues.cb(queue)?;
    Ok(queue_cb.ring.len() / queue_cb.unit)
}

/// Get the capacity in units.
pub(crate) fn capacity<Traits: KernelTraits>(queue: QueueId) -> Result<usize, QueryError> {
    let mut lock = lock_cpu::<Traits>()?;
    let queue_cb = globals(&mut *lock).queues.cb(queue)?;
    Ok(queue_cb.ring.buf.len() / queue_cb.unit)
}

pub(crate) fn kill<Traits: KernelTraits>(queue: QueueId) -> Result<(), KillError> {
    let mut lock = lock_cpu::<Traits>()?;
    let g = globals(&mut *lock);
    g.queues.cb(queue)?;
    kill_inner(g, queue);
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

pub(crate) fn delete<Traits: KernelTraits>(queue: QueueId) -> Result<(), DeleteError> {
    let mut lock = lock_cpu::<Traits>()?;
    let g = globals(&mut *lock);
    g.queues.cb(queue)?;
    kill_inner(g, queue);
    let queue_cb = g.queues.remove_cb(queue)?;
    wait::free_wait_queue(g, queue_cb.send_wait);
    wait::free_wait_queue(g, queue_cb.recv_wait);
    log::debug!("deleted queue {:?}", queue);
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

fn kill_inner(g: &mut Globals, queue: QueueId) {
    let queue_cb = g.queues.obj_mut(queue);
    queue_cb.ring.clear();
    let (send_wait, recv_wait) = (queue_cb.send_wait, queue_cb.recv_wait);
    wait::wake_up_all(g, send_wait, Err(WaitError::Stopped));
    wait::wake_up_all(g, recv_wait, Err(WaitError::Stopped));
    log::debug!("killed queue {:?}", queue);
}
