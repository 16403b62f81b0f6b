use core::{mem, slice};

use crate::{
    error::{CreateError, DeleteError, KillError, QueryError, WaitObjectError},
    queue,
    timeout::Timeout,
    KernelTraits,
};

define_object_handle! {
    /// Represents a single message queue in a system.
    ///
    /// A message queue is a bounded FIFO queue of messages, each consisting
    /// of a fixed number of machine words.
    pub struct MessageQueue;
}

fn as_bytes(words: &[usize]) -> &[u8] {
    // Safety: `usize` has no padding bytes
    unsafe { slice::from_raw_parts(words.as_ptr().cast(), mem::size_of_val(words)) }
}

fn as_bytes_mut(words: &mut [usize]) -> &mut [u8] {
    // Safety: `usize` has no padding bytes, and any bit pattern is a valid
    //         `usize`
    unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast(), mem::size_of_val(words)) }
}

impl<Traits: KernelTraits> MessageQueue<Traits> {
    /// Create a message queue holding up to `limit` messages of
    /// `words_per_message` words each. Both must be non-zero.
    pub fn new(words_per_message: usize, limit: usize) -> Result<Self, CreateError> {
        let message_size = words_per_message
            .checked_mul(mem::size_of::<usize>())
            .ok_or(CreateError::BadParam)?;
        queue::create::<Traits>(message_size, limit).map(Self::from_id)
    }

    /// Send a message, blocking while the queue is full. `message` must be
    /// exactly `words_per_message` words long.
    pub fn send(self, message: &[usize], timeout: Timeout) -> Result<(), WaitObjectError> {
        queue::send::<Traits>(self.0, as_bytes(message), timeout, false).map(drop)
    }

    /// Receive a message, blocking while the queue is empty. `buf` must be
    /// exactly `words_per_message` words long.
    pub fn recv(self, buf: &mut [usize], timeout: Timeout) -> Result<(), WaitObjectError> {
        queue::recv::<Traits>(self.0, as_bytes_mut(buf), timeout, false).map(drop)
    }

    /// Get the number of stored messages.
    pub fn len(self) -> Result<usize, QueryError> {
        queue::len::<Traits>(self.0)
    }

    /// Get the maximum number of stored messages.
    pub fn capacity(self) -> Result<usize, QueryError> {
        queue::capacity::<Traits>(self.0)
    }

    /// Discard the stored messages and fail all waiting tasks with
    /// `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        queue::kill::<Traits>(self.0)
    }

    /// [Kill](Self::kill) the message queue and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        queue::delete::<Traits>(self.0)
    }
}
