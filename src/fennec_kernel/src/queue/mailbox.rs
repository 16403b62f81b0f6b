use crate::{
    error::{CreateError, DeleteError, KillError, QueryError, WaitObjectError},
    queue,
    timeout::Timeout,
    KernelTraits,
};

define_object_handle! {
    /// Represents a single mailbox in a system.
    ///
    /// A mailbox is a bounded FIFO queue of fixed-size byte records.
    pub struct Mailbox;
}

impl<Traits: KernelTraits> Mailbox<Traits> {
    /// Create a mailbox holding up to `limit` records of `record_size`
    /// bytes each. Both must be non-zero.
    pub fn new(record_size: usize, limit: usize) -> Result<Self, CreateError> {
        queue::create::<Traits>(record_size, limit).map(Self::from_id)
    }

    /// Send a record, blocking while the mailbox is full. `record` must be
    /// exactly `record_size` bytes long.
    pub fn send(self, record: &[u8], timeout: Timeout) -> Result<(), WaitObjectError> {
        queue::send::<Traits>(self.0, record, timeout, false).map(drop)
    }

    /// Receive a record, blocking while the mailbox is empty. `buf` must be
    /// exactly `record_size` bytes long.
    pub fn recv(self, buf: &mut [u8], timeout: Timeout) -> Result<(), WaitObjectError> {
        queue::recv::<Traits>(self.0, buf, timeout, false).map(drop)
    }

    /// Get the number of stored records.
    pub fn len(self) -> Result<usize, QueryError> {
        queue::len::<Traits>(self.0)
    }

    /// Get the maximum number of stored records.
    pub fn capacity(self) -> Result<usize, QueryError> {
        queue::capacity::<Traits>(self.0)
    }

    /// Discard the stored records and fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        queue::kill::<Traits>(self.0)
    }

    /// [Kill](Self::kill) the mailbox and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        queue::delete::<Traits>(self.0)
    }
}
