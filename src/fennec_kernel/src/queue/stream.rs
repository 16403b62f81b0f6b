use crate::{
    error::{CreateError, DeleteError, KillError, QueryError, WaitObjectError},
    queue,
    timeout::Timeout,
    KernelTraits,
};

define_object_handle! {
    /// Represents a single stream buffer in a system.
    ///
    /// A stream buffer is a bounded byte pipe. Transfers may complete in
    /// several partial steps.
    pub struct StreamBuffer;
}

impl<Traits: KernelTraits> StreamBuffer<Traits> {
    /// Create a stream buffer of `capacity` bytes. `capacity` must be
    /// non-zero.
    pub fn new(capacity: usize) -> Result<Self, CreateError> {
        queue::create::<Traits>(1, capacity).map(Self::from_id)
    }

    /// Send `data`. Whatever fits is moved immediately. The call returns once
    /// all of `data` has been moved, or when `timeout` expires after moving
    /// at least one byte. Returns the number of bytes sent.
    ///
    /// With [`Timeout::Poll`], this never blocks and fails with `Timeout` only
    /// if nothing could be sent.
    pub fn send(self, data: &[u8], timeout: Timeout) -> Result<usize, WaitObjectError> {
        queue::send::<Traits>(self.0, data, timeout, true)
    }

    /// Receive into `buf`. The call returns once `buf` is full, or when
    /// `timeout` expires after receiving at least one byte. Returns the
    /// number of bytes received.
    pub fn recv(self, buf: &mut [u8], timeout: Timeout) -> Result<usize, WaitObjectError> {
        queue::recv::<Traits>(self.0, buf, timeout, true)
    }

    /// Get the number of stored bytes.
    pub fn len(self) -> Result<usize, QueryError> {
        queue::len::<Traits>(self.0)
    }

    /// Get the capacity in bytes.
    pub fn capacity(self) -> Result<usize, QueryError> {
        queue::capacity::<Traits>(self.0)
    }

    /// Discard the stored bytes and fail all waiting tasks with `Stopped`.
    pub fn kill(self) -> Result<(), KillError> {
        queue::kill::<Traits>(self.0)
    }

    /// [Kill](Self::kill) the stream buffer and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        queue::delete::<Traits>(self.0)
    }
}
