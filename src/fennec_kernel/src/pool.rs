//! Fixed-size memory pools
use alloc::{boxed::Box, vec};
use core::{fmt, mem, ptr::NonNull};

use crate::{
    error::{
        CreateError, DeleteError, FreeBlockError, KillError, QueryError, WaitError,
        WaitObjectError,
    },
    klock::lock_cpu,
    state::{self, globals, Globals, Id, ObjectTable},
    task,
    timeout::{self, Timeout},
    wait::{self, QueueOrder, WaitPayload, WaitQueueId},
    KernelTraits,
};

define_object_handle! {
    /// Represents a single memory pool in a system.
    ///
    /// A memory pool hands out fixed-size, word-aligned blocks from a
    /// preallocated region in constant time. The blocks remain valid until
    /// they are freed, the pool is [killed](Self::kill), or the pool is
    /// [deleted](Self::delete).
    pub struct MemoryPool;
}

/// The value of [`PoolCb::free_head`] and free-list links indicating the end
/// of the free list.
const BLOCK_NONE: usize = usize::MAX;

/// *Memory pool control block* - the state data of a memory pool.
pub(crate) struct PoolCb {
    /// The storage for all blocks, obtained from `Box::into_raw`. Referenced
    /// only through raw pointers because the blocks are lent out to tasks.
    storage: NonNull<[usize]>,
    /// The usable size of a block, in bytes.
    block_size: usize,
    /// The stride of blocks, in words.
    words_per_block: usize,
    /// The first free block. Each free block stores the index of the next
    /// free block in its first word.
    free_head: usize,
    free_count: usize,
    /// `true` for each block that is currently allocated.
    allocated: Box<[bool]>,
    wait_queue: WaitQueueId,
}

impl Drop for PoolCb {
    fn drop(&mut self) {
        // Safety: `storage` was created by `Box::into_raw`
        drop(unsafe { Box::from_raw(self.storage.as_ptr()) });
    }
}

impl fmt::Debug for PoolCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolCb")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count())
            .field("free_head", &self.free_head)
            .field("free_count", &self.free_count)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl PoolCb {
    fn new(block_size: usize, block_count: usize, wait_queue: WaitQueueId) -> Option<Self> {
        if block_size == 0 || block_count == 0 {
            return None;
        }
        let words_per_block =
            block_size.checked_add(mem::size_of::<usize>() - 1)? / mem::size_of::<usize>();
        let total_words = words_per_block.checked_mul(block_count)?;
        total_words.checked_mul(mem::size_of::<usize>())?;

        let storage = Box::into_raw(vec![0usize; total_words].into_boxed_slice());
        let mut pool_cb = Self {
            // Safety: `Box::into_raw` never returns null
            storage: unsafe { NonNull::new_unchecked(storage) },
            block_size,
            words_per_block,
            free_head: BLOCK_NONE,
            free_count: 0,
            allocated: vec![true; block_count].into_boxed_slice(),
            wait_queue,
        };
        pool_cb.reclaim_all();
        Some(pool_cb)
    }

    #[inline]
    fn block_count(&self) -> usize {
        self.allocated.len()
    }

    #[inline]
    fn block_ptr(&self, i: usize) -> NonNull<usize> {
        debug_assert!(i < self.block_count());
        // Safety: In bounds of `storage`
        unsafe {
            NonNull::new_unchecked(
                self.storage
                    .cast::<usize>()
                    .as_ptr()
                    .add(i * self.words_per_block),
            )
        }
    }

    /// Get the byte slice handed out to the user for the block `i`.
    #[inline]
    fn block_slice(&self, i: usize) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.block_ptr(i).cast(), self.block_size)
    }

    /// Find the block `ptr` points to. Returns `None` if `ptr` doesn't point
    /// to the start of a block.
    fn index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let block_bytes = self.words_per_block * mem::size_of::<usize>();
        let base = self.storage.cast::<u8>().as_ptr() as usize;
        let offset = (ptr.as_ptr() as usize).wrapping_sub(base);
        if offset % block_bytes != 0 {
            return None;
        }
        let i = offset / block_bytes;
        (i < self.block_count()).then(|| i)
    }

    /// Zero-fill the block `i`.
    fn zero_block(&mut self, i: usize) {
        // Safety: The block is in bounds and not free-list managed right now
        unsafe { self.block_ptr(i).as_ptr().write_bytes(0, self.words_per_block) };
    }

    /// Take a block from the free list.
    fn pop_free(&mut self) -> Option<usize> {
        let i = self.free_head;
        if i == BLOCK_NONE {
            return None;
        }
        // Safety: A free block holds the next link in its first word
        self.free_head = unsafe { self.block_ptr(i).as_ptr().read() };
        self.free_count -= 1;
        self.allocated[i] = true;
        self.zero_block(i);
        Some(i)
    }

    /// Return the block `i` to the free list.
    fn push_free(&mut self, i: usize) {
        debug_assert!(self.allocated[i]);
        self.allocated[i] = false;
        // Safety: The block is no longer lent out
        unsafe { self.block_ptr(i).as_ptr().write(self.free_head) };
        self.free_head = i;
        self.free_count += 1;
    }

    /// Put every block back to the free list.
    fn reclaim_all(&mut self) {
        self.free_head = BLOCK_NONE;
        self.free_count = 0;
        self.allocated.iter_mut().for_each(|x| *x = true);
        for i in (0..self.block_count()).rev() {
            self.push_free(i);
        }
    }
}

impl<Traits: KernelTraits> MemoryPool<Traits> {
    /// Create a memory pool with `block_count` blocks of `block_size` bytes
    /// each.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self, CreateError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let wait_queue = wait::new_wait_queue(g, QueueOrder::Fifo);
        let pool_cb = match PoolCb::new(block_size, block_count, wait_queue) {
            Some(pool_cb) => pool_cb,
            None => {
                wait::free_wait_queue(g, wait_queue);
                return Err(CreateError::BadParam);
            }
        };
        let pool = g.pools.insert_cb(pool_cb);
        log::debug!("created pool {:?} ({} x {} bytes)", pool, block_count, block_size);
        Ok(Self::from_id(pool))
    }

    /// Allocate a zero-filled block, blocking while none is free.
    pub fn alloc(self, timeout: Timeout) -> Result<NonNull<[u8]>, WaitObjectError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let deadline = timeout::resolve::<Traits>(g, timeout)?;
        let pool_cb = g.pools.cb_mut(self.0)?;

        if let Some(i) = pool_cb.pop_free() {
            return Ok(pool_cb.block_slice(i));
        }

        if deadline.is_poll() {
            return Err(WaitObjectError::Timeout);
        }

        let wait_queue = pool_cb.wait_queue;
        state::expect_waitable_context::<Traits>()?;
        let (payload, result) = wait::wait::<Traits>(
            lock.borrow_mut(),
            Some(wait_queue),
            WaitPayload::PoolBlock(None),
            deadline,
        );
        result?;

        let block = match payload {
            WaitPayload::PoolBlock(Some(block)) => block,
            _ => unreachable!(),
        };
        let pool_cb = globals(&mut *lock).pools.obj(self.0);
        Ok(NonNull::slice_from_raw_parts(block, pool_cb.block_size))
    }

    /// Free a block allocated from the pool. The block goes directly to the
    /// oldest waiting task if there's one.
    ///
    /// `block` must point to the start of a block currently allocated from
    /// this pool.
    pub fn free(self, block: NonNull<u8>) -> Result<(), FreeBlockError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        let pool_cb = g.pools.cb_mut(self.0)?;

        let i = pool_cb.index_of(block).ok_or(FreeBlockError::BadParam)?;
        if !pool_cb.allocated[i] {
            return Err(FreeBlockError::BadParam);
        }

        let wait_queue = pool_cb.wait_queue;
        match wait::first_waiting_task(g, wait_queue) {
            Some(waiter) => {
                let pool_cb = g.pools.obj_mut(self.0);
                pool_cb.zero_block(i);
                let block = pool_cb.block_ptr(i).cast();
                *wait::payload_mut(g, waiter) = WaitPayload::PoolBlock(Some(block));
                wait::wake_up(g, waiter, Ok(()));
                task::unlock_cpu_and_check_preemption(lock);
            }
            None => g.pools.obj_mut(self.0).push_free(i),
        }

        Ok(())
    }

    /// Get the number of free blocks.
    pub fn free_count(self) -> Result<usize, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).pools.cb(self.0)?.free_count)
    }

    /// Get the block size in bytes.
    pub fn block_size(self) -> Result<usize, QueryError> {
        let mut lock = lock_cpu::<Traits>()?;
        Ok(globals(&mut *lock).pools.cb(self.0)?.block_size)
    }

    /// Fail all waiting tasks with `Stopped` and reclaim every block,
    /// invalidating all outstanding blocks.
    pub fn kill(self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.pools.cb(self.0)?;
        kill_inner(g, self.0);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [Kill](Self::kill) the pool, release its storage, and free its id.
    pub fn delete(self) -> Result<(), DeleteError> {
        let mut lock = lock_cpu::<Traits>()?;
        let g = globals(&mut *lock);
        g.pools.cb(self.0)?;
        kill_inner(g, self.0);
        let pool_cb = g.pools.remove_cb(self.0)?;
        wait::free_wait_queue(g, pool_cb.wait_queue);
        log::debug!("deleted pool {:?}", self.0);
        task::unlock_cpu_and_check_preemption(lock);
        drop(pool_cb);
        Ok(())
    }
}

fn kill_inner(g: &mut Globals, pool: Id) {
    let pool_cb = g.pools.obj_mut(pool);
    pool_cb.reclaim_all();
    let wait_queue = pool_cb.wait_queue;
    wait::wake_up_all(g, wait_queue, Err(WaitError::Stopped));
}
