//! Checks miscellaneous properties of [`fennec_kernel::MemoryPool`].
use fennec_kernel::{
    CreateError, FreeBlockError, MemoryPool, QueryError, Task, Timeout, WaitObjectError,
};
use fennec_port_std::PortInstance;
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::Driver;
use crate::SeqTracker;

const BLOCK_SIZE: usize = 12;
const BLOCK_COUNT: usize = 3;

pub struct App<Traits> {
    task2: Task<Traits>,
    victim: Task<Traits>,
    pool: MemoryPool<Traits>,
    other_pool: MemoryPool<Traits>,
    /// The address of the block passed to `task2`
    handed_block: AtomicUsize,
    seq: SeqTracker,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        Task::<Traits>::define()
            .entry(task1_body::<Traits, D>)
            .priority(2)
            .active(true)
            .finish()
            .unwrap();
        let task2 = Task::<Traits>::define()
            .entry(task2_body::<Traits, D>)
            .priority(1)
            .finish()
            .unwrap();
        let victim = Task::<Traits>::define()
            .entry(victim_body::<Traits, D>)
            .priority(1)
            .finish()
            .unwrap();

        App {
            task2,
            victim,
            pool: MemoryPool::new(BLOCK_SIZE, BLOCK_COUNT).unwrap(),
            other_pool: MemoryPool::new(BLOCK_SIZE, 1).unwrap(),
            handed_block: AtomicUsize::new(0),
            seq: SeqTracker::new(),
        }
    }
}

fn bytes<'a>(block: NonNull<[u8]>) -> &'a mut [u8] {
    // Safety: The block is allocated and nobody else is accessing it
    unsafe { &mut *block.as_ptr() }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();
    let pool = app.pool;

    app.seq.expect_and_replace(0, 1);

    assert_eq!(MemoryPool::<Traits>::new(0, 1), Err(CreateError::BadParam));
    assert_eq!(MemoryPool::<Traits>::new(1, 0), Err(CreateError::BadParam));
    assert_eq!(
        MemoryPool::<Traits>::new(usize::MAX, 1),
        Err(CreateError::BadParam)
    );

    assert_eq!(pool.block_size(), Ok(BLOCK_SIZE));
    assert_eq!(pool.free_count(), Ok(BLOCK_COUNT));

    // Exhaust the pool
    let blocks = [(); BLOCK_COUNT].map(|()| pool.alloc(Timeout::Poll).unwrap());
    for (i, &block) in blocks.iter().enumerate() {
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(block.cast::<u8>().as_ptr() as usize % std::mem::align_of::<usize>(), 0);
        assert!(bytes(block).iter().all(|&b| b == 0));
        bytes(block).fill(0xaa);
        for &other in &blocks[..i] {
            assert_ne!(block.cast::<u8>(), other.cast::<u8>());
        }
    }
    assert_eq!(pool.free_count(), Ok(0));
    assert_eq!(pool.alloc(Timeout::Poll), Err(WaitObjectError::Timeout));

    // A recycled block is zero-filled
    pool.free(blocks[0].cast()).unwrap();
    assert_eq!(pool.free_count(), Ok(1));
    let block = pool.alloc(Timeout::Poll).unwrap();
    assert_eq!(block.cast::<u8>(), blocks[0].cast::<u8>());
    assert!(bytes(block).iter().all(|&b| b == 0));

    // Invalid frees
    let misaligned = NonNull::new(blocks[1].cast::<u8>().as_ptr().wrapping_add(1)).unwrap();
    assert_eq!(pool.free(misaligned), Err(FreeBlockError::BadParam));
    let foreign = app.other_pool.alloc(Timeout::Poll).unwrap();
    assert_eq!(pool.free(foreign.cast()), Err(FreeBlockError::BadParam));
    app.other_pool.free(foreign.cast()).unwrap();
    assert_eq!(
        app.other_pool.free(foreign.cast()),
        Err(FreeBlockError::BadParam)
    );

    // `free` hands a block directly to a waiting task
    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    app.handed_block
        .store(blocks[1].cast::<u8>().as_ptr() as usize, Ordering::Relaxed);
    pool.free(blocks[1].cast()).unwrap();
    app.seq.expect_and_replace(4, 5);
    assert_eq!(pool.free_count(), Ok(1));

    // `kill` reclaims every block and fails the waiters
    pool.alloc(Timeout::Poll).unwrap();
    app.victim.start().unwrap();
    app.seq.expect_and_replace(6, 7);
    pool.kill().unwrap();
    app.seq.expect_and_replace(8, 9);
    assert_eq!(pool.free_count(), Ok(BLOCK_COUNT));
    assert_eq!(pool.free(blocks[2].cast()), Err(FreeBlockError::BadParam));

    pool.delete().unwrap();
    assert_eq!(pool.free_count(), Err(QueryError::BadId));
    assert_eq!(pool.alloc(Timeout::Poll), Err(WaitObjectError::BadId));
    assert_eq!(pool.free(blocks[2].cast()), Err(FreeBlockError::BadId));

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    let block = app.pool.alloc(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(3, 4);
    assert_eq!(
        block.cast::<u8>().as_ptr() as usize,
        app.handed_block.load(Ordering::Relaxed)
    );
    assert!(bytes(block).iter().all(|&b| b == 0));
    app.pool.free(block.cast()).unwrap();
}

fn victim_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(5, 6);
    assert_eq!(app.pool.alloc(Timeout::Forever), Err(WaitObjectError::Stopped));
    app.seq.expect_and_replace(7, 8);
}
