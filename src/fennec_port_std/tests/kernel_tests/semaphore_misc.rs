//! Checks miscellaneous properties of [`fennec_kernel::Semaphore`].
use fennec_kernel::{
    CreateError, QueryError, QueueOrder, Semaphore, System, Task, Timeout, WaitObjectError,
};
use fennec_port_std::PortInstance;
use std::sync::Mutex as StdMutex;

use super::Driver;
use crate::SeqTracker;

const LIMIT: usize = 2;

pub struct App<Traits> {
    task2: Task<Traits>,
    task3: Task<Traits>,
    task4: Task<Traits>,
    task5: Task<Traits>,
    sem: Semaphore<Traits>,
    sem_handoff: Semaphore<Traits>,
    sem_priority: Semaphore<Traits>,
    order: StdMutex<Vec<usize>>,
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
        let task3 = Task::<Traits>::define()
            .entry(task3_body::<Traits, D>)
            .priority(1)
            .finish()
            .unwrap();
        let task4 = Task::<Traits>::define()
            .entry(move || priority_waiter_body::<Traits, D>(4))
            .priority(5)
            .finish()
            .unwrap();
        let task5 = Task::<Traits>::define()
            .entry(move || priority_waiter_body::<Traits, D>(5))
            .priority(4)
            .finish()
            .unwrap();

        App {
            task2,
            task3,
            task4,
            task5,
            sem: Semaphore::new(1, LIMIT, QueueOrder::Fifo).unwrap(),
            sem_handoff: Semaphore::new(0, 1, QueueOrder::Fifo).unwrap(),
            sem_priority: Semaphore::new(0, 2, QueueOrder::TaskPriority).unwrap(),
            order: StdMutex::new(Vec::new()),
            seq: SeqTracker::new(),
        }
    }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(0, 1);

    assert_eq!(
        Semaphore::<Traits>::new(3, 2, QueueOrder::Fifo),
        Err(CreateError::BadParam)
    );
    assert_eq!(
        Semaphore::<Traits>::new(0, 0, QueueOrder::Fifo),
        Err(CreateError::BadParam)
    );

    // Non-blocking operations at the boundaries
    let sem = app.sem;
    assert_eq!(sem.count(), Ok(1));
    sem.wait(Timeout::Poll).unwrap();
    assert_eq!(sem.wait(Timeout::Poll), Err(WaitObjectError::Timeout));
    assert_eq!(sem.count(), Ok(0));
    sem.signal(Timeout::Poll).unwrap();
    sem.signal(Timeout::Poll).unwrap();
    assert_eq!(sem.signal(Timeout::Poll), Err(WaitObjectError::Timeout));
    assert_eq!(sem.count(), Ok(LIMIT));

    // `signal` hands a permit directly to a waiting task
    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    app.sem_handoff.signal(Timeout::Poll).unwrap();
    app.seq.expect_and_replace(4, 5);

    // `wait` completes a task blocked in `signal`
    app.task3.start().unwrap();
    app.seq.expect_and_replace(6, 7);
    sem.wait(Timeout::Poll).unwrap();
    app.seq.expect_and_replace(8, 9);
    assert_eq!(sem.count(), Ok(LIMIT));

    // The count stays within `0..=LIMIT` whatever we do
    let mut state = 0x12345678u32;
    for _ in 0..200 {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        let result = if state & 0x10000 != 0 {
            sem.wait(Timeout::Poll)
        } else {
            sem.signal(Timeout::Poll)
        };
        let count = sem.count().unwrap();
        assert!(count <= LIMIT);
        if result.is_err() {
            assert!(count == 0 || count == LIMIT);
        }
    }

    // A `TaskPriority` semaphore wakes up the most urgent waiter first,
    // regardless of the arrival order
    app.task4.start().unwrap();
    System::<Traits>::sleep(Timeout::After(1)).unwrap();
    app.task5.start().unwrap();
    System::<Traits>::sleep(Timeout::After(1)).unwrap();
    app.sem_priority.signal(Timeout::Poll).unwrap();
    System::<Traits>::sleep(Timeout::After(1)).unwrap();
    assert_eq!(*app.order.lock().unwrap(), [5]);
    app.sem_priority.signal(Timeout::Poll).unwrap();
    System::<Traits>::sleep(Timeout::After(1)).unwrap();
    assert_eq!(*app.order.lock().unwrap(), [5, 4]);

    // `kill` resets the count
    sem.kill().unwrap();
    assert_eq!(sem.count(), Ok(1));

    sem.delete().unwrap();
    assert_eq!(sem.count(), Err(QueryError::BadId));
    assert_eq!(sem.wait(Timeout::Poll), Err(WaitObjectError::BadId));

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    app.sem_handoff.wait(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(3, 4);
    assert_eq!(app.sem_handoff.count(), Ok(0));
}

fn task3_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(5, 6);
    app.sem.signal(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(7, 8);
}

fn priority_waiter_body<Traits: PortInstance, D: Driver<App<Traits>>>(id: usize) {
    let app = D::app();

    app.sem_priority.wait(Timeout::Forever).unwrap();
    app.order.lock().unwrap().push(id);
}
