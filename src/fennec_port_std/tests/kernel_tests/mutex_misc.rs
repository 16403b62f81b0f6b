//! Validates error codes returned by mutex manipulation methods. Also,
//! checks miscellaneous properties of [`fennec_kernel::Mutex`].
use fennec_kernel::{
    LockMutexError, Mutex, MutexPolicy, QueryError, System, Task, Timeout, UnlockMutexError,
    DURATION_MAX,
};
use fennec_port_std::PortInstance;

use super::Driver;
use crate::SeqTracker;

pub struct App<Traits> {
    task1: Task<Traits>,
    task2: Task<Traits>,
    task3: Task<Traits>,
    task4: Task<Traits>,
    task5: Task<Traits>,
    m_recursive: Mutex<Traits>,
    m_error_check: Mutex<Traits>,
    m_normal: Mutex<Traits>,
    seq: SeqTracker,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        let task1 = Task::<Traits>::define()
            .entry(task1_body::<Traits, D>)
            .priority(2)
            .active(true)
            .finish()
            .unwrap();
        let [task2, task3, task4, task5] = [
            task2_body::<Traits, D> as fn(),
            task3_body::<Traits, D>,
            task4_body::<Traits, D>,
            task5_body::<Traits, D>,
        ]
        .map(|entry| {
            Task::<Traits>::define()
                .entry(entry)
                .priority(1)
                .finish()
                .unwrap()
        });

        App {
            task1,
            task2,
            task3,
            task4,
            task5,
            m_recursive: Mutex::new(MutexPolicy::Recursive).unwrap(),
            m_error_check: Mutex::new(MutexPolicy::ErrorCheck).unwrap(),
            m_normal: Mutex::new(MutexPolicy::Normal).unwrap(),
            seq: SeqTracker::new(),
        }
    }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(0, 1);

    // `PartialEq`
    assert_ne!(app.m_recursive, app.m_normal);
    assert_eq!(app.m_recursive, app.m_recursive);

    // Recursive locking
    let m = app.m_recursive;
    for _ in 0..3 {
        m.lock(Timeout::Forever).unwrap();
    }
    assert_eq!(m.owner(), Ok(Some(app.task1)));
    m.unlock().unwrap();
    m.unlock().unwrap();
    assert_eq!(m.is_locked(), Ok(true));
    m.unlock().unwrap();
    assert_eq!(m.is_locked(), Ok(false));
    assert_eq!(m.owner(), Ok(None));
    assert_eq!(m.unlock(), Err(UnlockMutexError::NotOwner));

    // Error checking
    let m = app.m_error_check;
    m.lock(Timeout::Forever).unwrap();
    assert_eq!(m.lock(Timeout::Forever), Err(LockMutexError::WouldDeadlock));
    assert_eq!(m.lock(Timeout::Poll), Err(LockMutexError::WouldDeadlock));
    assert_eq!(
        m.lock(Timeout::After(DURATION_MAX + 1)),
        Err(LockMutexError::BadParam)
    );

    // `task2` tries to lock `m` and gives up at 10. It lends its priority to
    // us in the meantime.
    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.task1.effective_priority(), Ok(1));
    System::<Traits>::sleep(Timeout::After(20)).unwrap();
    app.seq.expect_and_replace(4, 5);
    assert_eq!(app.task1.effective_priority(), Ok(2));
    m.unlock().unwrap();
    assert_eq!(m.unlock(), Err(UnlockMutexError::NotOwner));

    // Anyone can unlock a `Normal` mutex
    let m = app.m_normal;
    m.lock(Timeout::Forever).unwrap();
    app.task3.start().unwrap();
    app.seq.expect_and_replace(6, 7);
    assert_eq!(m.is_locked(), Ok(false));

    // Relocking a `Normal` mutex deadlocks
    m.lock(Timeout::Forever).unwrap();
    assert_eq!(m.lock(Timeout::After(5)), Err(LockMutexError::Timeout));
    m.unlock().unwrap();

    // `kill` releases the mutex
    let m = app.m_error_check;
    m.lock(Timeout::Forever).unwrap();
    m.kill().unwrap();
    assert_eq!(m.is_locked(), Ok(false));
    assert_eq!(app.task1.effective_priority(), Ok(2));
    m.lock(Timeout::Poll).unwrap();
    m.unlock().unwrap();

    // `delete` invalidates the mutex
    app.m_normal.delete().unwrap();
    assert_eq!(app.m_normal.is_locked(), Err(QueryError::BadId));
    assert_eq!(
        app.m_normal.lock(Timeout::Poll),
        Err(LockMutexError::BadId)
    );
    assert_eq!(app.m_normal.unlock(), Err(UnlockMutexError::BadId));

    // Killing the owner of a mutex passes the mutex to the next waiter
    app.task4.start().unwrap();
    app.seq.expect_and_replace(8, 9);
    app.task5.start().unwrap();
    app.seq.expect_and_replace(10, 11);
    assert_eq!(app.m_recursive.owner(), Ok(Some(app.task4)));
    app.task4.kill().unwrap();
    app.seq.expect_and_replace(12, 13);
    assert_eq!(app.m_recursive.is_locked(), Ok(false));

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();
    let m = app.m_error_check;

    app.seq.expect_and_replace(1, 2);
    assert_eq!(m.unlock(), Err(UnlockMutexError::NotOwner));
    assert_eq!(m.lock(Timeout::Poll), Err(LockMutexError::Timeout));
    assert_eq!(m.lock(Timeout::After(10)), Err(LockMutexError::Timeout));
    assert_eq!(System::<Traits>::time(), Ok(10));
    app.seq.expect_and_replace(3, 4);
}

fn task3_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(5, 6);
    assert_eq!(app.m_normal.owner(), Ok(Some(app.task1)));
    app.m_normal.unlock().unwrap();
}

fn task4_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(7, 8);
    app.m_recursive.lock(Timeout::Forever).unwrap();
    app.m_recursive.lock(Timeout::Forever).unwrap();
    System::<Traits>::sleep(Timeout::After(100)).unwrap();
    unreachable!("task4 was killed while sleeping");
}

fn task5_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(9, 10);
    app.m_recursive.lock(Timeout::Forever).unwrap();

    // The lock count of the previous owner is not inherited
    app.seq.expect_and_replace(11, 12);
    assert_eq!(app.m_recursive.owner(), Ok(Some(app.task5)));
    app.m_recursive.unlock().unwrap();
    assert_eq!(app.m_recursive.unlock(), Err(UnlockMutexError::NotOwner));
}
