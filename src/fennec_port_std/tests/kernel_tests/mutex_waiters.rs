//! Blocks tasks of distinct priorities on a mutex one by one and checks that
//! the owner is always at least as urgent as every waiter, that it returns to
//! its base priority on unlock, and that the waiters acquire the mutex in
//! arrival order.
use fennec_kernel::{Mutex, MutexPolicy, Task, TaskState, Timeout};
use fennec_port_std::PortInstance;
use std::sync::Mutex as StdMutex;

use super::Driver;

const OWNER_PRIORITY: usize = 10;
const WAITER_PRIORITIES: [usize; 4] = [8, 6, 3, 1];

pub struct App<Traits> {
    owner: Task<Traits>,
    waiters: [Task<Traits>; 4],
    m: Mutex<Traits>,
    order: StdMutex<Vec<usize>>,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        let owner = Task::<Traits>::define()
            .entry(owner_body::<Traits, D>)
            .priority(OWNER_PRIORITY)
            .active(true)
            .finish()
            .unwrap();

        let waiters = [0, 1, 2, 3].map(|i| {
            Task::<Traits>::define()
                .entry(move || waiter_body::<Traits, D>(i))
                .priority(WAITER_PRIORITIES[i])
                .finish()
                .unwrap()
        });

        App {
            owner,
            waiters,
            m: Mutex::new(MutexPolicy::ErrorCheck).unwrap(),
            order: StdMutex::new(Vec::new()),
        }
    }
}

fn owner_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.m.lock(Timeout::Forever).unwrap();

    for (i, waiter) in app.waiters.iter().enumerate() {
        // The waiter preempts us and blocks on `m`
        waiter.start().unwrap();
        assert_eq!(waiter.state(), Ok(TaskState::Waiting));

        let effective_priority = app.owner.effective_priority().unwrap();
        assert_eq!(effective_priority, WAITER_PRIORITIES[i]);
        for waiter in &app.waiters[..=i] {
            assert!(effective_priority <= waiter.effective_priority().unwrap());
        }
    }

    // The waiters run to completion before we regain control
    app.m.unlock().unwrap();
    assert_eq!(app.owner.effective_priority(), Ok(OWNER_PRIORITY));
    assert_eq!(*app.order.lock().unwrap(), [0, 1, 2, 3]);
    assert_eq!(app.m.is_locked(), Ok(false));

    D::success();
}

fn waiter_body<Traits: PortInstance, D: Driver<App<Traits>>>(i: usize) {
    let app = D::app();
    let me = app.waiters[i];

    app.m.lock(Timeout::Forever).unwrap();

    // The remaining waiters lend their priorities to us
    let expected = WAITER_PRIORITIES[i..].iter().copied().min().unwrap();
    assert_eq!(me.effective_priority(), Ok(expected));

    app.order.lock().unwrap().push(i);
    app.m.unlock().unwrap();

    assert_eq!(me.effective_priority(), Ok(WAITER_PRIORITIES[i]));
}
