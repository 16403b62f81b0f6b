//! Checks the wait conditions of [`fennec_kernel::EventFlags`].
use fennec_kernel::{
    EventFlags, EventFlagsWaitFlags as F, QueryError, Task, TaskState, Timeout, UpdateError,
    WaitObjectError,
};
use fennec_port_std::PortInstance;
use std::sync::Mutex as StdMutex;

use super::Driver;
use crate::SeqTracker;

pub struct App<Traits> {
    task2: Task<Traits>,
    task3: Task<Traits>,
    consumers: [Task<Traits>; 2],
    victim: Task<Traits>,
    eg: EventFlags<Traits>,
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
        let consumers = [0, 1].map(|i| {
            Task::<Traits>::define()
                .entry(move || consumer_body::<Traits, D>(i))
                .priority(1)
                .finish()
                .unwrap()
        });
        let victim = Task::<Traits>::define()
            .entry(victim_body::<Traits, D>)
            .priority(1)
            .finish()
            .unwrap();

        App {
            task2,
            task3,
            consumers,
            victim,
            eg: EventFlags::new(0b0001).unwrap(),
            order: StdMutex::new(Vec::new()),
            seq: SeqTracker::new(),
        }
    }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();
    let eg = app.eg;

    app.seq.expect_and_replace(0, 1);

    // Immediate checks
    assert_eq!(eg.get(), Ok(0b0001));
    assert_eq!(eg.wait(0b0011, F::empty(), Timeout::Poll), Ok(0b0001));
    assert_eq!(
        eg.wait(0b0011, F::ALL, Timeout::Poll),
        Err(WaitObjectError::Timeout)
    );
    assert_eq!(eg.wait(0, F::empty(), Timeout::Poll), Err(WaitObjectError::BadParam));
    assert_eq!(eg.wait(0b0001, F::CLEAR, Timeout::Poll), Ok(0b0001));
    assert_eq!(eg.get(), Ok(0));
    assert_eq!(
        eg.wait(0b0001, F::NEW_ONLY, Timeout::Poll),
        Err(WaitObjectError::Timeout)
    );

    // `ALL` waits until every bit in the mask is set
    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    eg.set(0b0010).unwrap();
    assert_eq!(app.task2.state(), Ok(TaskState::Waiting));
    eg.set(0b0100).unwrap();
    app.seq.expect_and_replace(4, 5);
    assert_eq!(eg.get(), Ok(0b0110));

    // `NEW_ONLY` ignores the bits that were already set
    app.task3.start().unwrap();
    app.seq.expect_and_replace(6, 7);
    assert_eq!(app.task3.state(), Ok(TaskState::Waiting));
    eg.set(0b0100).unwrap();
    assert_eq!(app.task3.state(), Ok(TaskState::Waiting));
    eg.set(0b0010).unwrap();
    app.seq.expect_and_replace(8, 9);

    // A bit consumed by `CLEAR` is invisible to the later waiters
    eg.clear(!0).unwrap();
    assert_eq!(eg.get(), Ok(0));
    for consumer in &app.consumers {
        consumer.start().unwrap();
    }
    eg.set(0b1000).unwrap();
    assert_eq!(*app.order.lock().unwrap(), [0]);
    assert_eq!(app.consumers[1].state(), Ok(TaskState::Waiting));
    assert_eq!(eg.get(), Ok(0));
    eg.set(0b1000).unwrap();
    assert_eq!(*app.order.lock().unwrap(), [0, 1]);
    assert_eq!(eg.get(), Ok(0));

    // `kill` clears the register and fails the waiters
    eg.set(0b0001).unwrap();
    app.victim.start().unwrap();
    app.seq.expect_and_replace(10, 11);
    eg.kill().unwrap();
    app.seq.expect_and_replace(12, 13);
    assert_eq!(eg.get(), Ok(0));

    eg.delete().unwrap();
    assert_eq!(eg.get(), Err(QueryError::BadId));
    assert_eq!(eg.set(1), Err(UpdateError::BadId));
    assert_eq!(
        eg.wait(1, F::empty(), Timeout::Poll),
        Err(WaitObjectError::BadId)
    );

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    assert_eq!(app.eg.wait(0b0110, F::ALL, Timeout::Forever), Ok(0b0110));
    app.seq.expect_and_replace(3, 4);
}

fn task3_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(5, 6);
    assert_eq!(
        app.eg.wait(0b0010, F::NEW_ONLY, Timeout::Forever),
        Ok(0b0010)
    );
    app.seq.expect_and_replace(7, 8);
}

fn consumer_body<Traits: PortInstance, D: Driver<App<Traits>>>(i: usize) {
    let app = D::app();

    assert_eq!(app.eg.wait(0b1000, F::CLEAR, Timeout::Forever), Ok(0b1000));
    app.order.lock().unwrap().push(i);
}

fn victim_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(9, 10);
    assert_eq!(
        app.eg.wait(0b0010, F::empty(), Timeout::Forever),
        Err(WaitObjectError::Stopped)
    );
    app.seq.expect_and_replace(11, 12);
}
