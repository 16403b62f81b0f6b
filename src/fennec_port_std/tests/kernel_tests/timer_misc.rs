//! Checks the state transitions of [`fennec_kernel::Timer`].
use fennec_kernel::{
    QueryError, SetTimerParamError, System, Task, Timeout, Timer, WaitObjectError, DURATION_MAX,
};
use fennec_port_std::PortInstance;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Driver;
use crate::SeqTracker;

pub struct App<Traits> {
    task2: Task<Traits>,
    /// One-shot, fires 10 ticks after being started
    t1: Timer<Traits>,
    /// Periodic, no callback
    t2: Timer<Traits>,
    /// Deletes itself
    t3: Timer<Traits>,
    count: AtomicUsize,
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

        let t1 = Timer::<Traits>::define()
            .delay(10)
            .callback(|| {
                D::app().count.fetch_add(1, Ordering::Relaxed);
            })
            .finish()
            .unwrap();
        let t2 = Timer::<Traits>::define().delay(5).period(5).finish().unwrap();
        let t3 = Timer::<Traits>::define()
            .delay(5)
            .callback(|| D::app().t3.delete().unwrap())
            .finish()
            .unwrap();

        App {
            task2,
            t1,
            t2,
            t3,
            count: AtomicUsize::new(0),
            seq: SeqTracker::new(),
        }
    }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();
    let count = || app.count.load(Ordering::Relaxed);
    let sleep = |duration| System::<Traits>::sleep(Timeout::After(duration)).unwrap();

    app.seq.expect_and_replace(0, 1);

    // Parameter validation
    assert_eq!(
        app.t1.set_period(Some(0)),
        Err(SetTimerParamError::BadParam)
    );
    assert_eq!(
        app.t1.set_delay(Some(DURATION_MAX + 1)),
        Err(SetTimerParamError::BadParam)
    );

    // A one-shot timer fires once and becomes inactive
    assert_eq!(app.t1.is_active(), Ok(false));
    app.t1.start().unwrap();
    assert_eq!(app.t1.is_active(), Ok(true));
    sleep(9);
    assert_eq!(count(), 0);
    sleep(11);
    assert_eq!(count(), 1);
    assert_eq!(app.t1.is_active(), Ok(false));

    // A stopped timer doesn't fire
    app.t1.start().unwrap();
    sleep(5);
    app.t1.stop().unwrap();
    assert_eq!(app.t1.is_active(), Ok(false));
    sleep(20);
    assert_eq!(count(), 1);

    // Restarting re-arms it from the current time
    app.t1.start().unwrap();
    sleep(5);
    app.t1.start().unwrap();
    sleep(9);
    assert_eq!(count(), 1);
    sleep(1);
    assert_eq!(count(), 2);

    // Without a delay, an active timer never fires
    app.t1.set_delay(None).unwrap();
    app.t1.start().unwrap();
    sleep(50);
    assert_eq!(count(), 2);
    assert_eq!(app.t1.is_active(), Ok(true));
    app.t1.stop().unwrap();

    // Waiting for a periodic timer
    assert_eq!(app.t2.wait(Timeout::Poll), Err(WaitObjectError::Timeout));
    app.t2.start().unwrap();
    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    sleep(7);
    app.seq.expect_and_replace(4, 5);

    // `kill` stops the timer and fails the waiters
    app.t2.kill().unwrap();
    app.seq.expect_and_replace(6, 7);
    assert_eq!(app.t2.is_active(), Ok(false));

    // A timer can delete itself from its callback
    app.t3.start().unwrap();
    sleep(10);
    assert_eq!(app.t3.is_active(), Err(QueryError::BadId));

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    app.t2.wait(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(3, 4);
    assert_eq!(app.t2.wait(Timeout::Forever), Err(WaitObjectError::Stopped));
    app.seq.expect_and_replace(5, 6);
}
