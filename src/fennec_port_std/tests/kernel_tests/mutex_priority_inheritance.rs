//! Checks that priority inheritance prevents an unbounded priority
//! inversion.
//!
//! The first phase is the classic scenario: `low` holds a mutex wanted by
//! `high` while `mid` becomes ready. `low` inherits `high`'s priority, so
//! `mid` can't run until `high` is done.
//!
//! ```text
//!        ____       ____                       ____
//! low   |____|     |____|  (boosted)          |____|
//!       0→1        2→3                        5→6
//!             ____             ____
//! high       |____| (blocked) |____|
//!            1→2              3→4
//!                                      ____
//! mid                                 |____|
//!                                     4→5
//! ```
//!
//! The second phase checks transitive inheritance: `high` waits on a mutex
//! held by `mid`, which waits on a mutex held by `low`.
use fennec_kernel::{Mutex, MutexPolicy, Task, TaskState, Timeout};
use fennec_port_std::PortInstance;

use super::Driver;
use crate::SeqTracker;

const LOW: usize = 3;
const MID: usize = 2;
const HIGH: usize = 1;

pub struct App<Traits> {
    low: Task<Traits>,
    mid: Task<Traits>,
    high: Task<Traits>,
    chain_mid: Task<Traits>,
    chain_high: Task<Traits>,
    m1: Mutex<Traits>,
    m2: Mutex<Traits>,
    seq: SeqTracker,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        let low = Task::<Traits>::define()
            .entry(low_body::<Traits, D>)
            .priority(LOW)
            .active(true)
            .finish()
            .unwrap();
        let mid = Task::<Traits>::define()
            .entry(mid_body::<Traits, D>)
            .priority(MID)
            .finish()
            .unwrap();
        let high = Task::<Traits>::define()
            .entry(high_body::<Traits, D>)
            .priority(HIGH)
            .finish()
            .unwrap();
        let chain_mid = Task::<Traits>::define()
            .entry(chain_mid_body::<Traits, D>)
            .priority(MID)
            .finish()
            .unwrap();
        let chain_high = Task::<Traits>::define()
            .entry(chain_high_body::<Traits, D>)
            .priority(HIGH)
            .finish()
            .unwrap();

        App {
            low,
            mid,
            high,
            chain_mid,
            chain_high,
            m1: Mutex::new(MutexPolicy::ErrorCheck).unwrap(),
            m2: Mutex::new(MutexPolicy::ErrorCheck).unwrap(),
            seq: SeqTracker::new(),
        }
    }
}

fn low_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    // Phase 1
    app.m1.lock(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(0, 1);

    app.high.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.low.effective_priority(), Ok(HIGH));
    assert_eq!(app.low.priority(), Ok(LOW));

    // `mid` doesn't preempt us
    app.mid.start().unwrap();
    assert_eq!(app.mid.state(), Ok(TaskState::Ready));

    app.m1.unlock().unwrap();
    app.seq.expect_and_replace(5, 6);
    assert_eq!(app.low.effective_priority(), Ok(LOW));

    // Phase 2
    app.m1.lock(Timeout::Forever).unwrap();
    app.chain_mid.start().unwrap();
    app.seq.expect_and_replace(7, 8);
    assert_eq!(app.low.effective_priority(), Ok(MID));

    app.chain_high.start().unwrap();
    app.seq.expect_and_replace(9, 10);
    assert_eq!(app.chain_mid.effective_priority(), Ok(HIGH));
    assert_eq!(app.low.effective_priority(), Ok(HIGH));

    app.m1.unlock().unwrap();
    app.seq.expect_and_replace(13, 14);
    assert_eq!(app.low.effective_priority(), Ok(LOW));

    D::success();
}

fn high_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    app.m1.lock(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(3, 4);
    app.m1.unlock().unwrap();
}

fn mid_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(4, 5);
    assert_eq!(app.m1.is_locked(), Ok(false));
}

fn chain_mid_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.m2.lock(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(6, 7);
    app.m1.lock(Timeout::Forever).unwrap();

    // Still boosted by `chain_high`, which is waiting for `m2`
    app.seq.expect_and_replace(10, 11);
    assert_eq!(app.chain_mid.effective_priority(), Ok(HIGH));
    app.m1.unlock().unwrap();
    app.m2.unlock().unwrap();

    app.seq.expect_and_replace(12, 13);
    assert_eq!(app.chain_mid.effective_priority(), Ok(MID));
}

fn chain_high_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(8, 9);
    app.m2.lock(Timeout::Forever).unwrap();
    app.seq.expect_and_replace(11, 12);
    app.m2.unlock().unwrap();
}
