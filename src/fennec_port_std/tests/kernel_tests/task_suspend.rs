//! Checks `Task::suspend` and `Task::resume` on tasks in various states.
//!
//!  - `task2` sleeps until 10 and is suspended while waiting. It wakes up
//!    into the Suspended state and doesn't run until `task1` resumes it at
//!    20.
//!  - `task2` suspends itself and is resumed by `task1`.
//!  - `task3` is suspended and resumed while Ready.
use fennec_kernel::{SuspendTaskError, System, Task, TaskState, Timeout};
use fennec_port_std::PortInstance;

use super::Driver;
use crate::SeqTracker;

pub struct App<Traits> {
    task2: Task<Traits>,
    task3: Task<Traits>,
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
            .entry(|| {})
            .priority(3)
            .finish()
            .unwrap();

        App {
            task2,
            task3,
            seq: SeqTracker::new(),
        }
    }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(0, 1);
    assert_eq!(app.task2.suspend(), Err(SuspendTaskError::BadObjectState));

    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    // Suspend a waiting task. It keeps waiting.
    assert_eq!(app.task2.state(), Ok(TaskState::Waiting));
    app.task2.suspend().unwrap();
    assert_eq!(app.task2.state(), Ok(TaskState::Waiting));
    assert_eq!(app.task2.suspend(), Err(SuspendTaskError::BadObjectState));

    // `task2` wakes up at 10 but doesn't run
    System::<Traits>::sleep(Timeout::After(20)).unwrap();
    app.seq.expect_and_replace(3, 4);
    assert_eq!(System::<Traits>::time(), Ok(20));
    assert_eq!(app.task2.state(), Ok(TaskState::Suspended));

    // `task2` suspends itself after resuming
    app.task2.resume().unwrap();
    app.seq.expect_and_replace(5, 6);
    assert_eq!(app.task2.state(), Ok(TaskState::Suspended));

    app.task2.resume().unwrap();
    app.seq.expect_and_replace(7, 8);
    assert_eq!(app.task2.resume(), Err(SuspendTaskError::BadObjectState));

    // Suspend a ready task
    app.task3.start().unwrap();
    assert_eq!(app.task3.state(), Ok(TaskState::Ready));
    app.task3.suspend().unwrap();
    assert_eq!(app.task3.state(), Ok(TaskState::Suspended));
    app.task3.resume().unwrap();
    assert_eq!(app.task3.state(), Ok(TaskState::Ready));

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    System::<Traits>::sleep(Timeout::After(10)).unwrap();

    app.seq.expect_and_replace(4, 5);
    app.task2.suspend().unwrap();

    app.seq.expect_and_replace(6, 7);
}
