//! Checks the basic scheduling behavior and miscellaneous properties of
//! [`fennec_kernel::Task`].
use fennec_kernel::{
    CreateError, KillTaskError, SetTaskPriorityError, StartTaskError, System, Task, TaskState,
};
use fennec_port_std::PortInstance;

use super::Driver;
use crate::SeqTracker;

pub struct App<Traits> {
    task1: Task<Traits>,
    task2: Task<Traits>,
    task3: Task<Traits>,
    task4: Task<Traits>,
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
        let task2 = Task::<Traits>::define()
            .entry(task2_body::<Traits, D>)
            .priority(1)
            .finish()
            .unwrap();
        let task3 = Task::<Traits>::define()
            .entry(task3_body::<Traits, D>)
            .priority(2)
            .finish()
            .unwrap();
        let task4 = Task::<Traits>::define()
            .entry(|| unreachable!("task4 was killed before running"))
            .priority(3)
            .finish()
            .unwrap();

        App {
            task1,
            task2,
            task3,
            task4,
            seq: SeqTracker::new(),
        }
    }
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(0, 1);

    assert_eq!(Task::<Traits>::current().unwrap(), Some(app.task1));
    assert_eq!(app.task1.state().unwrap(), TaskState::Running);
    assert_eq!(app.task2.state().unwrap(), TaskState::Stopped);
    assert_eq!(app.task1.start(), Err(StartTaskError::QueueOverflow));

    // `PartialEq`
    assert_ne!(app.task1, app.task2);
    assert_eq!(app.task1, app.task1);

    // `task2` is more urgent, so it preempts `task1` right away
    app.task2.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.task2.state().unwrap(), TaskState::Stopped);

    // A stopped task can be started again
    app.task2.start().unwrap();
    app.seq.expect_and_replace(4, 5);

    // `task3` has the same priority as `task1`, so it has to wait until
    // `task1` yields
    app.task3.start().unwrap();
    assert_eq!(app.task3.state().unwrap(), TaskState::Ready);
    app.seq.expect_and_replace(5, 6);
    System::<Traits>::yield_now().unwrap();
    app.seq.expect_and_replace(7, 8);
    System::<Traits>::yield_now().unwrap();
    app.seq.expect_and_replace(9, 10);
    assert_eq!(app.task3.state().unwrap(), TaskState::Stopped);

    // Kill a task that has never run
    app.task4.start().unwrap();
    assert_eq!(app.task4.state().unwrap(), TaskState::Ready);
    app.task4.kill().unwrap();
    assert_eq!(app.task4.state().unwrap(), TaskState::Stopped);
    assert_eq!(app.task4.kill(), Err(KillTaskError::BadObjectState));

    // Priorities
    assert_eq!(app.task1.priority().unwrap(), 2);
    app.task1.set_priority(3).unwrap();
    assert_eq!(app.task1.priority().unwrap(), 3);
    assert_eq!(app.task1.effective_priority().unwrap(), 3);
    assert_eq!(
        app.task1.set_priority(16),
        Err(SetTaskPriorityError::BadParam)
    );
    assert_eq!(
        Task::<Traits>::define().entry(|| {}).priority(16).finish(),
        Err(CreateError::BadParam)
    );

    // No entry point
    assert_eq!(Task::<Traits>::define().finish(), Err(CreateError::BadParam));

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    assert_eq!(Task::<Traits>::current().unwrap(), Some(app.task2));
    assert_eq!(app.task1.state().unwrap(), TaskState::Ready);

    match app.seq.get() {
        1 => app.seq.expect_and_replace(1, 2),
        3 => app.seq.expect_and_replace(3, 4),
        x => unreachable!("task2 ran at {}", x),
    }
}

fn task3_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(6, 7);
    System::<Traits>::yield_now().unwrap();
    app.seq.expect_and_replace(8, 9);
}
