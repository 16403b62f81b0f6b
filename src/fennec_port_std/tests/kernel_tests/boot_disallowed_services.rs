//! Checks that the blocking services are rejected in a boot context while
//! non-blocking ones work.
use fennec_kernel::{
    EventFlags, EventFlagsWaitFlags, LockMutexError, Mutex, MutexPolicy, QueueOrder, Semaphore,
    SleepError, System, Task, Timeout, WaitObjectError, YieldError,
};
use fennec_port_std::PortInstance;

use super::Driver;

pub struct App<Traits> {
    sem: Semaphore<Traits>,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        assert_eq!(Task::<Traits>::current(), Ok(None));
        assert_eq!(System::<Traits>::time(), Ok(0));

        assert_eq!(
            System::<Traits>::sleep(Timeout::After(1)),
            Err(SleepError::BadContext)
        );
        assert_eq!(System::<Traits>::yield_now(), Err(YieldError::BadContext));

        let sem = Semaphore::<Traits>::new(1, 2, QueueOrder::Fifo).unwrap();
        assert_eq!(sem.wait(Timeout::Poll), Ok(()));
        assert_eq!(sem.wait(Timeout::Poll), Err(WaitObjectError::Timeout));
        assert_eq!(sem.wait(Timeout::Forever), Err(WaitObjectError::BadContext));
        sem.signal(Timeout::Poll).unwrap();

        let mutex = Mutex::<Traits>::new(MutexPolicy::ErrorCheck).unwrap();
        assert_eq!(
            mutex.lock(Timeout::Poll),
            Err(LockMutexError::BadContext)
        );

        let flags = EventFlags::<Traits>::new(0).unwrap();
        assert_eq!(
            flags.wait(1, EventFlagsWaitFlags::empty(), Timeout::Forever),
            Err(WaitObjectError::BadContext)
        );
        assert_eq!(
            flags.wait(0, EventFlagsWaitFlags::empty(), Timeout::Poll),
            Err(WaitObjectError::BadParam)
        );

        Task::<Traits>::define()
            .entry(task_body::<Traits, D>)
            .active(true)
            .finish()
            .unwrap();

        App { sem }
    }
}

fn task_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    // The same services work in a task context
    assert_eq!(app.sem.count(), Ok(1));
    app.sem.wait(Timeout::Forever).unwrap();
    assert_eq!(app.sem.count(), Ok(0));
    assert!(Task::<Traits>::current().unwrap().is_some());

    D::success();
}
