//! Checks `System::time`, `System::sleep`, and timeouts against the virtual
//! time.
use fennec_kernel::{
    QueueOrder, Semaphore, SleepError, System, Task, Timeout, WaitObjectError, DURATION_MAX,
};
use fennec_port_std::PortInstance;

use super::Driver;

pub struct App<Traits> {
    sem: Semaphore<Traits>,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        Task::<Traits>::define()
            .entry(task_body::<Traits, D>)
            .active(true)
            .finish()
            .unwrap();

        App {
            sem: Semaphore::new(0, 1, QueueOrder::Fifo).unwrap(),
        }
    }
}

fn task_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    assert_eq!(System::<Traits>::time(), Ok(0));

    System::<Traits>::sleep(Timeout::After(10)).unwrap();
    assert_eq!(System::<Traits>::time(), Ok(10));
    assert_eq!(fennec_port_std::now::<Traits>(), 10);

    System::<Traits>::sleep(Timeout::At(25)).unwrap();
    assert_eq!(System::<Traits>::time(), Ok(25));

    // A point of time in the past
    System::<Traits>::sleep(Timeout::At(25)).unwrap();
    System::<Traits>::sleep(Timeout::At(3)).unwrap();
    System::<Traits>::sleep(Timeout::Poll).unwrap();
    assert_eq!(System::<Traits>::time(), Ok(25));

    assert_eq!(
        System::<Traits>::sleep(Timeout::Forever),
        Err(SleepError::BadParam)
    );
    assert_eq!(
        System::<Traits>::sleep(Timeout::After(DURATION_MAX + 1)),
        Err(SleepError::BadParam)
    );

    // Simulated computation
    fennec_port_std::consume_time::<Traits>(7);
    assert_eq!(System::<Traits>::time(), Ok(32));

    // Timeouts of blocking operations
    assert_eq!(
        app.sem.wait(Timeout::After(8)),
        Err(WaitObjectError::Timeout)
    );
    assert_eq!(System::<Traits>::time(), Ok(40));
    assert_eq!(
        app.sem.wait(Timeout::At(45)),
        Err(WaitObjectError::Timeout)
    );
    assert_eq!(System::<Traits>::time(), Ok(45));
    assert_eq!(
        app.sem.wait(Timeout::After(DURATION_MAX + 1)),
        Err(WaitObjectError::BadParam)
    );

    D::success();
}
