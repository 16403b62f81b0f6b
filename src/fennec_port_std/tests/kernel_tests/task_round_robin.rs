//! Runs two compute-bound tasks of the same priority with a time slice of 5
//! ticks and checks that they take turns.
use fennec_kernel::Task;
use fennec_port_std::PortInstance;
use std::sync::Mutex as StdMutex;

use super::Driver;

const NUM_ROUNDS: usize = 4;

pub struct App<Traits> {
    trace: StdMutex<Vec<usize>>,
    checker: Task<Traits>,
}

impl<Traits: PortInstance> App<Traits> {
    pub fn new<D: Driver<Self>>() -> Self {
        for i in 0..2 {
            Task::<Traits>::define()
                .entry(move || worker_body::<Traits, D>(i))
                .priority(1)
                .active(true)
                .finish()
                .unwrap();
        }

        let checker = Task::<Traits>::define()
            .entry(checker_body::<Traits, D>)
            .priority(2)
            .active(true)
            .finish()
            .unwrap();

        App {
            trace: StdMutex::new(Vec::new()),
            checker,
        }
    }
}

fn worker_body<Traits: PortInstance, D: Driver<App<Traits>>>(i: usize) {
    let app = D::app();
    for _ in 0..NUM_ROUNDS {
        app.trace.lock().unwrap().push(i);
        // Exhausts the time slice
        fennec_port_std::consume_time::<Traits>(5);
    }
}

fn checker_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();
    assert_eq!(Task::<Traits>::current().unwrap(), Some(app.checker));

    let trace = app.trace.lock().unwrap().clone();
    log::debug!("trace = {:?}", trace);
    assert_eq!(trace, [0, 1, 0, 1, 0, 1, 0, 1]);
    assert_eq!(fennec_port_std::now::<Traits>(), 40);

    D::success();
}
