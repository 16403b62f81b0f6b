//! Passes records of various sizes through [`fennec_kernel::Mailbox`]es and
//! checks that they come out intact and in order.
use fennec_kernel::{CreateError, Mailbox, QueryError, Task, TaskState, Timeout, WaitObjectError};
use fennec_port_std::PortInstance;

use super::Driver;
use crate::SeqTracker;

const RECORD_SIZES: [usize; 4] = [1, 3, 8, 16];
const LIMIT: usize = 4;

pub struct App<Traits> {
    receiver: Task<Traits>,
    sender: Task<Traits>,
    victim: Task<Traits>,
    mbs: [Mailbox<Traits>; RECORD_SIZES.len()],
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
        let [receiver, sender, victim] = [
            receiver_body::<Traits, D> as fn(),
            sender_body::<Traits, D>,
            victim_body::<Traits, D>,
        ]
        .map(|entry| {
            Task::<Traits>::define()
                .entry(entry)
                .priority(1)
                .finish()
                .unwrap()
        });

        App {
            receiver,
            sender,
            victim,
            mbs: RECORD_SIZES.map(|record_size| Mailbox::new(record_size, LIMIT).unwrap()),
            seq: SeqTracker::new(),
        }
    }
}

/// The `i`-th record of the test pattern
fn record(record_size: usize, i: usize) -> Vec<u8> {
    (0..record_size).map(|k| (i * 31 + k * 7) as u8).collect()
}

fn task1_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(0, 1);

    assert_eq!(Mailbox::<Traits>::new(0, 1), Err(CreateError::BadParam));
    assert_eq!(Mailbox::<Traits>::new(1, 0), Err(CreateError::BadParam));
    assert_eq!(
        Mailbox::<Traits>::new(usize::MAX, 2),
        Err(CreateError::BadParam)
    );

    for (&mb, &record_size) in app.mbs.iter().zip(RECORD_SIZES.iter()) {
        log::debug!("record size = {record_size}");
        assert_eq!(mb.capacity(), Ok(LIMIT));

        for i in 0..LIMIT {
            mb.send(&record(record_size, i), Timeout::Poll).unwrap();
        }
        assert_eq!(mb.len(), Ok(LIMIT));
        assert_eq!(
            mb.send(&record(record_size, LIMIT), Timeout::Poll),
            Err(WaitObjectError::Timeout)
        );

        let mut buf = vec![0u8; record_size];
        for i in 0..LIMIT {
            mb.recv(&mut buf, Timeout::Poll).unwrap();
            assert_eq!(buf, record(record_size, i));
        }
        assert_eq!(mb.len(), Ok(0));
        assert_eq!(mb.recv(&mut buf, Timeout::Poll), Err(WaitObjectError::Timeout));

        // The buffer must be exactly one record long
        let mut wrong = vec![0u8; record_size + 1];
        assert_eq!(mb.send(&wrong, Timeout::Poll), Err(WaitObjectError::BadParam));
        assert_eq!(
            mb.recv(&mut wrong, Timeout::Poll),
            Err(WaitObjectError::BadParam)
        );
    }

    let mb = app.mbs[2];
    let mut buf = [0u8; 8];

    // `send` hands a record directly to a waiting receiver
    app.receiver.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    mb.send(&record(8, 100), Timeout::Poll).unwrap();
    app.seq.expect_and_replace(4, 5);
    assert_eq!(mb.len(), Ok(0));

    // `recv` makes room for a blocked sender
    for i in 0..LIMIT {
        mb.send(&record(8, i), Timeout::Poll).unwrap();
    }
    app.sender.start().unwrap();
    app.seq.expect_and_replace(6, 7);
    assert_eq!(app.sender.state(), Ok(TaskState::Waiting));
    mb.recv(&mut buf, Timeout::Poll).unwrap();
    assert_eq!(buf[..], record(8, 0)[..]);
    app.seq.expect_and_replace(8, 9);
    assert_eq!(mb.len(), Ok(LIMIT));
    for i in (1..LIMIT).chain([200]) {
        mb.recv(&mut buf, Timeout::Poll).unwrap();
        assert_eq!(buf[..], record(8, i)[..]);
    }

    // `kill` discards the records and fails the waiters
    mb.send(&record(8, 0), Timeout::Poll).unwrap();
    mb.kill().unwrap();
    assert_eq!(mb.len(), Ok(0));
    assert_eq!(mb.recv(&mut buf, Timeout::Poll), Err(WaitObjectError::Timeout));
    app.victim.start().unwrap();
    app.seq.expect_and_replace(10, 11);
    mb.kill().unwrap();
    app.seq.expect_and_replace(12, 13);

    mb.delete().unwrap();
    assert_eq!(mb.len(), Err(QueryError::BadId));

    D::success();
}

fn receiver_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(1, 2);
    let mut buf = [0u8; 8];
    app.mbs[2].recv(&mut buf, Timeout::Forever).unwrap();
    assert_eq!(buf[..], record(8, 100)[..]);
    app.seq.expect_and_replace(3, 4);
}

fn sender_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(5, 6);
    app.mbs[2].send(&record(8, 200), Timeout::Forever).unwrap();
    app.seq.expect_and_replace(7, 8);
}

fn victim_body<Traits: PortInstance, D: Driver<App<Traits>>>() {
    let app = D::app();

    app.seq.expect_and_replace(9, 10);
    let mut buf = [0u8; 8];
    assert_eq!(
        app.mbs[2].recv(&mut buf, Timeout::Forever),
        Err(WaitObjectError::Stopped)
    );
    app.seq.expect_and_replace(11, 12);
}
