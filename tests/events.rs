mod common;
use common::init;

use rustix::event::{eventfd, EventfdFlags};
use std::{
    cell::{Cell, RefCell},
    os::fd::OwnedFd,
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

use uvc_gadget::{Error, Events, Interest, Readiness};

fn counter() -> OwnedFd {
    eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap()
}

fn signal(fd: &OwnedFd) {
    rustix::io::write(fd, &1u64.to_ne_bytes()).unwrap();
}

fn drain(fd: &OwnedFd) -> u64 {
    let mut buf = [0; 8];
    rustix::io::read(fd, &mut buf).unwrap();
    u64::from_ne_bytes(buf)
}

#[test]
fn ready_source_is_dispatched() {
    init();
    let events = Events::new().unwrap();
    let fd = Rc::new(counter());
    let seen = Rc::new(RefCell::new(Vec::new()));

    events
        .register(&*fd, Interest::READABLE, {
            let (fd, seen, stop) = (fd.clone(), seen.clone(), events.stop_handle());
            move |readiness| {
                seen.borrow_mut().push((readiness, drain(&fd)));
                stop.stop();
                Ok(())
            }
        })
        .unwrap();
    assert!(events.contains(&*fd));
    assert_eq!(events.interest(&*fd), Some(Interest::READABLE));

    signal(&fd);
    signal(&fd);
    events.run().unwrap();

    assert_eq!(*seen.borrow(), vec![(Readiness::READABLE, 2)]);
}

#[test]
fn duplicate_source() {
    let events = Events::new().unwrap();
    let fd = counter();

    events.register(&fd, Interest::READABLE, |_| Ok(())).unwrap();
    assert!(matches!(events.register(&fd, Interest::WRITABLE, |_| Ok(())), Err(Error::DuplicateSource)));
    assert_eq!(events.len(), 1);

    events.unregister(&fd);
    assert!(events.is_empty());
    events.unregister(&fd);

    events.register(&fd, Interest::WRITABLE, |_| Ok(())).unwrap();
    assert_eq!(events.interest(&fd), Some(Interest::WRITABLE));
}

#[test]
fn regular_file_cannot_be_polled() {
    let events = Events::new().unwrap();
    let file = tempfile::tempfile().unwrap();

    assert!(matches!(events.register(&file, Interest::READABLE, |_| Ok(())), Err(Error::InvalidDescriptor)));
    assert!(events.is_empty());
}

#[test]
fn callback_error_ends_run() {
    init();
    let events = Events::new().unwrap();
    let fd = counter();
    let calls = Rc::new(Cell::new(0));

    events
        .register(&fd, Interest::READABLE, {
            let (calls, stop) = (calls.clone(), events.stop_handle());
            move |_| {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    return Err(Error::SourceError("broken frame".to_string()));
                }
                stop.stop();
                Ok(())
            }
        })
        .unwrap();

    // Level triggered: the source stays ready until drained.
    signal(&fd);
    assert!(matches!(events.run(), Err(Error::SourceError(_))));
    assert_eq!(calls.get(), 1);

    events.run().unwrap();
    assert_eq!(calls.get(), 2);
}

#[test]
fn callback_unregisters_sources() {
    init();
    let events = Events::new().unwrap();
    let a = Rc::new(counter());
    let b = Rc::new(counter());
    let done = counter();
    let calls = Rc::new(Cell::new(0));

    for fd in [&a, &b] {
        events
            .register(&**fd, Interest::READABLE, {
                let (events, a, b, calls) = (events.clone(), a.clone(), b.clone(), calls.clone());
                let done = done.try_clone().unwrap();
                move |_| {
                    calls.set(calls.get() + 1);
                    events.unregister(&*a);
                    events.unregister(&*b);
                    signal(&done);
                    Ok(())
                }
            })
            .unwrap();
    }
    events
        .register(&done, Interest::READABLE, {
            let stop = events.stop_handle();
            move |_| {
                stop.stop();
                Ok(())
            }
        })
        .unwrap();

    signal(&a);
    signal(&b);
    events.run().unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(events.len(), 1);
    assert!(events.contains(&done));
}

#[test]
fn callback_modifies_interest() {
    init();
    let events = Events::new().unwrap();
    let fd = Rc::new(counter());
    let calls = Rc::new(Cell::new(0));

    // An eventfd is always writable.
    events
        .register(&*fd, Interest::WRITABLE, {
            let (events, fd, calls) = (events.clone(), fd.clone(), calls.clone());
            move |readiness| {
                assert!(readiness.contains(Readiness::WRITABLE));
                calls.set(calls.get() + 1);
                events.modify(&*fd, Interest::READABLE)
            }
        })
        .unwrap();

    let stop = events.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.stop();
    });
    events.run().unwrap();
    stopper.join().unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(events.interest(&*fd), Some(Interest::READABLE));
}

#[test]
fn modify_unknown_source() {
    let events = Events::new().unwrap();
    let fd = counter();
    assert!(matches!(events.modify(&fd, Interest::READABLE), Err(Error::Io(_))));
}

#[test]
fn stop_from_other_thread() {
    init();
    let events = Events::new().unwrap();
    let stop = events.stop_handle();

    let start = Instant::now();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.stop();
        stop.stop();
    });

    // Blocks without any registered source.
    events.run().unwrap();
    stopper.join().unwrap();

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(events.is_stopped());
}
