//! Linux epoll and eventfd interface.

use libc::{c_int, epoll_event, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD};
use std::{
    io::{Error, Result},
    os::fd::{FromRawFd, OwnedFd, RawFd},
};

/// Event bits for [`epoll_event::events`].
pub mod flags {
    pub const IN: u32 = libc::EPOLLIN as u32;
    pub const PRI: u32 = libc::EPOLLPRI as u32;
    pub const OUT: u32 = libc::EPOLLOUT as u32;
    pub const ERR: u32 = libc::EPOLLERR as u32;
    pub const HUP: u32 = libc::EPOLLHUP as u32;
}

/// An empty event record for use as wait output.
pub fn empty_event() -> epoll_event {
    epoll_event { events: 0, u64: 0 }
}

/// Fields of an event record.
pub fn event_parts(event: &epoll_event) -> (u32, u64) {
    // Copy out of the packed struct before use.
    let events = event.events;
    let data = event.u64;
    (events, data)
}

/// open an epoll file descriptor
pub fn create() -> Result<OwnedFd> {
    match unsafe { libc::epoll_create1(EPOLL_CLOEXEC) } {
        -1 => Err(Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
    }
}

fn ctl(epfd: RawFd, op: c_int, fd: RawFd, events: u32, data: u64) -> Result<()> {
    let mut event = epoll_event { events, u64: data };
    match unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) } {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// add a file descriptor to the interest list
pub fn add(epfd: RawFd, fd: RawFd, events: u32, data: u64) -> Result<()> {
    ctl(epfd, EPOLL_CTL_ADD, fd, events, data)
}

/// change the settings of a file descriptor in the interest list
pub fn modify(epfd: RawFd, fd: RawFd, events: u32, data: u64) -> Result<()> {
    ctl(epfd, EPOLL_CTL_MOD, fd, events, data)
}

/// remove a file descriptor from the interest list
pub fn delete(epfd: RawFd, fd: RawFd) -> Result<()> {
    ctl(epfd, EPOLL_CTL_DEL, fd, 0, 0)
}

/// wait for events, blocking indefinitely if `timeout` is negative
pub fn wait(epfd: RawFd, events: &mut [epoll_event], timeout: c_int) -> Result<usize> {
    match unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as c_int, timeout) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Increase the counter of an eventfd by one.
///
/// Async-signal-safe: performs a single `write` system call.
pub fn eventfd_signal(fd: RawFd) -> Result<()> {
    let buf = 1u64.to_ne_bytes();
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
    if ret != buf.len() as _ {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Reset the counter of a non-blocking eventfd.
pub fn eventfd_drain(fd: RawFd) -> Result<u64> {
    let mut buf = [0; 8];
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    if ret != buf.len() as _ {
        return Err(Error::last_os_error());
    }
    Ok(u64::from_ne_bytes(buf))
}
