//! Single-threaded readiness event loop.
//!
//! [`Events`] waits on any number of registered file descriptors and invokes
//! the callback of each ready descriptor on the thread calling [`Events::run`].
//! Callbacks may register, modify and unregister sources, including their own.
//!
//! The loop is stopped through a [`StopHandle`], which may be used from any thread
//! and from signal handlers.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    io::ErrorKind,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{Error, Result};

mod sys;

bitflags::bitflags! {
    /// Readiness a source is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// Data can be read.
        const READABLE = 0x01;
        /// Data can be written.
        const WRITABLE = 0x02;
        /// An exceptional condition, such as a pending V4L2 event.
        const PRIORITY = 0x04;
    }
}

bitflags::bitflags! {
    /// Readiness reported to a source callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u8 {
        /// Data can be read.
        const READABLE = 0x01;
        /// Data can be written.
        const WRITABLE = 0x02;
        /// An exceptional condition is pending.
        const PRIORITY = 0x04;
        /// An error condition is pending.
        const ERROR = 0x08;
        /// The peer hung up.
        const HANGUP = 0x10;
    }
}

impl Interest {
    fn to_epoll(self) -> u32 {
        let mut bits = 0;
        if self.contains(Self::READABLE) {
            bits |= sys::flags::IN;
        }
        if self.contains(Self::WRITABLE) {
            bits |= sys::flags::OUT;
        }
        if self.contains(Self::PRIORITY) {
            bits |= sys::flags::PRI;
        }
        bits
    }
}

impl Readiness {
    fn from_epoll(bits: u32) -> Self {
        let mut readiness = Self::empty();
        readiness.set(Self::READABLE, bits & sys::flags::IN != 0);
        readiness.set(Self::WRITABLE, bits & sys::flags::OUT != 0);
        readiness.set(Self::PRIORITY, bits & sys::flags::PRI != 0);
        readiness.set(Self::ERROR, bits & sys::flags::ERR != 0);
        readiness.set(Self::HANGUP, bits & sys::flags::HUP != 0);
        readiness
    }
}

/// Token of the internal wake-up eventfd.
const WAKER: u64 = 0;

/// Maximum number of ready sources handled per wait.
const MAX_EVENTS: usize = 32;

type Callback = Rc<RefCell<Box<dyn FnMut(Readiness) -> Result<()>>>>;

struct Entry {
    interest: Interest,
    callback: Callback,
}

#[derive(Default)]
struct Sources {
    next_token: u64,
    by_token: HashMap<u64, Entry>,
    by_fd: HashMap<RawFd, u64>,
}

struct Inner {
    epoll: OwnedFd,
    waker: Arc<OwnedFd>,
    stop: Arc<AtomicBool>,
    sources: RefCell<Sources>,
}

/// Event loop handle.
///
/// Clones refer to the same event loop.
#[derive(Clone)]
pub struct Events {
    inner: Rc<Inner>,
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Events")
            .field("sources", &self.inner.sources.borrow().by_token.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Events {
    /// Creates a new event loop without any sources.
    pub fn new() -> Result<Self> {
        let epoll = sys::create()?;
        let waker = rustix::event::eventfd(
            0,
            rustix::event::EventfdFlags::CLOEXEC | rustix::event::EventfdFlags::NONBLOCK,
        )?;
        sys::add(epoll.as_raw_fd(), waker.as_raw_fd(), sys::flags::IN, WAKER)?;

        Ok(Self {
            inner: Rc::new(Inner {
                epoll,
                waker: Arc::new(waker),
                stop: Arc::new(AtomicBool::new(false)),
                sources: RefCell::new(Sources { next_token: WAKER + 1, ..Default::default() }),
            }),
        })
    }

    /// Registers a source.
    ///
    /// `callback` is invoked with the observed readiness whenever `fd` becomes ready.
    /// An error returned by the callback ends [`run`](Self::run).
    ///
    /// Fails with [`Error::DuplicateSource`] if `fd` is already registered and
    /// with [`Error::InvalidDescriptor`] if it cannot be polled.
    pub fn register(
        &self, fd: impl AsFd, interest: Interest, callback: impl FnMut(Readiness) -> Result<()> + 'static,
    ) -> Result<()> {
        let fd = fd.as_fd().as_raw_fd();
        let mut sources = self.inner.sources.borrow_mut();
        if sources.by_fd.contains_key(&fd) {
            return Err(Error::DuplicateSource);
        }

        let token = sources.next_token;
        match sys::add(self.inner.epoll.as_raw_fd(), fd, interest.to_epoll(), token) {
            Ok(()) => (),
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => return Err(Error::DuplicateSource),
            Err(err) if matches!(err.raw_os_error(), Some(libc::EPERM | libc::EBADF)) => {
                return Err(Error::InvalidDescriptor)
            }
            Err(err) => return Err(err.into()),
        }

        sources.next_token += 1;
        sources.by_fd.insert(fd, token);
        sources.by_token.insert(token, Entry { interest, callback: Rc::new(RefCell::new(Box::new(callback))) });
        log::trace!("registered fd {fd} with interest {interest:?}");
        Ok(())
    }

    /// Changes the readiness a registered source is interested in.
    pub fn modify(&self, fd: impl AsFd, interest: Interest) -> Result<()> {
        let fd = fd.as_fd().as_raw_fd();
        let mut sources = self.inner.sources.borrow_mut();
        let Some(&token) = sources.by_fd.get(&fd) else {
            return Err(Error::Io(ErrorKind::NotFound.into()));
        };

        sys::modify(self.inner.epoll.as_raw_fd(), fd, interest.to_epoll(), token)?;
        if let Some(entry) = sources.by_token.get_mut(&token) {
            entry.interest = interest;
        }
        Ok(())
    }

    /// Removes a source.
    ///
    /// Does nothing if the source is not registered.
    pub fn unregister(&self, fd: impl AsFd) {
        let fd = fd.as_fd().as_raw_fd();
        let mut sources = self.inner.sources.borrow_mut();
        let Some(token) = sources.by_fd.remove(&fd) else { return };
        sources.by_token.remove(&token);

        if let Err(err) = sys::delete(self.inner.epoll.as_raw_fd(), fd) {
            log::trace!("removing fd {fd} from epoll failed: {err}");
        }
        log::trace!("unregistered fd {fd}");
    }

    /// Whether `fd` is registered.
    pub fn contains(&self, fd: impl AsFd) -> bool {
        self.inner.sources.borrow().by_fd.contains_key(&fd.as_fd().as_raw_fd())
    }

    /// Readiness the registered source `fd` is interested in.
    pub fn interest(&self, fd: impl AsFd) -> Option<Interest> {
        let sources = self.inner.sources.borrow();
        let token = sources.by_fd.get(&fd.as_fd().as_raw_fd())?;
        sources.by_token.get(token).map(|entry| entry.interest)
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.inner.sources.borrow().by_token.len()
    }

    /// Whether no sources are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle for stopping the event loop from any thread or signal handler.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stop: self.inner.stop.clone(), waker: self.inner.waker.clone() }
    }

    /// Stops the event loop.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Whether the event loop has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    /// Runs the event loop.
    ///
    /// Blocks until the loop is stopped, even while no sources are registered.
    /// Returns the first error returned by a callback or by the wait primitive.
    /// The loop may be run again after an error.
    pub fn run(&self) -> Result<()> {
        let epfd = self.inner.epoll.as_raw_fd();
        let mut events = [sys::empty_event(); MAX_EVENTS];

        while !self.is_stopped() {
            let n = match sys::wait(epfd, &mut events, -1) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };

            for event in &events[..n] {
                if self.is_stopped() {
                    break;
                }

                let (bits, token) = sys::event_parts(event);
                if token == WAKER {
                    let _ = sys::eventfd_drain(self.inner.waker.as_raw_fd());
                    continue;
                }

                // A source removed earlier in this batch must not be called.
                let Some(callback) = self.callback(token) else { continue };
                let mut callback = callback.borrow_mut();
                (*callback)(Readiness::from_epoll(bits))?;
            }
        }

        log::debug!("event loop stopped");
        Ok(())
    }

    fn callback(&self, token: u64) -> Option<Callback> {
        self.inner.sources.borrow().by_token.get(&token).map(|entry| entry.callback.clone())
    }
}

/// Stops an event loop.
///
/// Stopping is idempotent and performs neither allocation nor locking.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<OwnedFd>,
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StopHandle").field("stopped", &self.stop.load(Ordering::Relaxed)).finish()
    }
}

impl StopHandle {
    /// Stops the event loop.
    ///
    /// [`Events::run`] returns before dispatching further callbacks.
    /// A callback that is already running is not interrupted.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        // The counter may already be saturated; the loop wakes up either way.
        let _ = sys::eventfd_signal(self.waker.as_raw_fd());
    }
}
