//! Sources emitting one frame per frame interval.

use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags, Timespec,
};
use std::{
    collections::VecDeque,
    fmt,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    time::{Duration, Instant},
};

use super::{SourceEvents, StreamFormat, VideoSource};
use crate::{
    buffer::{BufferPool, Filled, Ownership},
    Error, Interest, Readiness, Result,
};

/// Shortest frame period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Periodic monotonic timer.
#[derive(Debug)]
struct Timer {
    fd: OwnedFd,
}

impl Timer {
    fn new(period: Duration) -> Result<Self> {
        let fd = timerfd_create(TimerfdClockId::Monotonic, TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC)?;

        let period = period.max(MIN_PERIOD);
        let spec = Timespec { tv_sec: period.as_secs() as _, tv_nsec: period.subsec_nanos() as _ };
        timerfd_settime(&fd, TimerfdTimerFlags::empty(), &Itimerspec { it_interval: spec, it_value: spec })?;

        Ok(Self { fd })
    }

    /// Number of expirations since the last call.
    fn expirations(&self) -> Result<u64> {
        let mut buf = [0; 8];
        match rustix::io::read(&self.fd, &mut buf[..]) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            Ok(_) => Ok(0),
            Err(rustix::io::Errno::AGAIN) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl AsFd for Timer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Generator of frame contents for a [`TimedSource`].
pub trait FrameProducer {
    /// Short description for logging.
    fn name(&self) -> String;

    /// Returns the format the producer will actually deliver for the requested one.
    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        *requested
    }

    /// Prepares production of the given format into frame buffers of `capacity` bytes.
    fn start(&mut self, _format: &StreamFormat, _capacity: usize) -> Result<()> {
        Ok(())
    }

    /// Writes the next frame and returns its length.
    fn produce(&mut self, frame: &mut [u8]) -> Result<usize>;

    /// Ends production.
    fn stop(&mut self) {}
}

/// Video source emitting a frame generated by a [`FrameProducer`] each frame interval.
///
/// A frame is dropped when no buffer is available at its due time.
pub struct TimedSource<P> {
    producer: P,
    timer: Option<Timer>,
    offered: VecDeque<usize>,
    epoch: Instant,
    dropped: u64,
}

impl<P: FrameProducer> fmt::Debug for TimedSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimedSource")
            .field("producer", &self.producer.name())
            .field("offered", &self.offered)
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl<P: FrameProducer> TimedSource<P> {
    /// Creates a timed source using the specified producer.
    pub fn new(producer: P) -> Self {
        Self { producer, timer: None, offered: VecDeque::new(), epoch: Instant::now(), dropped: 0 }
    }

    /// The frame producer.
    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Number of frames dropped because no buffer was available.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<P: FrameProducer> VideoSource for TimedSource<P> {
    fn name(&self) -> String {
        self.producer.name()
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        self.producer.negotiate_format(requested)
    }

    fn start(&mut self, format: &StreamFormat, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        self.producer.start(format, pool.capacity())?;

        let timer = Timer::new(format.frame_duration()).map_err(|err| Error::SourceUnavailable(err.to_string()))?;
        events.register(&timer, Interest::READABLE)?;
        self.timer = Some(timer);

        let free: Vec<_> = pool.indices(Ownership::Free).collect();
        for index in free {
            pool.claim(index)?;
            self.offered.push_back(index);
        }

        self.epoch = Instant::now();
        self.dropped = 0;
        log::debug!("{} started with {} buffers", self.producer.name(), self.offered.len());
        Ok(())
    }

    fn stop(&mut self, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        if let Some(timer) = self.timer.take() {
            events.unregister(&timer);
        }
        for index in self.offered.drain(..) {
            pool.reclaim(index)?;
        }
        self.producer.stop();

        if self.dropped > 0 {
            log::info!("{} dropped {} frames", self.producer.name(), self.dropped);
        }
        Ok(())
    }

    fn on_ready(&mut self, pool: &mut BufferPool, readiness: Readiness) -> Result<Option<Filled>> {
        let Some(timer) = &self.timer else { return Ok(None) };
        if !readiness.contains(Readiness::READABLE) {
            return Ok(None);
        }

        let expirations = timer.expirations().map_err(|err| Error::SourceError(err.to_string()))?;
        if expirations == 0 {
            return Ok(None);
        }
        if expirations > 1 {
            log::trace!("{} missed {} frame periods", self.producer.name(), expirations - 1);
        }

        let Some(index) = self.offered.pop_front() else {
            self.dropped += 1;
            log::trace!("{}: no buffer available, dropping frame", self.producer.name());
            return Ok(None);
        };

        let frame = pool.source_buffer(index)?;
        let len = match self.producer.produce(frame) {
            Ok(len) => len,
            Err(err) => {
                self.offered.push_front(index);
                return Err(err);
            }
        };

        Ok(Some(pool.fill(index, len, self.epoch.elapsed(), false)?))
    }

    fn release(&mut self, pool: &mut BufferPool, index: usize) -> Result<()> {
        pool.claim(index)?;
        self.offered.push_back(index);
        Ok(())
    }
}
