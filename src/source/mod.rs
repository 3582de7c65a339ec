//! Video sources.
//!
//! A [`VideoSource`] produces frames into the buffers of a [`BufferPool`].
//! The stream offers it every free buffer when streaming starts and hands each
//! buffer back through [`VideoSource::release`] once the host has received it.
//!
//! Available backends:
//!   * [`V4l2Capture`]: a V4L2 video capture device,
//!   * `LibcameraSource`: a libcamera camera tuned by [`CameraControls`],
//!     available with the `libcamera` feature,
//!   * [`TimedSource`] with a [`FrameProducer`], emitting a frame per frame interval:
//!     [`TestPattern`], [`JpegImage`] and [`Slideshow`].

use std::{fmt, os::fd::AsFd, rc::Rc, time::Duration};

use crate::{
    buffer::{BufferPool, Filled},
    Events, Interest, Readiness, Result, UvcFormat,
};

mod camera;
mod jpeg;
#[cfg(feature = "libcamera")]
mod libcam;
mod pattern;
mod slideshow;
mod timer;
mod v4l2;

pub use camera::{
    check_range, AfRange, AfSpeed, AwbMode, CameraControls, ColourGains, ExposureMode, BRIGHTNESS_RANGE,
    COLOUR_GAIN_RANGE, CONTRAST_RANGE, LENS_POSITION_RANGE, SATURATION_RANGE, SHARPNESS_RANGE,
};
pub use jpeg::JpegImage;
#[cfg(feature = "libcamera")]
pub use libcam::LibcameraSource;
pub use pattern::TestPattern;
pub use slideshow::{Slideshow, DEFAULT_SLIDE_DURATION};
pub use timer::{FrameProducer, TimedSource};
pub use v4l2::V4l2Capture;

/// Format, frame size and frame interval of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    /// Frame format.
    pub format: UvcFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame interval in 100 ns units.
    pub interval: u32,
}

impl StreamFormat {
    /// Time between two frames.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(u64::from(self.interval) * 100)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fps = if self.interval > 0 { 10_000_000.0 / self.interval as f64 } else { 0.0 };
        write!(f, "{} {}x{} @ {fps:.2} fps", self.format, self.width, self.height)
    }
}

/// Access of a video source to the event loop.
///
/// Readiness of every source registered here is delivered to the stream,
/// which calls [`VideoSource::on_ready`].
#[derive(Clone)]
pub struct SourceEvents {
    events: Events,
    dispatch: Rc<dyn Fn(Readiness) -> Result<()>>,
}

impl fmt::Debug for SourceEvents {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SourceEvents").field("events", &self.events).finish()
    }
}

impl SourceEvents {
    pub(crate) fn new(events: Events, dispatch: impl Fn(Readiness) -> Result<()> + 'static) -> Self {
        Self { events, dispatch: Rc::new(dispatch) }
    }

    /// Registers a readiness source of the video source.
    pub fn register(&self, fd: impl AsFd, interest: Interest) -> Result<()> {
        let dispatch = self.dispatch.clone();
        self.events.register(fd, interest, move |readiness| dispatch(readiness))
    }

    /// Removes a readiness source of the video source.
    pub fn unregister(&self, fd: impl AsFd) {
        self.events.unregister(fd)
    }
}

/// Producer of video frames.
pub trait VideoSource {
    /// Short description for logging.
    fn name(&self) -> String;

    /// Returns the format the source will actually deliver for the requested one.
    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        *requested
    }

    /// Starts production.
    ///
    /// All buffers of `pool` are free; the source claims those it wants to fill
    /// and registers its readiness sources.
    /// Fails with [`Error::SourceUnavailable`](crate::Error::SourceUnavailable) if the source cannot start.
    fn start(&mut self, format: &StreamFormat, pool: &mut BufferPool, events: &SourceEvents) -> Result<()>;

    /// Stops production.
    ///
    /// Unregisters the readiness sources and reclaims every buffer still held.
    fn stop(&mut self, pool: &mut BufferPool, events: &SourceEvents) -> Result<()>;

    /// Handles readiness of a registered source.
    ///
    /// Returns at most one filled buffer.
    /// Fails with [`Error::SourceError`](crate::Error::SourceError) if production failed.
    fn on_ready(&mut self, pool: &mut BufferPool, readiness: Readiness) -> Result<Option<Filled>>;

    /// Hands a transmitted, now free buffer back to the source.
    fn release(&mut self, pool: &mut BufferPool, index: usize) -> Result<()>;
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        (**self).negotiate_format(requested)
    }

    fn start(&mut self, format: &StreamFormat, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        (**self).start(format, pool, events)
    }

    fn stop(&mut self, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        (**self).stop(pool, events)
    }

    fn on_ready(&mut self, pool: &mut BufferPool, readiness: Readiness) -> Result<Option<Filled>> {
        (**self).on_ready(pool, readiness)
    }

    fn release(&mut self, pool: &mut BufferPool, index: usize) -> Result<()> {
        (**self).release(pool, index)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_format_duration() {
        let format = StreamFormat { format: UvcFormat::Yuyv, width: 640, height: 360, interval: 666666 };
        assert_eq!(format.frame_duration(), Duration::from_nanos(66_666_600));
        assert_eq!(format.to_string(), "YUYV 640x360 @ 15.00 fps");
    }
}
