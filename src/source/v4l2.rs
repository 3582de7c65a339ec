use rustix::fs::{Mode, OFlags};
use std::{
    collections::VecDeque,
    fmt,
    io::ErrorKind,
    os::fd::{AsFd, OwnedFd},
    path::{Path, PathBuf},
    time::Duration,
};

use super::{SourceEvents, StreamFormat, VideoSource};
use crate::{
    buffer::{BufferPool, Filled, Ownership},
    v4l2::{self, MappedBuffer, V4l2Buffer, V4l2CaptureParm, V4l2Format, V4l2Fract, V4l2PixFormat, V4l2Streamparm},
    Error, Interest, Readiness, Result, UvcFormat,
};

/// Number of capture buffers requested from the device.
const CAPTURE_BUFFERS: u32 = 4;

/// Frames captured from a V4L2 video capture device.
///
/// Each captured frame is copied into a free pool buffer and the capture
/// buffer is requeued immediately. Frames are dropped while no pool buffer is free.
pub struct V4l2Capture {
    path: PathBuf,
    card: String,
    fd: OwnedFd,
    buffers: Vec<MappedBuffer>,
    offered: VecDeque<usize>,
    streaming: bool,
    dropped: u64,
}

impl fmt::Debug for V4l2Capture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("V4l2Capture")
            .field("path", &self.path)
            .field("card", &self.card)
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl V4l2Capture {
    /// Opens a video capture device.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |msg: String| Error::SourceUnavailable(format!("{}: {msg}", path.display()));

        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC, Mode::empty())
            .map_err(|err| unavailable(err.to_string()))?;
        let cap = v4l2::querycap(fd.as_fd()).map_err(|err| unavailable(err.to_string()))?;

        let caps = cap.node_caps();
        if caps & v4l2::CAP_VIDEO_CAPTURE == 0 || caps & v4l2::CAP_STREAMING == 0 {
            return Err(unavailable("not a streaming video capture device".to_string()));
        }

        let card = cap.card();
        log::debug!("opened capture device {} ({card})", path.display());
        Ok(Self { path, card, fd, buffers: Vec::new(), offered: VecDeque::new(), streaming: false, dropped: 0 })
    }

    fn pix_format(format: &StreamFormat) -> V4l2Format {
        let pix = V4l2PixFormat {
            width: format.width,
            height: format.height,
            pixelformat: format.format.fourcc(),
            field: v4l2::FIELD_NONE,
            ..Default::default()
        };
        V4l2Format::pix(v4l2::BUF_TYPE_VIDEO_CAPTURE, pix)
    }

    fn configure(&mut self, format: &StreamFormat) -> std::io::Result<()> {
        let mut fmt = Self::pix_format(format);
        v4l2::s_fmt(self.fd.as_fd(), &mut fmt)?;
        let pix = fmt.pix_format();
        if pix.width != format.width || pix.height != format.height || pix.pixelformat != format.format.fourcc() {
            log::warn!(
                "capture device {} uses {}x{} instead of requested {format}",
                self.path.display(),
                pix.width,
                pix.height
            );
        }

        let mut parm = V4l2Streamparm { type_: v4l2::BUF_TYPE_VIDEO_CAPTURE, ..Default::default() };
        parm.parm.capture = V4l2CaptureParm {
            timeperframe: V4l2Fract { numerator: format.interval, denominator: 10_000_000 },
            ..Default::default()
        };
        if let Err(err) = v4l2::s_parm(self.fd.as_fd(), &mut parm) {
            log::debug!("capture device does not support setting the frame interval: {err}");
        }

        let count = v4l2::reqbufs(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_CAPTURE, CAPTURE_BUFFERS)?;
        for index in 0..count {
            let buf = v4l2::querybuf(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_CAPTURE, index)?;
            self.buffers.push(MappedBuffer::map(self.fd.as_fd(), buf.offset(), buf.length as usize)?);
            v4l2::qbuf(self.fd.as_fd(), &mut V4l2Buffer::new(v4l2::BUF_TYPE_VIDEO_CAPTURE, index))?;
        }

        v4l2::streamon(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_CAPTURE)?;
        self.streaming = true;
        log::debug!("capture device {} streaming with {count} buffers", self.path.display());
        Ok(())
    }

    fn teardown(&mut self) {
        if self.streaming {
            if let Err(err) = v4l2::streamoff(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_CAPTURE) {
                log::warn!("stopping capture device {} failed: {err}", self.path.display());
            }
            self.streaming = false;
        }
        self.buffers.clear();
        let _ = v4l2::reqbufs(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_CAPTURE, 0);
    }
}

impl VideoSource for V4l2Capture {
    fn name(&self) -> String {
        format!("capture device {}", self.path.display())
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        let mut fmt = Self::pix_format(requested);
        match v4l2::try_fmt(self.fd.as_fd(), &mut fmt) {
            Ok(()) => {
                let pix = fmt.pix_format();
                StreamFormat {
                    format: UvcFormat::from_fourcc(pix.pixelformat).unwrap_or(requested.format),
                    width: pix.width,
                    height: pix.height,
                    interval: requested.interval,
                }
            }
            Err(err) => {
                log::debug!("TRY_FMT on {} failed: {err}", self.path.display());
                *requested
            }
        }
    }

    fn start(&mut self, format: &StreamFormat, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        if let Err(err) = self.configure(format) {
            self.teardown();
            return Err(Error::SourceUnavailable(format!("{}: {err}", self.path.display())));
        }
        if let Err(err) = events.register(&self.fd, Interest::READABLE) {
            self.teardown();
            return Err(err);
        }

        let free: Vec<_> = pool.indices(Ownership::Free).collect();
        for index in free {
            pool.claim(index)?;
            self.offered.push_back(index);
        }
        self.dropped = 0;
        Ok(())
    }

    fn stop(&mut self, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        events.unregister(&self.fd);
        self.teardown();
        for index in self.offered.drain(..) {
            pool.reclaim(index)?;
        }
        if self.dropped > 0 {
            log::info!("capture device {} dropped {} frames", self.path.display(), self.dropped);
        }
        Ok(())
    }

    fn on_ready(&mut self, pool: &mut BufferPool, readiness: Readiness) -> Result<Option<Filled>> {
        if !self.streaming {
            return Ok(None);
        }
        if readiness.contains(Readiness::ERROR) && !readiness.contains(Readiness::READABLE) {
            return Err(Error::SourceError(format!("capture device {} reported an error", self.path.display())));
        }

        let buf = match v4l2::dqbuf(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_CAPTURE) {
            Ok(buf) => buf,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(Error::SourceError(format!("{}: {err}", self.path.display()))),
        };

        let Some(mem) = self.buffers.get(buf.index as usize) else {
            return Err(Error::SourceError(format!("capture device returned unknown buffer {}", buf.index)));
        };

        let filled = match self.offered.pop_front() {
            Some(index) => {
                let data = &mem.as_slice()[..(buf.bytesused as usize).min(mem.len())];
                let dst = pool.source_buffer(index)?;
                let len = data.len().min(dst.len());
                if len < data.len() {
                    log::warn!("captured frame of {} bytes truncated to {len} bytes", data.len());
                }
                dst[..len].copy_from_slice(&data[..len]);

                let timestamp = Duration::new(
                    buf.timestamp.tv_sec.max(0) as u64,
                    (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000),
                );
                let error = buf.flags & v4l2::BUF_FLAG_ERROR != 0 || len < data.len();
                Some(pool.fill(index, len, timestamp, error)?)
            }
            None => {
                self.dropped += 1;
                log::trace!("no buffer available, dropping captured frame {}", buf.sequence);
                None
            }
        };

        let mut requeue = V4l2Buffer::new(v4l2::BUF_TYPE_VIDEO_CAPTURE, buf.index);
        v4l2::qbuf(self.fd.as_fd(), &mut requeue)
            .map_err(|err| Error::SourceError(format!("{}: {err}", self.path.display())))?;

        Ok(filled)
    }

    fn release(&mut self, pool: &mut BufferPool, index: usize) -> Result<()> {
        pool.claim(index)?;
        self.offered.push_back(index);
        Ok(())
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        if self.streaming {
            self.teardown();
        }
    }
}
