use rustix::fs::{Mode, OFlags};
use std::{
    collections::VecDeque,
    fmt,
    io::{Error, ErrorKind, Result},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use super::{Completion, NodeEvent, Response, VideoNode};
use crate::{
    source::StreamFormat,
    uvc::{CtrlReq, HeaderInfo},
    v4l2::{self, event, MappedBuffer, UvcRequestData, V4l2Buffer, V4l2Format, V4l2PixFormat},
};

/// Number of frame buffers requested from the kernel driver.
const KERNEL_BUFFERS: u32 = 4;

/// Collects payloads into whole frames for the kernel driver.
///
/// The driver transmits each of its buffers as one frame and writes the payload
/// headers itself. Payload headers are therefore stripped and the payload data
/// of a frame is gathered in one kernel buffer, which is queued once the payload
/// carrying the end of frame flag arrives.
///
/// Payload slots are completed as soon as their data is copied.
/// A free kernel buffer is needed to start a new frame.
#[derive(Debug)]
struct FrameAssembler<B> {
    buffers: Vec<B>,
    slots: u32,
    free: VecDeque<u32>,
    current: Option<(u32, usize)>,
    done: VecDeque<Completion>,
}

impl<B: AsMut<[u8]>> FrameAssembler<B> {
    fn new(buffers: Vec<B>, slots: u32) -> Self {
        let free = (0..buffers.len() as u32).collect();
        Self { buffers, slots, free, current: None, done: VecDeque::new() }
    }

    /// Appends the data of a payload to the current frame.
    ///
    /// Returns the kernel buffer and its length once the frame is complete.
    fn push(&mut self, slot: u32, payload: &[u8]) -> Result<Option<(u32, usize)>> {
        if slot >= self.slots {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid payload slot"));
        }
        let (len, info) = match payload {
            [len, info, ..] if (2..=payload.len()).contains(&(*len as usize)) => {
                (*len as usize, HeaderInfo::from_bits_retain(*info))
            }
            _ => return Err(Error::new(ErrorKind::InvalidInput, "malformed payload header")),
        };

        let (index, used) = match self.current {
            Some(current) => current,
            None => (self.free.pop_front().ok_or(ErrorKind::WouldBlock)?, 0),
        };

        let data = &payload[len..];
        let Some(dst) = self.buffers[index as usize].as_mut().get_mut(used..used + data.len()) else {
            self.free.push_front(index);
            self.current = None;
            return Err(Error::new(ErrorKind::InvalidInput, "frame exceeds kernel buffer"));
        };
        dst.copy_from_slice(data);
        self.done.push_back(Completion { slot, failed: false });

        if info.contains(HeaderInfo::EOF) {
            self.current = None;
            Ok(Some((index, used + data.len())))
        } else {
            self.current = Some((index, used + data.len()));
            Ok(None)
        }
    }

    /// Makes a kernel buffer available again.
    fn release(&mut self, index: u32) {
        if (index as usize) < self.buffers.len() && !self.free.contains(&index) {
            self.free.push_back(index);
        }
    }

    /// Returns every kernel buffer and forgets pending completions.
    fn reset(&mut self) {
        self.free = (0..self.buffers.len() as u32).collect();
        self.current = None;
        self.done.clear();
    }
}

/// Video device of a UVC gadget function.
///
/// Payloads are gathered into whole frames, see [`crate::node`].
/// The kernel driver generates its own payload headers, so frame identifier
/// toggling is done by the driver and presentation time stamps and source clock
/// references are not transmitted.
pub struct UvcDevice {
    path: PathBuf,
    fd: OwnedFd,
    frames: FrameAssembler<MappedBuffer>,
}

impl fmt::Debug for UvcDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UvcDevice")
            .field("path", &self.path)
            .field("buffers", &self.frames.buffers.len())
            .field("slots", &self.frames.slots)
            .finish()
    }
}

impl UvcDevice {
    /// Opens the video device of a UVC gadget function.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC, Mode::empty())?;

        let cap = v4l2::querycap(fd.as_fd())?;
        log::debug!("opened UVC function node {} ({})", path.display(), cap.card());

        Ok(Self { path, fd, frames: FrameAssembler::new(Vec::new(), 0) })
    }

    /// Path of the video device.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sets the output format and returns the frame buffer size chosen by the driver.
    fn set_format(&self, format: &StreamFormat) -> Result<usize> {
        let size = format.format.max_frame_size(format.width, format.height, 0);
        let pix = V4l2PixFormat {
            width: format.width,
            height: format.height,
            pixelformat: format.format.fourcc(),
            field: v4l2::FIELD_NONE,
            sizeimage: size,
            ..Default::default()
        };
        let mut fmt = V4l2Format::pix(v4l2::BUF_TYPE_VIDEO_OUTPUT, pix);
        v4l2::s_fmt(self.fd.as_fd(), &mut fmt)?;

        match fmt.pix_format().sizeimage {
            0 => Ok(size as usize),
            sizeimage => Ok(sizeimage as usize),
        }
    }
}

impl AsFd for UvcDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl VideoNode for UvcDevice {
    fn subscribe(&mut self) -> Result<()> {
        for ty in event::ALL {
            v4l2::subscribe_event(self.fd.as_fd(), ty)?;
        }
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<NodeEvent>> {
        loop {
            let ev = match v4l2::dqevent(self.fd.as_fd()) {
                Ok(ev) => ev,
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => return Ok(None),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            };

            let data = ev.data();
            let ev = match ev.type_ {
                event::UVC_CONNECT => NodeEvent::Connect,
                event::UVC_DISCONNECT => NodeEvent::Disconnect,
                event::UVC_STREAMON => NodeEvent::StreamOn,
                event::UVC_STREAMOFF => NodeEvent::StreamOff,
                event::UVC_SETUP => NodeEvent::Setup(CtrlReq::parse(&data[..CtrlReq::SIZE])?),
                event::UVC_DATA => NodeEvent::Data(UvcRequestData::parse(data).payload().to_vec()),
                other => {
                    log::debug!("ignoring unknown event {other:#x}");
                    continue;
                }
            };
            return Ok(Some(ev));
        }
    }

    fn respond(&mut self, response: &Response) -> Result<()> {
        let mut resp = UvcRequestData::default();
        match response {
            Response::Data(data) => {
                let len = data.len().min(UvcRequestData::MAX_LEN);
                resp.data[..len].copy_from_slice(&data[..len]);
                resp.length = len as i32;
            }
            Response::Receive(len) => resp.length = (*len as usize).min(UvcRequestData::MAX_LEN) as i32,
            Response::Stall => resp.length = -libc::EL2HLT,
        }
        v4l2::send_response(self.fd.as_fd(), &mut resp)
    }

    fn alloc_buffers(&mut self, format: &StreamFormat, count: u32, _size: usize) -> Result<u32> {
        let frame_size = self.set_format(format)?;

        let n = v4l2::reqbufs(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_OUTPUT, KERNEL_BUFFERS)?;
        let mut buffers = Vec::with_capacity(n as usize);
        for index in 0..n {
            let buf = v4l2::querybuf(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_OUTPUT, index)?;
            buffers.push(MappedBuffer::map(self.fd.as_fd(), buf.offset(), buf.length as usize)?);
        }
        if buffers.is_empty() {
            return Ok(0);
        }

        log::debug!(
            "allocated {n} frame buffers of {frame_size} bytes and {count} payload slots on {}",
            self.path.display()
        );
        self.frames = FrameAssembler::new(buffers, count);
        Ok(count)
    }

    fn free_buffers(&mut self) -> Result<()> {
        self.frames = FrameAssembler::new(Vec::new(), 0);
        v4l2::reqbufs(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_OUTPUT, 0)?;
        Ok(())
    }

    fn queue(&mut self, slot: u32, payload: &[u8]) -> Result<()> {
        let Some((index, len)) = self.frames.push(slot, payload)? else { return Ok(()) };

        let mut buf = V4l2Buffer::new(v4l2::BUF_TYPE_VIDEO_OUTPUT, index);
        buf.bytesused = len as u32;
        log::trace!("queuing frame of {len} bytes in buffer {index}");
        v4l2::qbuf(self.fd.as_fd(), &mut buf)
    }

    fn dequeue(&mut self) -> Result<Option<Completion>> {
        loop {
            match v4l2::dqbuf(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_OUTPUT) {
                Ok(buf) => {
                    if buf.flags & v4l2::BUF_FLAG_ERROR != 0 {
                        log::warn!("frame in buffer {} was not transmitted", buf.index);
                    }
                    self.frames.release(buf.index);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(self.frames.done.pop_front())
    }

    fn stream_on(&mut self) -> Result<()> {
        v4l2::streamon(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_OUTPUT)
    }

    fn stream_off(&mut self) -> Result<()> {
        self.frames.reset();
        v4l2::streamoff(self.fd.as_fd(), v4l2::BUF_TYPE_VIDEO_OUTPUT)
    }
}

impl Drop for UvcDevice {
    fn drop(&mut self) {
        for ty in event::ALL {
            let _ = v4l2::unsubscribe_event(self.fd.as_fd(), ty);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn payload(info: HeaderInfo, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![2, info.bits()];
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn gathers_frame() {
        let mut frames = FrameAssembler::new(vec![vec![0; 8]; 2], 4);

        assert_eq!(frames.push(0, &payload(HeaderInfo::FID, b"abc")).unwrap(), None);
        assert_eq!(frames.done.pop_front(), Some(Completion { slot: 0, failed: false }));
        assert_eq!(frames.push(1, &payload(HeaderInfo::FID | HeaderInfo::EOF, b"de")).unwrap(), Some((0, 5)));
        assert_eq!(&frames.buffers[0][..5], b"abcde");

        // Timestamps are skipped along with the header.
        let mut timed = vec![12, (HeaderInfo::EOF | HeaderInfo::PTS | HeaderInfo::SCR).bits()];
        timed.extend_from_slice(&[9; 10]);
        timed.extend_from_slice(b"xy");
        assert_eq!(frames.push(2, &timed).unwrap(), Some((1, 2)));
        assert_eq!(&frames.buffers[1][..2], b"xy");
        assert_eq!(frames.done.len(), 2);
    }

    #[test]
    fn waits_for_free_buffer() {
        let mut frames = FrameAssembler::new(vec![vec![0; 4]], 2);
        assert_eq!(frames.push(0, &payload(HeaderInfo::EOF, b"a")).unwrap(), Some((0, 1)));

        let err = frames.push(1, &payload(HeaderInfo::EOF, b"b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert_eq!(frames.done.len(), 1);

        frames.release(0);
        frames.release(0);
        assert_eq!(frames.push(1, &payload(HeaderInfo::EOF, b"b")).unwrap(), Some((0, 1)));
        assert!(frames.free.is_empty());
    }

    #[test]
    fn empty_end_of_frame_payload() {
        let mut frames = FrameAssembler::new(vec![vec![0; 4]], 2);
        frames.push(0, &payload(HeaderInfo::empty(), b"ab")).unwrap();
        assert_eq!(frames.push(1, &payload(HeaderInfo::EOF, b"")).unwrap(), Some((0, 2)));
    }

    #[test]
    fn rejects_bad_payloads() {
        let mut frames = FrameAssembler::new(vec![vec![0; 4]], 2);
        assert_eq!(frames.push(2, &payload(HeaderInfo::EOF, b"a")).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(frames.push(0, &[1]).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(frames.push(0, &[12, 0, 1]).unwrap_err().kind(), ErrorKind::InvalidInput);

        let err = frames.push(0, &payload(HeaderInfo::empty(), b"abcde")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(frames.done.is_empty());
        assert_eq!(frames.free.len(), 1);
    }

    #[test]
    fn reset_returns_buffers() {
        let mut frames = FrameAssembler::new(vec![vec![0; 4]; 2], 2);
        frames.push(0, &payload(HeaderInfo::EOF, b"a")).unwrap();
        frames.push(1, &payload(HeaderInfo::empty(), b"b")).unwrap();
        frames.reset();

        assert_eq!(frames.free.len(), 2);
        assert!(frames.done.is_empty());
        assert_eq!(frames.push(0, &payload(HeaderInfo::EOF, b"c")).unwrap(), Some((0, 1)));
    }
}
