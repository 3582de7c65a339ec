//! Video4Linux2 and UVC gadget kernel interface.

use libc::{c_int, c_ulong, c_void, timespec, timeval};
use std::{
    io::{Error, Result},
    mem::{self, size_of},
    os::fd::{AsRawFd, BorrowedFd},
    ptr::NonNull,
    slice,
};

/// Direction bits of an ioctl request.
mod dir {
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
}

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

/// Request codes.
pub mod request {
    use super::*;

    pub const QUERYCAP: u32 = ioc(dir::READ, b'V', 0, size_of::<V4l2Capability>());
    pub const S_FMT: u32 = ioc(dir::READ | dir::WRITE, b'V', 5, size_of::<V4l2Format>());
    pub const REQBUFS: u32 = ioc(dir::READ | dir::WRITE, b'V', 8, size_of::<V4l2RequestBuffers>());
    pub const QUERYBUF: u32 = ioc(dir::READ | dir::WRITE, b'V', 9, size_of::<V4l2Buffer>());
    pub const QBUF: u32 = ioc(dir::READ | dir::WRITE, b'V', 15, size_of::<V4l2Buffer>());
    pub const DQBUF: u32 = ioc(dir::READ | dir::WRITE, b'V', 17, size_of::<V4l2Buffer>());
    pub const STREAMON: u32 = ioc(dir::WRITE, b'V', 18, size_of::<c_int>());
    pub const STREAMOFF: u32 = ioc(dir::WRITE, b'V', 19, size_of::<c_int>());
    pub const S_PARM: u32 = ioc(dir::READ | dir::WRITE, b'V', 22, size_of::<V4l2Streamparm>());
    pub const TRY_FMT: u32 = ioc(dir::READ | dir::WRITE, b'V', 64, size_of::<V4l2Format>());
    pub const DQEVENT: u32 = ioc(dir::READ, b'V', 89, size_of::<V4l2Event>());
    pub const SUBSCRIBE_EVENT: u32 = ioc(dir::WRITE, b'V', 90, size_of::<V4l2EventSubscription>());
    pub const UNSUBSCRIBE_EVENT: u32 = ioc(dir::WRITE, b'V', 91, size_of::<V4l2EventSubscription>());
    pub const UVC_SEND_RESPONSE: u32 = ioc(dir::WRITE, b'U', 1, size_of::<UvcRequestData>());
}

pub const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const MEMORY_MMAP: u32 = 1;
pub const FIELD_NONE: u32 = 1;
pub const BUF_FLAG_ERROR: u32 = 0x0040;

pub const CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const CAP_STREAMING: u32 = 0x0400_0000;
pub const CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

pub const PIX_FMT_YUYV: u32 = fourcc(b"YUYV");
pub const PIX_FMT_MJPEG: u32 = fourcc(b"MJPG");

/// UVC gadget events.
pub mod event {
    const PRIVATE_START: u32 = 0x0800_0000;
    pub const UVC_CONNECT: u32 = PRIVATE_START;
    pub const UVC_DISCONNECT: u32 = PRIVATE_START + 1;
    pub const UVC_STREAMON: u32 = PRIVATE_START + 2;
    pub const UVC_STREAMOFF: u32 = PRIVATE_START + 3;
    pub const UVC_SETUP: u32 = PRIVATE_START + 4;
    pub const UVC_DATA: u32 = PRIVATE_START + 5;

    pub const ALL: [u32; 6] = [UVC_CONNECT, UVC_DISCONNECT, UVC_STREAMON, UVC_STREAMOFF, UVC_SETUP, UVC_DATA];
}

macro_rules! zeroed_default {
    ($($ty:ty),*) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    // SAFETY: plain kernel ABI struct for which all-zero is a valid value.
                    unsafe { mem::zeroed() }
                }
            }
        )*
    };
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl V4l2Capability {
    /// Capabilities of the opened device node.
    pub fn node_caps(&self) -> u32 {
        if self.capabilities & CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }

    pub fn card(&self) -> String {
        let len = self.card.iter().position(|&c| c == 0).unwrap_or(self.card.len());
        String::from_utf8_lossy(&self.card[..len]).into_owned()
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatFmt {
    pub pix: V4l2PixFormat,
    pub raw_data: [u8; 200],
    _align: [c_ulong; 200 / size_of::<c_ulong>()],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatFmt,
}

impl V4l2Format {
    pub fn pix(type_: u32, pix: V4l2PixFormat) -> Self {
        let mut format = Self::default();
        format.type_ = type_;
        format.fmt.pix = pix;
        format
    }

    pub fn pix_format(&self) -> V4l2PixFormat {
        // SAFETY: every format type used by this crate is a single-planar pixel format.
        unsafe { self.fmt.pix }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl V4l2Buffer {
    pub fn new(type_: u32, index: u32) -> Self {
        Self { type_, index, memory: MEMORY_MMAP, field: FIELD_NONE, ..Default::default() }
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: MMAP buffers use the offset member.
        unsafe { self.m.offset }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: V4l2Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2StreamparmParm {
    pub capture: V4l2CaptureParm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Streamparm {
    pub type_: u32,
    pub parm: V4l2StreamparmParm,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2EventData {
    pub data: [u8; 64],
    _align: [u64; 8],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Event {
    pub type_: u32,
    pub u: V4l2EventData,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl V4l2Event {
    pub fn data(&self) -> &[u8; 64] {
        // SAFETY: every member of the union is plain bytes.
        unsafe { &self.u.data }
    }
}

/// Response to a control request sent through the UVC gadget.
///
/// A negative length stalls the control endpoint.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UvcRequestData {
    pub length: i32,
    pub data: [u8; 60],
}

impl UvcRequestData {
    pub const MAX_LEN: usize = 60;

    pub fn parse(raw: &[u8; 64]) -> Self {
        let mut data = [0; Self::MAX_LEN];
        data.copy_from_slice(&raw[4..]);
        Self { length: i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]), data }
    }

    pub fn payload(&self) -> &[u8] {
        let len = usize::try_from(self.length).unwrap_or(0).min(Self::MAX_LEN);
        &self.data[..len]
    }
}

zeroed_default!(
    V4l2Capability,
    V4l2PixFormat,
    V4l2Format,
    V4l2RequestBuffers,
    V4l2Buffer,
    V4l2CaptureParm,
    V4l2Streamparm,
    V4l2EventSubscription,
    V4l2Event,
    UvcRequestData
);

/// Performs an ioctl whose argument type matches `request`.
///
/// # Safety
/// `request` must expect a pointer to `T`.
unsafe fn ioctl<T>(fd: BorrowedFd, request: u32, arg: &mut T) -> Result<c_int> {
    match libc::ioctl(fd.as_raw_fd(), request as _, arg as *mut T as *mut c_void) {
        -1 => Err(Error::last_os_error()),
        n => Ok(n),
    }
}

/// query device capabilities
pub fn querycap(fd: BorrowedFd) -> Result<V4l2Capability> {
    let mut cap = V4l2Capability::default();
    unsafe { ioctl(fd, request::QUERYCAP, &mut cap) }?;
    Ok(cap)
}

/// set the data format
pub fn s_fmt(fd: BorrowedFd, format: &mut V4l2Format) -> Result<()> {
    unsafe { ioctl(fd, request::S_FMT, format) }?;
    Ok(())
}

/// try a data format
pub fn try_fmt(fd: BorrowedFd, format: &mut V4l2Format) -> Result<()> {
    unsafe { ioctl(fd, request::TRY_FMT, format) }?;
    Ok(())
}

/// set streaming parameters
pub fn s_parm(fd: BorrowedFd, parm: &mut V4l2Streamparm) -> Result<()> {
    unsafe { ioctl(fd, request::S_PARM, parm) }?;
    Ok(())
}

/// initiate memory mapping buffers, returns the number of buffers allocated
pub fn reqbufs(fd: BorrowedFd, type_: u32, count: u32) -> Result<u32> {
    let mut req = V4l2RequestBuffers { count, type_, memory: MEMORY_MMAP, ..Default::default() };
    unsafe { ioctl(fd, request::REQBUFS, &mut req) }?;
    Ok(req.count)
}

/// query the status of a buffer
pub fn querybuf(fd: BorrowedFd, type_: u32, index: u32) -> Result<V4l2Buffer> {
    let mut buf = V4l2Buffer::new(type_, index);
    unsafe { ioctl(fd, request::QUERYBUF, &mut buf) }?;
    Ok(buf)
}

/// enqueue a buffer
pub fn qbuf(fd: BorrowedFd, buf: &mut V4l2Buffer) -> Result<()> {
    unsafe { ioctl(fd, request::QBUF, buf) }?;
    Ok(())
}

/// dequeue a buffer
pub fn dqbuf(fd: BorrowedFd, type_: u32) -> Result<V4l2Buffer> {
    let mut buf = V4l2Buffer::new(type_, 0);
    unsafe { ioctl(fd, request::DQBUF, &mut buf) }?;
    Ok(buf)
}

/// start streaming I/O
pub fn streamon(fd: BorrowedFd, type_: u32) -> Result<()> {
    let mut ty = type_ as c_int;
    unsafe { ioctl(fd, request::STREAMON, &mut ty) }?;
    Ok(())
}

/// stop streaming I/O
pub fn streamoff(fd: BorrowedFd, type_: u32) -> Result<()> {
    let mut ty = type_ as c_int;
    unsafe { ioctl(fd, request::STREAMOFF, &mut ty) }?;
    Ok(())
}

/// subscribe to an event
pub fn subscribe_event(fd: BorrowedFd, type_: u32) -> Result<()> {
    let mut sub = V4l2EventSubscription { type_, ..Default::default() };
    unsafe { ioctl(fd, request::SUBSCRIBE_EVENT, &mut sub) }?;
    Ok(())
}

/// unsubscribe from an event
pub fn unsubscribe_event(fd: BorrowedFd, type_: u32) -> Result<()> {
    let mut sub = V4l2EventSubscription { type_, ..Default::default() };
    unsafe { ioctl(fd, request::UNSUBSCRIBE_EVENT, &mut sub) }?;
    Ok(())
}

/// dequeue an event
pub fn dqevent(fd: BorrowedFd) -> Result<V4l2Event> {
    let mut event = V4l2Event::default();
    unsafe { ioctl(fd, request::DQEVENT, &mut event) }?;
    Ok(event)
}

/// send the response to a control request
pub fn send_response(fd: BorrowedFd, response: &mut UvcRequestData) -> Result<()> {
    unsafe { ioctl(fd, request::UVC_SEND_RESPONSE, response) }?;
    Ok(())
}

/// Buffer memory mapped from a V4L2 device.
#[derive(Debug)]
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedBuffer {
    /// Maps the buffer at `offset` as returned by [`querybuf`].
    pub fn map(fd: BorrowedFd, offset: u32, len: usize) -> Result<Self> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::SHARED,
                fd,
                offset as u64,
            )
        }?;
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::other("mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for MappedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if let Err(err) = unsafe { rustix::mm::munmap(self.ptr.as_ptr() as *mut c_void, self.len) } {
            log::warn!("munmap failed: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn abi_layout() {
        assert_eq!(size_of::<V4l2Capability>(), 104);
        assert_eq!(size_of::<V4l2PixFormat>(), 48);
        assert_eq!(size_of::<V4l2Format>(), 208);
        assert_eq!(size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(size_of::<V4l2Buffer>(), 88);
        assert_eq!(size_of::<V4l2Streamparm>(), 204);
        assert_eq!(size_of::<V4l2EventSubscription>(), 32);
        assert_eq!(size_of::<V4l2Event>(), 136);
        assert_eq!(size_of::<UvcRequestData>(), 64);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn request_codes() {
        assert_eq!(request::QUERYCAP, 0x8068_5600);
        assert_eq!(request::S_FMT, 0xc0d0_5605);
        assert_eq!(request::REQBUFS, 0xc014_5608);
        assert_eq!(request::QBUF, 0xc058_560f);
        assert_eq!(request::STREAMON, 0x4004_5612);
        assert_eq!(request::DQEVENT, 0x8088_5659);
        assert_eq!(request::SUBSCRIBE_EVENT, 0x4020_565a);
        assert_eq!(request::UVC_SEND_RESPONSE, 0x4040_5501);
    }

    #[test]
    fn fourcc_codes() {
        assert_eq!(PIX_FMT_YUYV, 0x5659_5559);
        assert_eq!(PIX_FMT_MJPEG, 0x4750_4a4d);
    }

    #[test]
    fn request_data() {
        let mut raw = [0; 64];
        raw[..4].copy_from_slice(&3i32.to_ne_bytes());
        raw[4..7].copy_from_slice(&[1, 2, 3]);
        let data = UvcRequestData::parse(&raw);
        assert_eq!(data.payload(), &[1, 2, 3]);

        raw[..4].copy_from_slice(&(-1i32).to_ne_bytes());
        assert!(UvcRequestData::parse(&raw).payload().is_empty());
    }
}
