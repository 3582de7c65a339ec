//! UVC wire types.
//!
//! Control requests, control selectors, the video probe and commit control block
//! and the payload header as defined by the USB Video Class 1.1 specification.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Cursor, ErrorKind, Result, Write};

/// Class-specific request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum RequestKind {
    /// Set current value.
    #[strum(serialize = "SET_CUR")]
    SetCur = 0x01,
    /// Get current value.
    #[strum(serialize = "GET_CUR")]
    GetCur = 0x81,
    /// Get minimum value.
    #[strum(serialize = "GET_MIN")]
    GetMin = 0x82,
    /// Get maximum value.
    #[strum(serialize = "GET_MAX")]
    GetMax = 0x83,
    /// Get resolution.
    #[strum(serialize = "GET_RES")]
    GetRes = 0x84,
    /// Get data length.
    #[strum(serialize = "GET_LEN")]
    GetLen = 0x85,
    /// Get capabilities.
    #[strum(serialize = "GET_INFO")]
    GetInfo = 0x86,
    /// Get default value.
    #[strum(serialize = "GET_DEF")]
    GetDef = 0x87,
}

/// Video streaming interface control selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum VsSelector {
    /// Streaming parameter negotiation.
    Probe = 0x01,
    /// Streaming parameter commit.
    Commit = 0x02,
    /// Still image parameter negotiation.
    StillProbe = 0x03,
    /// Still image parameter commit.
    StillCommit = 0x04,
    /// Still image trigger.
    StillImageTrigger = 0x05,
    /// Last stream error.
    StreamErrorCode = 0x06,
    /// Key frame generation.
    GenerateKeyFrame = 0x07,
    /// Frame segment update.
    UpdateFrameSegment = 0x08,
    /// Synchronization delay.
    SyncDelay = 0x09,
}

/// Video control interface control selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum VcSelector {
    /// Device power mode.
    VideoPowerMode = 0x01,
    /// Error code of the last failed request.
    RequestErrorCode = 0x02,
}

/// Values of `bRequestErrorCode`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum RequestErrorCode {
    /// No error.
    #[default]
    NoError = 0x00,
    /// Not ready.
    NotReady = 0x01,
    /// Wrong state.
    WrongState = 0x02,
    /// Power.
    Power = 0x03,
    /// Out of range.
    OutOfRange = 0x04,
    /// Invalid unit.
    InvalidUnit = 0x05,
    /// Invalid control.
    InvalidControl = 0x06,
    /// Invalid request.
    InvalidRequest = 0x07,
    /// Invalid value within range.
    InvalidValue = 0x08,
    /// Unknown.
    Unknown = 0xff,
}

/// Values of `bStreamErrorCode`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum StreamErrorCode {
    /// No error.
    #[default]
    NoError = 0x00,
    /// Protected content.
    ProtectedContent = 0x01,
    /// Input buffer underrun.
    InputBufferUnderrun = 0x02,
    /// Data discontinuity.
    DataDiscontinuity = 0x03,
    /// Output buffer underrun.
    OutputBufferUnderrun = 0x04,
    /// Output buffer overrun.
    OutputBufferOverrun = 0x05,
    /// Format change.
    FormatChange = 0x06,
    /// Still image capture error.
    StillImageCaptureError = 0x07,
    /// Unknown.
    Unknown = 0x08,
}

/// GET_INFO capability bit: supports GET requests.
pub const INFO_SUPPORTS_GET: u8 = 0x01;
/// GET_INFO capability bit: supports SET requests.
pub const INFO_SUPPORTS_SET: u8 = 0x02;

/// USB setup packet of a class-specific request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtrlReq {
    /// Request type.
    pub request_type: u8,
    /// Request.
    pub request: u8,
    /// Value; the control selector in the high byte.
    pub value: u16,
    /// Index; the entity in the high byte, the interface in the low byte.
    pub index: u16,
    /// Data stage length.
    pub length: u16,
}

impl CtrlReq {
    /// Size of a setup packet.
    pub const SIZE: usize = 8;

    /// Parses a setup packet.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        Ok(Self {
            request_type: data.read_u8()?,
            request: data.read_u8()?,
            value: data.read_u16::<LE>()?,
            index: data.read_u16::<LE>()?,
            length: data.read_u16::<LE>()?,
        })
    }

    /// Serializes the setup packet.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0; Self::SIZE];
        let mut w = &mut data[..];
        // Writing into a slice of exactly the right size cannot fail.
        let _ = w.write_u8(self.request_type);
        let _ = w.write_u8(self.request);
        let _ = w.write_u16::<LE>(self.value);
        let _ = w.write_u16::<LE>(self.index);
        let _ = w.write_u16::<LE>(self.length);
        data
    }

    /// Control selector.
    pub fn selector(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Addressed entity; zero for the interface itself.
    pub fn entity(&self) -> u8 {
        (self.index >> 8) as u8
    }

    /// Addressed interface number.
    pub fn interface(&self) -> u8 {
        (self.index & 0xff) as u8
    }
}

/// Addressee of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Video control interface control.
    Vc(VcSelector),
    /// Video streaming interface control.
    Vs(VsSelector),
    /// Anything this device does not implement.
    Unsupported {
        /// Interface number.
        interface: u8,
        /// Entity id.
        entity: u8,
        /// Control selector.
        selector: u8,
    },
}

/// A class-specific control request decoded from a setup packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Addressed control.
    pub target: Target,
    /// Request kind; `None` if the request code is unknown.
    pub kind: Option<RequestKind>,
    /// Data stage length.
    pub length: u16,
    /// Data stage payload of a SET request.
    pub data: Vec<u8>,
}

impl ControlRequest {
    /// Decodes a setup packet addressed to a UVC function with the given
    /// control and streaming interface numbers.
    pub fn decode(req: &CtrlReq, control_interface: u8, streaming_interface: u8) -> Self {
        let (interface, entity, selector) = (req.interface(), req.entity(), req.selector());
        let target = match entity {
            0 if interface == control_interface => VcSelector::from_repr(selector).map(Target::Vc),
            0 if interface == streaming_interface => VsSelector::from_repr(selector).map(Target::Vs),
            _ => None,
        }
        .unwrap_or(Target::Unsupported { interface, entity, selector });

        Self { target, kind: RequestKind::from_repr(req.request), length: req.length, data: Vec::new() }
    }

    /// Attaches the data stage payload.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Video probe and commit controls (`UVC_VS_PROBE_CONTROL`, `UVC_VS_COMMIT_CONTROL`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingControl {
    /// Fields the device should keep fixed.
    pub hint: u16,
    /// Format index.
    pub format_index: u8,
    /// Frame index.
    pub frame_index: u8,
    /// Frame interval in 100 ns units.
    pub frame_interval: u32,
    /// Key frame rate.
    pub key_frame_rate: u16,
    /// P frame rate.
    pub p_frame_rate: u16,
    /// Compression quality.
    pub comp_quality: u16,
    /// Compression window size.
    pub comp_window_size: u16,
    /// Internal video streaming interface latency in ms.
    pub delay: u16,
    /// Maximum video frame or codec-specific segment size in bytes.
    pub max_video_frame_size: u32,
    /// Maximum number of bytes the device can transmit or receive in a single payload transfer.
    pub max_payload_transfer_size: u32,
    /// Device clock frequency in Hz.
    pub clock_frequency: u32,
    /// Framing information.
    pub framing_info: u8,
    /// Preferred payload format version.
    pub preferred_version: u8,
    /// Minimum payload format version.
    pub min_version: u8,
    /// Maximum payload format version.
    pub max_version: u8,
}

impl StreamingControl {
    /// Size of the control block in UVC 1.1.
    pub const SIZE: usize = 34;
    /// Size of the control block in UVC 1.0.
    pub const SIZE_1_0: usize = 26;

    /// `bmFramingInfo`: frame ID field is required.
    pub const FRAMING_FID: u8 = 0x01;
    /// `bmFramingInfo`: end of frame field may be present.
    pub const FRAMING_EOF: u8 = 0x02;
    /// `bmHint`: keep the frame interval fixed.
    pub const HINT_FRAME_INTERVAL: u16 = 0x0001;

    /// Parses the control block.
    ///
    /// A UVC 1.0 host sends only the first 26 bytes; the missing fields are zero.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE_1_0 {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "streaming control too short"));
        }

        let mut buf = [0; Self::SIZE];
        let len = data.len().min(Self::SIZE);
        buf[..len].copy_from_slice(&data[..len]);

        let mut r = Cursor::new(&buf[..]);
        Ok(Self {
            hint: r.read_u16::<LE>()?,
            format_index: r.read_u8()?,
            frame_index: r.read_u8()?,
            frame_interval: r.read_u32::<LE>()?,
            key_frame_rate: r.read_u16::<LE>()?,
            p_frame_rate: r.read_u16::<LE>()?,
            comp_quality: r.read_u16::<LE>()?,
            comp_window_size: r.read_u16::<LE>()?,
            delay: r.read_u16::<LE>()?,
            max_video_frame_size: r.read_u32::<LE>()?,
            max_payload_transfer_size: r.read_u32::<LE>()?,
            clock_frequency: r.read_u32::<LE>()?,
            framing_info: r.read_u8()?,
            preferred_version: r.read_u8()?,
            min_version: r.read_u8()?,
            max_version: r.read_u8()?,
        })
    }

    /// Writes the control block.
    pub fn write(&self, mut w: impl Write) -> Result<()> {
        w.write_u16::<LE>(self.hint)?;
        w.write_u8(self.format_index)?;
        w.write_u8(self.frame_index)?;
        w.write_u32::<LE>(self.frame_interval)?;
        w.write_u16::<LE>(self.key_frame_rate)?;
        w.write_u16::<LE>(self.p_frame_rate)?;
        w.write_u16::<LE>(self.comp_quality)?;
        w.write_u16::<LE>(self.comp_window_size)?;
        w.write_u16::<LE>(self.delay)?;
        w.write_u32::<LE>(self.max_video_frame_size)?;
        w.write_u32::<LE>(self.max_payload_transfer_size)?;
        w.write_u32::<LE>(self.clock_frequency)?;
        w.write_u8(self.framing_info)?;
        w.write_u8(self.preferred_version)?;
        w.write_u8(self.min_version)?;
        w.write_u8(self.max_version)?;
        Ok(())
    }

    /// Serializes the control block.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(Self::SIZE);
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut data);
        data
    }
}

bitflags::bitflags! {
    /// `bmHeaderInfo` of a payload header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderInfo: u8 {
        /// Frame identifier; toggles at each frame boundary.
        const FID = 0x01;
        /// End of frame.
        const EOF = 0x02;
        /// Presentation time stamp present.
        const PTS = 0x04;
        /// Source clock reference present.
        const SCR = 0x08;
        /// Still image.
        const STI = 0x20;
        /// Error.
        const ERR = 0x40;
        /// End of header.
        const EOH = 0x80;
    }
}

/// UVC payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Header flags.
    pub info: HeaderInfo,
    /// Presentation time stamp in device clock units.
    pub pts: Option<u32>,
    /// Source clock reference: time in device clock units and the 11-bit USB frame counter.
    pub scr: Option<(u32, u16)>,
}

impl PayloadHeader {
    /// Minimum header length.
    pub const MIN_LEN: usize = 2;
    /// Maximum header length.
    pub const MAX_LEN: usize = 12;

    /// Header length in bytes.
    pub fn len(&self) -> usize {
        Self::MIN_LEN + self.pts.map_or(0, |_| 4) + self.scr.map_or(0, |_| 6)
    }

    /// Returns the flags with the PTS/SCR presence bits matching the optional fields.
    fn header_info(&self) -> HeaderInfo {
        let mut info = self.info | HeaderInfo::EOH;
        info.set(HeaderInfo::PTS, self.pts.is_some());
        info.set(HeaderInfo::SCR, self.scr.is_some());
        info
    }

    /// Writes the header.
    pub fn write(&self, mut w: impl Write) -> Result<()> {
        w.write_u8(self.len() as u8)?;
        w.write_u8(self.header_info().bits())?;
        if let Some(pts) = self.pts {
            w.write_u32::<LE>(pts)?;
        }
        if let Some((stc, sof)) = self.scr {
            w.write_u32::<LE>(stc)?;
            w.write_u16::<LE>(sof & 0x7ff)?;
        }
        Ok(())
    }

    /// Parses a header from the start of a payload.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let len = data.read_u8()? as usize;
        let info = HeaderInfo::from_bits_retain(data.read_u8()?);
        let pts = if info.contains(HeaderInfo::PTS) { Some(data.read_u32::<LE>()?) } else { None };
        let scr = if info.contains(HeaderInfo::SCR) {
            Some((data.read_u32::<LE>()?, data.read_u16::<LE>()?))
        } else {
            None
        };

        let hdr = Self { info, pts, scr };
        if hdr.len() != len {
            return Err(std::io::Error::new(ErrorKind::InvalidData, "payload header length mismatch"));
        }

        Ok(hdr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ctrl_req_decode() {
        let req = CtrlReq { request_type: 0x21, request: 0x01, value: 0x0100, index: 0x0001, length: 34 };
        let parsed = CtrlReq::parse(&req.to_bytes()).unwrap();
        assert_eq!(parsed, req);

        let ctrl = ControlRequest::decode(&req, 0, 1);
        assert_eq!(ctrl.target, Target::Vs(VsSelector::Probe));
        assert_eq!(ctrl.kind, Some(RequestKind::SetCur));
        assert_eq!(ctrl.length, 34);
    }

    #[test]
    fn ctrl_req_unit_control_is_unsupported() {
        // Processing unit 2 brightness on the control interface.
        let req = CtrlReq { request_type: 0xa1, request: 0x81, value: 0x0200, index: 0x0200, length: 2 };
        let ctrl = ControlRequest::decode(&req, 0, 1);
        assert_eq!(ctrl.target, Target::Unsupported { interface: 0, entity: 2, selector: 2 });
    }

    #[test]
    fn streaming_control_layout() {
        let ctrl = StreamingControl {
            hint: 1,
            format_index: 2,
            frame_index: 3,
            frame_interval: 333333,
            max_video_frame_size: 614400,
            max_payload_transfer_size: 3072,
            clock_frequency: 48_000_000,
            framing_info: 3,
            preferred_version: 1,
            max_version: 1,
            ..Default::default()
        };

        let data = ctrl.to_vec();
        assert_eq!(data.len(), StreamingControl::SIZE);
        assert_eq!(&data[..8], &[1, 0, 2, 3, 0x15, 0x16, 0x05, 0x00]);
        assert_eq!(&data[18..22], &614400u32.to_le_bytes());
        assert_eq!(&data[22..26], &3072u32.to_le_bytes());
        assert_eq!(&data[30..], &[3, 1, 0, 1]);
        assert_eq!(StreamingControl::parse(&data).unwrap(), ctrl);
    }

    #[test]
    fn streaming_control_uvc_1_0() {
        let ctrl = StreamingControl { format_index: 1, frame_index: 1, clock_frequency: 1, ..Default::default() };
        let data = ctrl.to_vec();

        let short = StreamingControl::parse(&data[..StreamingControl::SIZE_1_0]).unwrap();
        assert_eq!(short.format_index, 1);
        assert_eq!(short.clock_frequency, 0);

        assert!(StreamingControl::parse(&data[..10]).is_err());
    }

    #[test]
    fn payload_header() {
        let hdr = PayloadHeader { info: HeaderInfo::FID | HeaderInfo::EOF, pts: None, scr: None };
        let mut data = Vec::new();
        hdr.write(&mut data).unwrap();
        assert_eq!(data, [2, 0x83]);

        let hdr = PayloadHeader { info: HeaderInfo::empty(), pts: Some(0x01020304), scr: Some((7, 0x0fff)) };
        let mut data = Vec::new();
        hdr.write(&mut data).unwrap();
        assert_eq!(data.len(), 12);
        assert_eq!(data[0], 12);
        assert_eq!(data[1], 0x8c);
        assert_eq!(&data[10..], &0x07ffu16.to_le_bytes());

        let parsed = PayloadHeader::parse(&data).unwrap();
        assert_eq!(parsed.pts, Some(0x01020304));
        assert_eq!(parsed.scr, Some((7, 0x07ff)));
    }
}
