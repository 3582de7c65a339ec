//! Camera tuning controls and the hand-off of frames from a camera thread.

use rustix::event::{eventfd, EventfdFlags};
use std::{
    fmt,
    io::{Error as IoError, ErrorKind},
    ops::RangeInclusive,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::{Error, Result};

/// Valid lens positions in dioptres.
pub const LENS_POSITION_RANGE: RangeInclusive<f32> = 0.0..=32.0;
/// Valid red and blue white balance gains.
pub const COLOUR_GAIN_RANGE: RangeInclusive<f32> = 0.0..=32.0;
/// Valid brightness adjustments.
pub const BRIGHTNESS_RANGE: RangeInclusive<f32> = -1.0..=1.0;
/// Valid contrast adjustments.
pub const CONTRAST_RANGE: RangeInclusive<f32> = 0.0..=32.0;
/// Valid saturation adjustments.
pub const SATURATION_RANGE: RangeInclusive<f32> = 0.0..=32.0;
/// Valid sharpness adjustments.
pub const SHARPNESS_RANGE: RangeInclusive<f32> = 0.0..=16.0;

fn invalid(msg: String) -> Error {
    Error::Io(IoError::new(ErrorKind::InvalidInput, msg))
}

/// Checks that a control value lies within its range.
pub fn check_range(name: &str, value: f32, range: &RangeInclusive<f32>) -> Result<f32> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid(format!("{name} {value} out of range [{:.1} .. {:.1}]", range.start(), range.end())))
    }
}

/// Distances scanned by the autofocus algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum AfRange {
    Normal,
    Macro,
}

/// Lens speed of the autofocus algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum AfSpeed {
    Normal,
    Fast,
}

/// Illuminant assumed by the auto white balance algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum AwbMode {
    Auto,
    Incandescent,
    Tungsten,
    Fluorescent,
    Indoor,
    Daylight,
    Cloudy,
}

/// Exposure mode of the automatic exposure and gain algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum ExposureMode {
    Normal,
    /// Short exposures, also accepted as `sport`.
    #[strum(to_string = "short", serialize = "sport")]
    Short,
    Long,
}

/// Manual red and blue white balance gains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColourGains {
    pub red: f32,
    pub blue: f32,
}

impl ColourGains {
    /// Checks both gains against [`COLOUR_GAIN_RANGE`].
    pub fn validate(&self) -> Result<()> {
        check_range("red gain", self.red, &COLOUR_GAIN_RANGE)?;
        check_range("blue gain", self.blue, &COLOUR_GAIN_RANGE)?;
        Ok(())
    }
}

impl FromStr for ColourGains {
    type Err = Error;

    /// Parses `R,B`.
    fn from_str(s: &str) -> Result<Self> {
        let parse = |v: &str| v.trim().parse::<f32>().ok();
        let gains = match s.split_once(',') {
            Some((red, blue)) => parse(red).zip(parse(blue)).map(|(red, blue)| Self { red, blue }),
            None => None,
        };
        let gains = gains.ok_or_else(|| invalid(format!("colour gains {s} are not of the form R,B")))?;
        gains.validate()?;
        Ok(gains)
    }
}

impl fmt::Display for ColourGains {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{}", self.red, self.blue)
    }
}

/// Image tuning applied to a camera when streaming starts.
///
/// Unset controls keep the defaults of the camera's algorithms.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CameraControls {
    /// Autofocus scan range.
    pub af_range: Option<AfRange>,
    /// Autofocus lens speed.
    pub af_speed: Option<AfSpeed>,
    /// Fixed lens position as reciprocal focus distance; disables autofocus.
    ///
    /// 0 focuses at infinity, 2 at 50 cm.
    pub lens_position: Option<f32>,
    /// Auto white balance mode.
    pub awb: Option<AwbMode>,
    /// Manual white balance gains; disable auto white balance.
    pub colour_gains: Option<ColourGains>,
    /// Exposure mode.
    pub exposure: Option<ExposureMode>,
    /// Brightness, 0 is unchanged.
    pub brightness: Option<f32>,
    /// Contrast, 1 is unchanged.
    pub contrast: Option<f32>,
    /// Saturation, 1 is unchanged.
    pub saturation: Option<f32>,
    /// Sharpness, 1 is the camera's default.
    pub sharpness: Option<f32>,
    /// Log lens position and colour gains once per second.
    pub debug_report: bool,
}

impl CameraControls {
    /// Checks every set value against its range.
    pub fn validate(&self) -> Result<()> {
        let ranged = [
            ("lens position", self.lens_position, &LENS_POSITION_RANGE),
            ("brightness", self.brightness, &BRIGHTNESS_RANGE),
            ("contrast", self.contrast, &CONTRAST_RANGE),
            ("saturation", self.saturation, &SATURATION_RANGE),
            ("sharpness", self.sharpness, &SHARPNESS_RANGE),
        ];
        for (name, value, range) in ranged {
            if let Some(value) = value {
                check_range(name, value, range)?;
            }
        }
        if let Some(gains) = &self.colour_gains {
            gains.validate()?;
        }
        Ok(())
    }

    /// Whether any control deviates from the camera defaults.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A frame captured by a camera thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CapturedFrame {
    pub data: Vec<u8>,
    pub timestamp: Duration,
    pub error: bool,
}

/// Newest frame of a camera thread, waiting to be picked up by the event loop.
///
/// Posting a frame signals the event file descriptor. A frame not picked up
/// before the next one is posted is replaced.
#[cfg_attr(not(feature = "libcamera"), allow(dead_code))]
pub(crate) struct FrameMailbox {
    wake: OwnedFd,
    frame: Mutex<Option<CapturedFrame>>,
    failure: Mutex<Option<String>>,
    replaced: AtomicU64,
}

#[cfg_attr(not(feature = "libcamera"), allow(dead_code))]
impl FrameMailbox {
    pub fn new() -> Result<Self> {
        let wake = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self { wake, frame: Mutex::new(None), failure: Mutex::new(None), replaced: AtomicU64::new(0) })
    }

    fn signal(&self) {
        if let Err(err) = rustix::io::write(&self.wake, &1u64.to_ne_bytes()) {
            log::warn!("cannot signal captured frame: {err}");
        }
    }

    /// Hands over a frame; called by the camera thread.
    pub fn post(&self, frame: CapturedFrame) {
        let old = self.frame.lock().unwrap_or_else(|err| err.into_inner()).replace(frame);
        if old.is_some() {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.signal();
    }

    /// Reports that the camera thread has failed.
    pub fn fail(&self, msg: String) {
        *self.failure.lock().unwrap_or_else(|err| err.into_inner()) = Some(msg);
        self.signal();
    }

    /// Takes the pending frame; called by the event loop.
    ///
    /// Fails once if the camera thread has failed.
    pub fn take(&self) -> Result<Option<CapturedFrame>> {
        let mut buf = [0; 8];
        match rustix::io::read(&self.wake, &mut buf) {
            Ok(_) | Err(rustix::io::Errno::AGAIN) => (),
            Err(err) => return Err(err.into()),
        }

        if let Some(msg) = self.failure.lock().unwrap_or_else(|err| err.into_inner()).take() {
            return Err(Error::SourceError(msg));
        }
        Ok(self.frame.lock().unwrap_or_else(|err| err.into_inner()).take())
    }

    /// Number of frames replaced before they were picked up.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

impl AsFd for FrameMailbox {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }
}

/// Copies `rows` rows of `row_len` bytes, `stride` bytes apart, into a packed frame.
///
/// Returns the number of bytes written, limited by the size of `dst`.
#[cfg_attr(not(feature = "libcamera"), allow(dead_code))]
pub(crate) fn copy_rows(src: &[u8], stride: usize, row_len: usize, rows: usize, dst: &mut [u8]) -> usize {
    if stride == row_len || stride == 0 {
        let len = src.len().min(row_len * rows).min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        return len;
    }

    let mut written = 0;
    for row in src.chunks(stride).take(rows) {
        let row = &row[..row.len().min(row_len)];
        let Some(out) = dst.get_mut(written..written + row.len()) else { break };
        out.copy_from_slice(row);
        written += row.len();
    }
    written
}
