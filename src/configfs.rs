//! UVC function description read from configfs.
//!
//! The function must have been created and bound to a UDC beforehand, for
//! example with the `usb-gadget` crate or a shell script. Functions of the
//! legacy `g_webcam` gadget driver are supported with its fixed descriptors.

use std::{
    ffi::{OsStr, OsString},
    fmt, fs,
    io::{Error as IoError, ErrorKind},
    os::unix::prelude::OsStringExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{configfs_dir, trim_os_str, udc::UDC_CLASS_DIR, v4l2, Error, Result, Udc};

/// USB Video Class (UVC) frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum UvcFormat {
    /// YUYV 4:2:2 packed format.
    Yuyv,
    /// MJPEG compressed format.
    Mjpeg,
}

impl UvcFormat {
    fn all() -> &'static [UvcFormat] {
        &[UvcFormat::Yuyv, UvcFormat::Mjpeg]
    }

    fn group_dir_name(&self) -> &'static OsStr {
        match self {
            UvcFormat::Yuyv => OsStr::new("uncompressed"),
            UvcFormat::Mjpeg => OsStr::new("mjpeg"),
        }
    }

    /// V4L2 pixel format code.
    pub fn fourcc(&self) -> u32 {
        match self {
            UvcFormat::Yuyv => v4l2::PIX_FMT_YUYV,
            UvcFormat::Mjpeg => v4l2::PIX_FMT_MJPEG,
        }
    }

    /// Format with the given V4L2 pixel format code.
    pub fn from_fourcc(fourcc: u32) -> Option<Self> {
        Self::all().iter().copied().find(|format| format.fourcc() == fourcc)
    }

    /// Largest frame in bytes for a frame of the given size.
    ///
    /// Compressed frames are bounded by the descriptor's maximum frame buffer size.
    pub fn max_frame_size(&self, width: u32, height: u32, max_buffer_size: u32) -> u32 {
        match self {
            UvcFormat::Yuyv => width.saturating_mul(height).saturating_mul(2),
            UvcFormat::Mjpeg if max_buffer_size > 0 => max_buffer_size,
            UvcFormat::Mjpeg => width.saturating_mul(height).saturating_mul(2),
        }
    }
}

impl fmt::Display for UvcFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UvcFormat::Yuyv => write!(f, "YUYV"),
            UvcFormat::Mjpeg => write!(f, "MJPEG"),
        }
    }
}

/// USB Video Class (UVC) frame descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FrameConfig {
    /// Frame index (`bFrameIndex`), starting at 1.
    pub index: u8,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frame intervals available each in 100 ns units, in ascending order
    pub intervals: Vec<u32>,
    /// Maximum frame buffer size in bytes
    pub max_video_frame_buffer_size: u32,
}

impl FrameConfig {
    /// Creates a frame with the specified size and frame intervals.
    pub fn new(width: u32, height: u32, intervals: Vec<u32>) -> Self {
        let mut intervals = intervals;
        intervals.sort_unstable();
        intervals.dedup();
        Self {
            index: 0,
            width,
            height,
            intervals,
            max_video_frame_buffer_size: width.saturating_mul(height).saturating_mul(2),
        }
    }
}

/// USB Video Class (UVC) format descriptor with its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FormatConfig {
    /// Format index (`bFormatIndex`), starting at 1.
    pub index: u8,
    /// Frame format
    pub format: UvcFormat,
    /// Frames ordered by index
    pub frames: Vec<FrameConfig>,
}

impl FormatConfig {
    /// Creates a format with the specified frames.
    ///
    /// Frame indices are assigned in order.
    pub fn new(format: UvcFormat, frames: Vec<FrameConfig>) -> Self {
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(i, frame)| FrameConfig { index: i as u8 + 1, ..frame })
            .collect();
        Self { index: 0, format, frames }
    }

    /// Frame with the given index.
    pub fn frame(&self, index: u8) -> Option<&FrameConfig> {
        self.frames.iter().find(|frame| frame.index == index)
    }
}

/// Bandwidth configuration of the video streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingEndpoint {
    /// Maximum packet size in bytes.
    pub maxpacket: u32,
    /// Additional packets per service interval at SuperSpeed.
    pub maxburst: u32,
    /// Polling interval.
    pub interval: u32,
}

impl Default for StreamingEndpoint {
    fn default() -> Self {
        Self { maxpacket: 1024, maxburst: 0, interval: 1 }
    }
}

impl StreamingEndpoint {
    /// Largest payload the endpoint transfers per service interval.
    pub fn max_payload_transfer_size(&self) -> u32 {
        self.maxpacket.saturating_mul(self.maxburst + 1)
    }
}

/// USB Video Class (UVC) function bound to a UDC.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UvcFunction {
    /// Function name, for example `g1/functions/uvc.0`, or the UDC name of a legacy gadget.
    pub name: String,
    /// Device node of the function.
    pub video: PathBuf,
    /// Video control interface number.
    pub control_interface: u8,
    /// Video streaming interface number.
    pub streaming_interface: u8,
    /// Streaming endpoint configuration.
    pub streaming: StreamingEndpoint,
    /// Formats ordered by index.
    pub formats: Vec<FormatConfig>,
}

impl UvcFunction {
    /// Creates a function description with the specified formats.
    ///
    /// Format indices are assigned in order.
    /// The control interface is 0 and the streaming interface is 1.
    pub fn new(video: impl AsRef<Path>, formats: Vec<FormatConfig>) -> Self {
        let formats = formats
            .into_iter()
            .enumerate()
            .map(|(i, format)| FormatConfig { index: i as u8 + 1, ..format })
            .collect();
        Self {
            name: String::new(),
            video: video.as_ref().to_path_buf(),
            control_interface: 0,
            streaming_interface: 1,
            streaming: StreamingEndpoint::default(),
            formats,
        }
    }

    /// Sets the interface numbers.
    pub fn with_interfaces(mut self, control: u8, streaming: u8) -> Self {
        self.control_interface = control;
        self.streaming_interface = streaming;
        self
    }

    /// Sets the streaming endpoint configuration.
    pub fn with_streaming(mut self, streaming: StreamingEndpoint) -> Self {
        self.streaming = streaming;
        self
    }

    /// Descriptors of the legacy `g_webcam` gadget driver.
    pub fn legacy(udc: &str, video: impl AsRef<Path>) -> Self {
        let frames = || {
            vec![
                FrameConfig::new(640, 360, vec![666666, 10000000, 50000000]),
                FrameConfig::new(1280, 720, vec![5000000]),
            ]
        };
        let mut func = Self::new(
            video,
            vec![FormatConfig::new(UvcFormat::Yuyv, frames()), FormatConfig::new(UvcFormat::Mjpeg, frames())],
        );
        func.name = udc.to_string();
        func
    }

    /// Format with the given index.
    pub fn format(&self, index: u8) -> Option<&FormatConfig> {
        self.formats.iter().find(|format| format.index == index)
    }

    /// Resolves a UVC function.
    ///
    /// The specifier selects the function:
    ///   * `None`: the first UVC function of the first gadget,
    ///   * `uvc.N`: the function of that name in any gadget,
    ///   * `gadget/functions/uvc.N`: that exact function,
    ///   * otherwise the name of a UDC driven by the legacy `g_webcam` gadget.
    pub fn resolve(specifier: Option<&str>) -> Result<Self> {
        let configfs = configfs_dir().ok();
        Self::resolve_in(configfs.as_deref(), Path::new(UDC_CLASS_DIR), specifier)
    }

    /// Resolves a UVC function using the given configfs mount point and sysfs UDC class directory.
    pub fn resolve_in(configfs: Option<&Path>, udc_class: &Path, specifier: Option<&str>) -> Result<Self> {
        let not_found = || Error::FunctionNotFound(specifier.unwrap_or("<default>").to_string());
        let gadgets = configfs.map(|dir| dir.join("usb_gadget"));

        let function_dir = match (gadgets.as_deref(), specifier) {
            (Some(gadgets), None) => all_functions(gadgets, None)?.into_iter().next(),
            (Some(gadgets), Some(spec)) if spec.contains('/') => {
                let dir = gadgets.join(spec);
                is_uvc_function(&dir).then_some(dir)
            }
            (Some(gadgets), Some(spec)) => {
                let mut found = all_functions(gadgets, Some(OsStr::new(spec)))?;
                if found.len() > 1 {
                    return Err(Error::FunctionNotFound(format!("{spec} is ambiguous")));
                }
                found.pop()
            }
            (None, _) => None,
        };

        match (function_dir, specifier) {
            (Some(dir), _) => Self::parse(&dir, udc_class),
            (None, Some(udc)) if !udc.contains('/') => {
                let udc_dev = Udc::in_class(udc_class, udc);
                if !udc_dev.exists() {
                    return Err(not_found());
                }
                if let Ok(Some(driver)) = udc_dev.function() {
                    log::debug!("UDC {udc} is driven by {}", driver.to_string_lossy());
                }
                let video = udc_dev.video_node(None).map_err(|_| not_found())?;
                log::info!("using legacy UVC gadget on UDC {udc}");
                Ok(Self::legacy(udc, video))
            }
            (None, _) => Err(not_found()),
        }
    }

    /// Reads the description of a configfs UVC function directory.
    fn parse(dir: &Path, udc_class: &Path) -> Result<Self> {
        let gadget = dir.parent().and_then(Path::parent).ok_or_else(|| Error::FunctionNotFound(dir_name(dir)))?;
        let name = match (gadget.file_name(), dir.file_name()) {
            (Some(g), Some(f)) => format!("{}/functions/{}", g.to_string_lossy(), f.to_string_lossy()),
            _ => dir_name(dir),
        };

        let udc = read_os(&gadget.join("UDC"))?;
        if udc.is_empty() {
            return Err(Error::FunctionNotFound(format!("{name} is not bound to a UDC")));
        }

        let function_name = read_os(&dir.join("function_name")).ok().filter(|n| !n.is_empty());
        let video = Udc::in_class(udc_class, &udc)
            .video_node(function_name.as_deref())
            .map_err(|_| Error::FunctionNotFound(format!("{name} has no video device")))?;

        let mut formats = Vec::new();
        for &format in UvcFormat::all() {
            let group = dir.join("streaming").join(format.group_dir_name());
            for format_dir in sub_dirs(&group)? {
                let Ok(index) = read_num::<u8>(&format_dir.join("bFormatIndex")) else { continue };
                let mut frames = Vec::new();
                for frame_dir in sub_dirs(&format_dir)? {
                    let Ok(index) = read_num::<u8>(&frame_dir.join("bFrameIndex")) else { continue };
                    let mut intervals = read_list(&frame_dir.join("dwFrameInterval"))?;
                    intervals.sort_unstable();
                    frames.push(FrameConfig {
                        index,
                        width: read_num(&frame_dir.join("wWidth"))?,
                        height: read_num(&frame_dir.join("wHeight"))?,
                        intervals,
                        max_video_frame_buffer_size: read_num(&frame_dir.join("dwMaxVideoFrameBufferSize"))?,
                    });
                }
                frames.sort_by_key(|frame| frame.index);
                formats.push(FormatConfig { index, format, frames });
            }
        }
        formats.sort_by_key(|format| format.index);

        let func = Self {
            name,
            video,
            control_interface: read_num(&dir.join("control/bInterfaceNumber"))?,
            streaming_interface: read_num(&dir.join("streaming/bInterfaceNumber"))?,
            streaming: StreamingEndpoint {
                maxpacket: read_num(&dir.join("streaming_maxpacket"))?,
                maxburst: read_num(&dir.join("streaming_maxburst"))?,
                interval: read_num(&dir.join("streaming_interval"))?,
            },
            formats,
        };
        log::debug!("resolved UVC function {} with video device {}", func.name, func.video.display());
        Ok(func)
    }
}

fn dir_name(dir: &Path) -> String {
    dir.to_string_lossy().into_owned()
}

fn is_uvc_function(dir: &Path) -> bool {
    dir.is_dir() && dir.file_name().is_some_and(|name| name.as_encoded_bytes().starts_with(b"uvc."))
}

/// UVC function directories of all gadgets, sorted by gadget and function name.
fn all_functions(gadgets: &Path, name: Option<&OsStr>) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for gadget in sub_dirs(gadgets)? {
        for function in sub_dirs(&gadget.join("functions"))? {
            if is_uvc_function(&function) && name.map_or(true, |name| function.file_name() == Some(name)) {
                found.push(function);
            }
        }
    }
    Ok(found)
}

/// Sorted subdirectories, excluding symlinks; empty if `dir` does not exist.
fn sub_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_os(path: &Path) -> Result<OsString> {
    let data = OsString::from_vec(fs::read(path)?);
    Ok(trim_os_str(&data).to_os_string())
}

fn read_num<T: FromStr>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    text.trim().parse().map_err(|_| {
        IoError::new(ErrorKind::InvalidData, format!("invalid value {:?} in {}", text.trim(), path.display())).into()
    })
}

fn read_list(path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(path)?;
    text.split_whitespace()
        .map(|v| {
            v.parse().map_err(|_| IoError::new(ErrorKind::InvalidData, format!("invalid interval {v:?}")).into())
        })
        .collect()
}
