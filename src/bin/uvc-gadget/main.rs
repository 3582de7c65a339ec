//! Streams video to a USB host through a UVC gadget function.

use clap::Parser;
use std::{
    io::{Error as IoError, ErrorKind},
    ops::RangeInclusive,
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    time::Duration,
};
use strum::VariantNames;

#[cfg(feature = "libcamera")]
use uvc_gadget::source::LibcameraSource;
use uvc_gadget::{
    node::UvcDevice,
    source::{
        check_range, AfRange, AfSpeed, AwbMode, CameraControls, ColourGains, ExposureMode, JpegImage, Slideshow,
        TestPattern, TimedSource, V4l2Capture, VideoSource, BRIGHTNESS_RANGE, CONTRAST_RANGE, DEFAULT_SLIDE_DURATION,
        LENS_POSITION_RANGE, SATURATION_RANGE, SHARPNESS_RANGE,
    },
    udcs, Error, Events, Result, StreamConfig, UvcFunction, UvcStream,
};

mod config;
use config::{FileConfig, TuningConfig};

/// UVC gadget video streamer.
///
/// Without a source option a test pattern is streamed.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// UVC function: `uvc.N`, `GADGET/functions/uvc.N` or the UDC of a legacy g_webcam gadget.
    ///
    /// Defaults to the first UVC function found.
    function: Option<String>,

    /// Capture frames from a V4L2 video device.
    #[arg(short = 'd', long, conflicts_with_all = ["image", "slides"])]
    device: Option<PathBuf>,

    /// Capture frames from a libcamera camera, given by index or id.
    #[arg(short = 'c', long, conflicts_with_all = ["device", "image", "slides"])]
    camera: Option<String>,

    /// Stream a JPEG image.
    #[arg(short = 'i', long, conflicts_with = "slides")]
    image: Option<PathBuf>,

    /// Show every JPEG image of a directory.
    #[arg(short = 's', long)]
    slides: Option<PathBuf>,

    /// Seconds each slide is shown.
    #[arg(long)]
    slide_duration: Option<f64>,

    /// Number of frame buffers.
    #[arg(long)]
    buffers: Option<usize>,

    /// Number of payload buffers of the function node.
    #[arg(long)]
    payload_buffers: Option<u32>,

    /// Number of frames waiting for transmission before the source is throttled.
    #[arg(long)]
    max_pending: Option<usize>,

    /// Include PTS and SCR timestamps in payload headers.
    #[arg(long)]
    timestamps: bool,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera autofocus range: normal or macro.
    #[arg(long, value_parser = mode::<AfRange>, help_heading = "Camera")]
    autofocus_range: Option<AfRange>,

    /// Camera autofocus speed: normal or fast.
    #[arg(long, value_parser = mode::<AfSpeed>, help_heading = "Camera")]
    autofocus_speed: Option<AfSpeed>,

    /// Fixed lens position in dioptres, disabling autofocus. 0 is infinity, 2 is 50 cm.
    #[arg(long, value_parser = ranged("lens position", LENS_POSITION_RANGE), help_heading = "Camera")]
    lens_position: Option<f32>,

    /// Auto white balance mode.
    #[arg(long, value_parser = mode::<AwbMode>, help_heading = "Camera")]
    awb: Option<AwbMode>,

    /// Manual red and blue gains as `R,B`, disabling auto white balance.
    #[arg(long, alias = "awbgains", value_parser = colour_gains, help_heading = "Camera")]
    colour_gains: Option<ColourGains>,

    /// Exposure mode: normal, short (or sport) or long.
    #[arg(long, value_parser = mode::<ExposureMode>, help_heading = "Camera")]
    exposure: Option<ExposureMode>,

    /// Brightness from -1 to 1, 0 is unchanged.
    #[arg(
        long,
        allow_negative_numbers = true,
        value_parser = ranged("brightness", BRIGHTNESS_RANGE),
        help_heading = "Camera"
    )]
    brightness: Option<f32>,

    /// Contrast from 0 to 32, 1 is unchanged.
    #[arg(long, value_parser = ranged("contrast", CONTRAST_RANGE), help_heading = "Camera")]
    contrast: Option<f32>,

    /// Saturation from 0 to 32, 1 is unchanged.
    #[arg(long, value_parser = ranged("saturation", SATURATION_RANGE), help_heading = "Camera")]
    saturation: Option<f32>,

    /// Sharpness from 0 to 16, 1 is the camera default.
    #[arg(long, value_parser = ranged("sharpness", SHARPNESS_RANGE), help_heading = "Camera")]
    sharpness: Option<f32>,

    /// Log lens position and colour gains of the camera once per second.
    #[arg(long, help_heading = "Camera")]
    camera_debug_report: bool,
}

fn mode<T: FromStr + VariantNames>(s: &str) -> std::result::Result<T, String> {
    s.parse().map_err(|_| format!("expected one of {}", T::VARIANTS.join(", ")))
}

fn ranged(
    name: &'static str, range: RangeInclusive<f32>,
) -> impl Fn(&str) -> std::result::Result<f32, String> + Clone + Send + Sync + 'static {
    move |s| {
        let value = s.parse::<f32>().map_err(|err| format!("invalid {name}: {err}"))?;
        check_range(name, value, &range).map_err(|err| err.to_string())
    }
}

fn colour_gains(s: &str) -> std::result::Result<ColourGains, String> {
    s.parse().map_err(|err: Error| err.to_string())
}

/// Selected video source.
#[derive(Debug, Clone, PartialEq)]
enum SourceKind {
    Pattern,
    Image(PathBuf),
    Slides(PathBuf, Duration),
    Device(PathBuf),
    Camera(String, CameraControls),
}

impl SourceKind {
    fn open(&self) -> Result<Box<dyn VideoSource>> {
        Ok(match self {
            Self::Pattern => Box::new(TimedSource::new(TestPattern::new())),
            Self::Image(path) => Box::new(TimedSource::new(JpegImage::open(path)?)),
            Self::Slides(dir, hold) => Box::new(TimedSource::new(Slideshow::open(dir)?.with_slide_duration(*hold))),
            Self::Device(path) => Box::new(V4l2Capture::open(path)?),
            #[cfg(feature = "libcamera")]
            Self::Camera(camera, controls) => Box::new(LibcameraSource::open(camera.clone(), *controls)?),
            #[cfg(not(feature = "libcamera"))]
            Self::Camera(..) => {
                return Err(Error::SourceUnavailable("built without libcamera support".to_string()));
            }
        })
    }
}

/// Settings merged from the command line and the configuration file.
#[derive(Debug)]
struct Settings {
    function: Option<String>,
    source: SourceKind,
    stream: StreamConfig,
}

fn invalid(msg: String) -> Error {
    Error::Io(IoError::new(ErrorKind::InvalidInput, msg))
}

/// Parses a camera mode given in the configuration file.
fn file_mode<T: FromStr + VariantNames>(name: &str, value: &Option<String>) -> Result<Option<T>> {
    value.as_deref().map(|v| mode(v).map_err(|err| invalid(format!("{name} {v}: {err}")))).transpose()
}

/// Camera controls from the command line, falling back to the configuration file.
fn camera_controls(args: &Args, tuning: &TuningConfig) -> Result<CameraControls> {
    let controls = CameraControls {
        af_range: args.autofocus_range.or(file_mode("autofocus range", &tuning.autofocus_range)?),
        af_speed: args.autofocus_speed.or(file_mode("autofocus speed", &tuning.autofocus_speed)?),
        lens_position: args.lens_position.or(tuning.lens_position),
        awb: args.awb.or(file_mode("awb mode", &tuning.awb)?),
        colour_gains: args.colour_gains.or(tuning.colour_gains.map(|[red, blue]| ColourGains { red, blue })),
        exposure: args.exposure.or(file_mode("exposure mode", &tuning.exposure)?),
        brightness: args.brightness.or(tuning.brightness),
        contrast: args.contrast.or(tuning.contrast),
        saturation: args.saturation.or(tuning.saturation),
        sharpness: args.sharpness.or(tuning.sharpness),
        debug_report: args.camera_debug_report || tuning.debug_report.unwrap_or_default(),
    };
    controls.validate()?;
    Ok(controls)
}

impl Settings {
    fn merge(args: Args, file: FileConfig) -> Result<Self> {
        if file.sources() > 1 {
            return Err(invalid("configuration file selects more than one video source".to_string()));
        }
        let controls = camera_controls(&args, &file.tuning)?;

        let secs = args.slide_duration.or(file.slide_duration);
        let hold = match secs {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|err| invalid(format!("invalid slide duration {secs}: {err}")))?,
            None => DEFAULT_SLIDE_DURATION,
        };

        let source = if let Some(path) = args.device {
            SourceKind::Device(path)
        } else if let Some(camera) = args.camera {
            SourceKind::Camera(camera, controls)
        } else if let Some(path) = args.image {
            SourceKind::Image(path)
        } else if let Some(dir) = args.slides {
            SourceKind::Slides(dir, hold)
        } else if let Some(path) = file.device {
            SourceKind::Device(path)
        } else if let Some(camera) = file.camera {
            SourceKind::Camera(camera, controls)
        } else if let Some(path) = file.image {
            SourceKind::Image(path)
        } else if let Some(dir) = file.slides {
            SourceKind::Slides(dir, hold)
        } else {
            SourceKind::Pattern
        };
        if !controls.is_default() && !matches!(source, SourceKind::Camera(..)) {
            log::warn!("camera controls have no effect without a camera source");
        }

        let mut stream = StreamConfig::new();
        if let Some(buffers) = args.buffers.or(file.buffers) {
            stream = stream.with_buffers(buffers);
        }
        if let Some(slots) = args.payload_buffers.or(file.payload_buffers) {
            stream = stream.with_node_buffers(slots);
        }
        if let Some(max_pending) = args.max_pending.or(file.max_pending) {
            stream = stream.with_max_pending(max_pending);
        }
        if let Some(clock) = file.clock_frequency {
            stream = stream.with_clock_frequency(clock);
        }
        let pts = args.timestamps || file.pts.unwrap_or_default();
        let scr = args.timestamps || file.scr.unwrap_or_default();
        stream = stream.with_timestamps(pts, scr);

        Ok(Self { function: args.function.or(file.function), source, stream })
    }
}

fn run(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::merge(args, file)?;
    log::debug!("settings: {settings:?}");

    match udcs() {
        Ok(udcs) => {
            for udc in udcs {
                let state = udc.state().unwrap_or_default();
                log::debug!("UDC {} is {state}", udc.name().to_string_lossy());
            }
        }
        Err(err) => log::debug!("cannot enumerate UDCs: {err}"),
    }

    let function = UvcFunction::resolve(settings.function.as_deref())?;
    log::info!("using UVC function {} with video node {}", function.name, function.video.display());

    let node = UvcDevice::open(&function.video)?;
    let source = settings.source.open()?;
    let events = Events::new()?;
    let stream = UvcStream::new(node, source, function, settings.stream, &events)?;

    let stop = events.stop_handle();
    ctrlc::set_handler(move || stop.stop()).map_err(IoError::other)?;

    log::info!("serving {}", stream.source_name());
    loop {
        match events.run() {
            Ok(()) => break,
            Err(err) if err.is_session() => log::error!("streaming session ended: {err}"),
            Err(err) => return Err(err),
        }
    }

    log::info!("exiting");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("uvc-gadget: {err}");
            ExitCode::FAILURE
        }
    }
}
