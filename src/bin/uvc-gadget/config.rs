//! Configuration file.

use serde::Deserialize;
use std::{
    fs,
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
};

/// Contents of a TOML configuration file.
///
/// Every setting is optional; command line arguments take precedence.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// UVC function specifier.
    pub function: Option<String>,
    /// V4L2 capture device.
    pub device: Option<PathBuf>,
    /// libcamera camera index or id.
    pub camera: Option<String>,
    /// JPEG image.
    pub image: Option<PathBuf>,
    /// Slideshow directory.
    pub slides: Option<PathBuf>,
    /// Seconds each slide is shown.
    pub slide_duration: Option<f64>,
    /// Number of frame buffers.
    pub buffers: Option<usize>,
    /// Number of payload buffers of the function node.
    pub payload_buffers: Option<u32>,
    /// Pending frame threshold.
    pub max_pending: Option<usize>,
    /// Device clock frequency in Hz.
    pub clock_frequency: Option<u32>,
    /// Include presentation time stamps.
    pub pts: Option<bool>,
    /// Include source clock references.
    pub scr: Option<bool>,
    /// Camera tuning.
    pub tuning: TuningConfig,
}

/// `[tuning]` table, applied to a libcamera camera.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningConfig {
    pub autofocus_range: Option<String>,
    pub autofocus_speed: Option<String>,
    pub lens_position: Option<f32>,
    pub awb: Option<String>,
    /// Red and blue gains.
    pub colour_gains: Option<[f32; 2]>,
    pub exposure: Option<String>,
    pub brightness: Option<f32>,
    pub contrast: Option<f32>,
    pub saturation: Option<f32>,
    pub sharpness: Option<f32>,
    pub debug_report: Option<bool>,
}

impl FileConfig {
    /// Loads the configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text).map_err(|err| Error::new(ErrorKind::InvalidData, format!("{}: {err}", path.display())))
    }

    fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Number of video sources selected.
    pub fn sources(&self) -> usize {
        [self.device.is_some(), self.camera.is_some(), self.image.is_some(), self.slides.is_some()]
            .into_iter()
            .filter(|&s| s)
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_file() {
        let cfg = FileConfig::parse(
            r#"
            function = "uvc.0"
            slides = "/srv/slides"
            slide_duration = 2.5
            buffers = 6
            pts = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.function.as_deref(), Some("uvc.0"));
        assert_eq!(cfg.slides, Some(PathBuf::from("/srv/slides")));
        assert_eq!(cfg.slide_duration, Some(2.5));
        assert_eq!(cfg.buffers, Some(6));
        assert_eq!(cfg.pts, Some(true));
        assert_eq!(cfg.scr, None);
        assert_eq!(cfg.sources(), 1);
    }

    #[test]
    fn camera_tuning() {
        let cfg = FileConfig::parse(
            r#"
            camera = "0"

            [tuning]
            awb = "daylight"
            colour_gains = [1.5, 2.0]
            brightness = -0.25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.camera.as_deref(), Some("0"));
        assert_eq!(cfg.tuning.awb.as_deref(), Some("daylight"));
        assert_eq!(cfg.tuning.colour_gains, Some([1.5, 2.0]));
        assert_eq!(cfg.tuning.brightness, Some(-0.25));
        assert_eq!(cfg.tuning.lens_position, None);
        assert_eq!(cfg.sources(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::parse("frame_rate = 30").is_err());
        assert!(FileConfig::parse("[tuning]\nhue = 1.0").is_err());
    }
}
