use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use super::{
    jpeg::{check_fits, check_jpeg, emit},
    FrameProducer, StreamFormat,
};
use crate::{Error, Result, UvcFormat};

/// Default time each slide is shown.
pub const DEFAULT_SLIDE_DURATION: Duration = Duration::from_secs(1);

/// Every JPEG image of a directory, shown in name order as MJPEG.
#[derive(Debug, Clone)]
pub struct Slideshow {
    dir: PathBuf,
    slides: Vec<Vec<u8>>,
    hold: Duration,
    current: usize,
    shown_since: Option<Instant>,
}

impl Slideshow {
    /// Loads all `*.jpg` and `*.jpeg` files of a directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let unavailable = |err: std::io::Error| Error::SourceUnavailable(format!("{}: {err}", dir.display()));

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir).map_err(unavailable)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let is_jpeg = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
            if is_jpeg && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut slides = Vec::with_capacity(paths.len());
        for path in paths {
            let data = fs::read(&path).map_err(unavailable)?;
            check_jpeg(&data, &path.display().to_string())?;
            slides.push(data);
        }

        if slides.is_empty() {
            return Err(Error::SourceUnavailable(format!("no JPEG images in {}", dir.display())));
        }

        log::debug!("loaded {} slides from {}", slides.len(), dir.display());
        Ok(Self { dir, slides, hold: DEFAULT_SLIDE_DURATION, current: 0, shown_since: None })
    }

    /// Sets how long each slide is shown.
    pub fn with_slide_duration(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Number of slides.
    pub fn len(&self) -> usize {
        self.slides.len()
    }

    /// Whether there are no slides.
    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }

    /// Index of the slide shown next.
    pub fn current(&self) -> usize {
        self.current
    }

    fn advance(&mut self, now: Instant) {
        match self.shown_since {
            Some(since) if now.duration_since(since) >= self.hold => {
                self.current = (self.current + 1) % self.slides.len();
                self.shown_since = Some(now);
            }
            Some(_) => (),
            None => self.shown_since = Some(now),
        }
    }
}

impl FrameProducer for Slideshow {
    fn name(&self) -> String {
        format!("slideshow {}", self.dir.display())
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        StreamFormat { format: UvcFormat::Mjpeg, ..*requested }
    }

    fn start(&mut self, _format: &StreamFormat, capacity: usize) -> Result<()> {
        for (slide, data) in self.slides.iter().enumerate() {
            check_fits(data, capacity, &format!("slide {slide} of {}", self.dir.display()))?;
        }
        self.shown_since = None;
        Ok(())
    }

    fn produce(&mut self, frame: &mut [u8]) -> Result<usize> {
        self.advance(Instant::now());
        emit(&self.slides[self.current], frame)
    }
}
