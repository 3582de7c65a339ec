use super::{FrameProducer, StreamFormat};
use crate::{Error, Result, UvcFormat};

/// 75% colour bars as (Y, U, V).
const BARS: [(u8, u8, u8); 8] = [
    (180, 128, 128), // white
    (162, 44, 142),  // yellow
    (131, 156, 44),  // cyan
    (112, 72, 58),   // green
    (84, 184, 198),  // magenta
    (65, 100, 212),  // red
    (35, 212, 114),  // blue
    (16, 128, 128),  // black
];

/// Synthetic YUYV colour bars scrolling one step per frame.
///
/// Any other requested format is substituted by YUYV.
#[derive(Debug, Clone, Default)]
pub struct TestPattern {
    width: u32,
    height: u32,
    offset: u32,
}

impl TestPattern {
    /// Creates a test pattern generator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameProducer for TestPattern {
    fn name(&self) -> String {
        "test pattern".to_string()
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        StreamFormat { format: UvcFormat::Yuyv, ..*requested }
    }

    fn start(&mut self, format: &StreamFormat, _capacity: usize) -> Result<()> {
        if format.format != UvcFormat::Yuyv {
            return Err(Error::SourceUnavailable(format!("test pattern cannot produce {}", format.format)));
        }
        if format.width < 2 || format.height == 0 {
            return Err(Error::SourceUnavailable(format!("invalid frame size {}x{}", format.width, format.height)));
        }

        self.width = format.width;
        self.height = format.height;
        self.offset = 0;
        Ok(())
    }

    fn produce(&mut self, frame: &mut [u8]) -> Result<usize> {
        let stride = self.width as usize * 2;
        let rows = (frame.len() / stride).min(self.height as usize);

        for row in frame[..rows * stride].chunks_exact_mut(stride) {
            for (pair, px) in row.chunks_exact_mut(4).enumerate() {
                let x = (pair as u32 * 2 + self.offset) % self.width;
                let (y, u, v) = BARS[(x as usize * BARS.len()) / self.width as usize];
                px.copy_from_slice(&[y, u, y, v]);
            }
        }

        self.offset = (self.offset + 2) % self.width;
        Ok(rows * stride)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bars_scroll() {
        let mut pattern = TestPattern::new();
        let format = StreamFormat { format: UvcFormat::Yuyv, width: 16, height: 2, interval: 333333 };
        pattern.start(&format, 64).unwrap();

        let mut frame = vec![0; 16 * 2 * 2];
        assert_eq!(pattern.produce(&mut frame).unwrap(), 64);
        assert_eq!(&frame[..4], &[180, 128, 180, 128]);
        assert_eq!(&frame[28..32], &[16, 128, 16, 128]);
        assert_eq!(&frame[..32], &frame[32..]);

        pattern.produce(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[162, 44, 162, 142]);
        pattern.produce(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[131, 156, 131, 44]);
    }

    #[test]
    fn substitutes_yuyv() {
        let mut pattern = TestPattern::new();
        let requested = StreamFormat { format: UvcFormat::Mjpeg, width: 640, height: 360, interval: 666666 };
        let offered = pattern.negotiate_format(&requested);
        assert_eq!(offered.format, UvcFormat::Yuyv);
        assert_eq!(offered.width, 640);
    }
}
