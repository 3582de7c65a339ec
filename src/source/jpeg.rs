use std::{fs, path::Path};

use super::{FrameProducer, StreamFormat};
use crate::{Error, Result, UvcFormat};

/// JPEG start of image marker.
const SOI: [u8; 2] = [0xff, 0xd8];

/// Checks that `data` starts like a JPEG image.
pub(crate) fn check_jpeg(data: &[u8], name: &str) -> Result<()> {
    if data.starts_with(&SOI) {
        Ok(())
    } else {
        Err(Error::SourceUnavailable(format!("{name} is not a JPEG image")))
    }
}

/// Checks that an image fits into frame buffers of `capacity` bytes.
pub(crate) fn check_fits(image: &[u8], capacity: usize, name: &str) -> Result<()> {
    if image.len() > capacity {
        return Err(Error::SourceUnavailable(format!(
            "{name} of {} bytes exceeds frame buffer of {capacity} bytes",
            image.len()
        )));
    }
    Ok(())
}

/// Copies an image into a frame buffer.
pub(crate) fn emit(image: &[u8], frame: &mut [u8]) -> Result<usize> {
    let Some(dst) = frame.get_mut(..image.len()) else {
        return Err(Error::SourceError(format!(
            "image of {} bytes exceeds frame buffer of {} bytes",
            image.len(),
            frame.len()
        )));
    };
    dst.copy_from_slice(image);
    Ok(image.len())
}

/// A static JPEG image re-emitted as MJPEG every frame.
#[derive(Debug, Clone)]
pub struct JpegImage {
    name: String,
    data: Vec<u8>,
}

impl JpegImage {
    /// Loads the image from a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|err| Error::SourceUnavailable(format!("cannot read {}: {err}", path.display())))?;
        Self::from_bytes(path.display().to_string(), data)
    }

    /// Uses an image held in memory.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Result<Self> {
        let name = name.into();
        check_jpeg(&data, &name)?;
        log::debug!("loaded JPEG image {name} of {} bytes", data.len());
        Ok(Self { name, data })
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl FrameProducer for JpegImage {
    fn name(&self) -> String {
        format!("JPEG image {}", self.name)
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        StreamFormat { format: UvcFormat::Mjpeg, ..*requested }
    }

    fn start(&mut self, _format: &StreamFormat, capacity: usize) -> Result<()> {
        check_fits(&self.data, capacity, &self.name)
    }

    fn produce(&mut self, frame: &mut [u8]) -> Result<usize> {
        emit(&self.data, frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_non_jpeg() {
        assert!(matches!(JpegImage::from_bytes("x", vec![0x89, b'P', b'N', b'G']), Err(Error::SourceUnavailable(_))));
    }

    #[test]
    fn emits_image() {
        let mut image = JpegImage::from_bytes("x", vec![0xff, 0xd8, 1, 2, 0xff, 0xd9]).unwrap();
        let mut frame = [0; 8];
        assert_eq!(image.produce(&mut frame).unwrap(), 6);
        assert_eq!(&frame[..6], &[0xff, 0xd8, 1, 2, 0xff, 0xd9]);

        let mut small = [0; 4];
        assert!(matches!(image.produce(&mut small), Err(Error::SourceError(_))));
    }

    #[test]
    fn oversized_image_fails_start() {
        let mut image = JpegImage::from_bytes("x", vec![0xff, 0xd8, 1, 2, 0xff, 0xd9]).unwrap();
        let format = StreamFormat { format: UvcFormat::Mjpeg, width: 2, height: 1, interval: 333333 };
        match image.start(&format, 4) {
            Err(Error::SourceUnavailable(msg)) => assert!(msg.contains("6 bytes")),
            other => panic!("unexpected result {other:?}"),
        }
        image.start(&format, 6).unwrap();
    }
}
