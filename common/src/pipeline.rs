//! Image pipeline: square crop, resize and JPEG encoding of captured frames.
//!
//! A frame is an RGB pixel buffer.  The stored image and the preview
//! thumbnail are both produced from the cropped frame; each at a resolution
//! picked from a named, configurable [`ResolutionSet`].

use std::fmt;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// A raw captured frame.
pub type Frame = RgbImage;

/// Errors from the encode / decode steps.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame is empty ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("target resolution {0} has a zero dimension")]
    ZeroResolution(Resolution),
    #[error("codec rejected frame: {0}")]
    Codec(#[from] image::ImageError),
}

/// Errors from resolution lookup and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unknown resolution '{0}'")]
    Unknown(String),
    #[error("malformed resolution entry '{0}' (expected name=WIDTHxHEIGHT)")]
    Malformed(String),
    #[error("resolution set is empty")]
    Empty,
}

/// A named output size, e.g. `training=300x300`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}x{}", self.name, self.width, self.height)
    }
}

/// The set of resolutions the device may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionSet {
    entries: Vec<Resolution>,
}

impl ResolutionSet {
    /// Parse `name=WxH,name=WxH,...`.  Later duplicates replace earlier ones.
    pub fn parse(list: &str) -> Result<Self, ResolutionError> {
        let mut entries: Vec<Resolution> = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let malformed = || ResolutionError::Malformed(item.to_string());
            let (name, dims) = item.split_once('=').ok_or_else(malformed)?;
            let (w, h) = dims
                .trim()
                .split_once(['x', 'X'])
                .ok_or_else(malformed)?;
            let width: u32 = w.trim().parse().map_err(|_| malformed())?;
            let height: u32 = h.trim().parse().map_err(|_| malformed())?;
            let name = name.trim();
            if name.is_empty() || width == 0 || height == 0 {
                return Err(malformed());
            }

            entries.retain(|r| r.name != name);
            entries.push(Resolution {
                name: name.to_string(),
                width,
                height,
            });
        }
        if entries.is_empty() {
            return Err(ResolutionError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Result<&Resolution, ResolutionError> {
        self.entries
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ResolutionError::Unknown(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resolution> {
        self.entries.iter()
    }
}

/// Crop to a centered square whose side is the smaller frame dimension.
pub fn crop_square(frame: &Frame) -> Frame {
    let (width, height) = frame.dimensions();
    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    imageops::crop_imm(frame, x, y, side, side).to_image()
}

/// Resize to exactly `resolution` and encode as JPEG.
pub fn encode(frame: &Frame, resolution: &Resolution, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyFrame { width, height });
    }
    if resolution.width == 0 || resolution.height == 0 {
        return Err(EncodeError::ZeroResolution(resolution.clone()));
    }

    let resized = if (width, height) == (resolution.width, resolution.height) {
        frame.clone()
    } else {
        imageops::resize(frame, resolution.width, resolution.height, FilterType::Triangle)
    };

    let mut out = Vec::new();
    resized.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(out)
}

/// Encode the preview thumbnail.
pub fn thumbnail(frame: &Frame, resolution: &Resolution, quality: u8) -> Result<Vec<u8>, EncodeError> {
    encode(frame, resolution, quality)
}

/// Decode any supported image format into an RGB frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, EncodeError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> Frame {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    fn training() -> Resolution {
        Resolution {
            name: "training".into(),
            width: 300,
            height: 300,
        }
    }

    #[test]
    fn test_crop_square_landscape() {
        let frame = gradient(640, 480);
        let cropped = crop_square(&frame);
        assert_eq!(cropped.dimensions(), (480, 480));
        // Left edge of the crop is column 80 of the original.
        assert_eq!(cropped.get_pixel(0, 0), frame.get_pixel(80, 0));
        assert_eq!(cropped.get_pixel(479, 479), frame.get_pixel(559, 479));
    }

    #[test]
    fn test_crop_square_odd_height() {
        let frame = gradient(101, 51);
        let cropped = crop_square(&frame);
        assert_eq!(cropped.dimensions(), (51, 51));
        assert_eq!(cropped.get_pixel(0, 0), frame.get_pixel(25, 0));
    }

    #[test]
    fn test_crop_square_portrait() {
        let frame = gradient(40, 100);
        assert_eq!(crop_square(&frame).dimensions(), (40, 40));
    }

    #[test]
    fn test_encode_resizes_to_target() {
        let frame = crop_square(&gradient(640, 480));
        let jpeg = encode(&frame, &training(), 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (300, 300));
    }

    #[test]
    fn test_encode_empty_frame_fails() {
        let frame = RgbImage::new(0, 0);
        let err = encode(&frame, &training(), 90).unwrap_err();
        assert!(matches!(err, EncodeError::EmptyFrame { .. }));
        assert!(thumbnail(&frame, &training(), 90).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(b"definitely not an image").is_err());
    }

    #[test]
    fn test_resolution_set_parse() {
        let set = ResolutionSet::parse("1080p=1920x1080, training=300x300,training=224x224").unwrap();
        assert_eq!(set.len(), 2);
        let t = set.get("training").unwrap();
        assert_eq!((t.width, t.height), (224, 224));
        assert_eq!(set.get("4k"), Err(ResolutionError::Unknown("4k".into())));
    }

    #[test]
    fn test_resolution_set_rejects_malformed() {
        assert!(matches!(
            ResolutionSet::parse("training=300"),
            Err(ResolutionError::Malformed(_))
        ));
        assert!(matches!(
            ResolutionSet::parse("training=0x300"),
            Err(ResolutionError::Malformed(_))
        ));
        assert_eq!(ResolutionSet::parse(" , "), Err(ResolutionError::Empty));
    }
}
