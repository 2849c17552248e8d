//! Decoded frame container.
//!
//! - `Frame`: immutable RGB24 pixel buffer with dimensions and sequence number.
//! - Display path: downscale to a maximum width, then JPEG-encode.
//! - Analysis path: JPEG-encode at full resolution.
//!
//! Supervisors share frames as `Arc<Frame>`; a consumer that needs to keep
//! pixels beyond one broadcast cycle clones the frame.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, GenericImageView, ImageBuffer, ImageResult, Rgb};

use crate::error::SourceError;

/// Encoded JPEG plus the dimensions it was encoded at.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decoded RGB24 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position in the owning stream, assigned by the supervisor. Starts at 1.
    pub sequence: u64,
}

impl Frame {
    /// Wrap an RGB24 buffer, checking that its length matches the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self, SourceError> {
        if width == 0 || height == 0 {
            return Err(SourceError::read(format!(
                "frame has empty dimensions {}x{}",
                width, height
            )));
        }
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| SourceError::read("RGB frame dimensions overflow"))?
            as usize;
        if data.len() != expected {
            return Err(SourceError::read(format!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
        })
    }

    /// Decode a JPEG (or any enabled image format) into an RGB24 frame.
    pub fn decode_jpeg(bytes: &[u8]) -> Result<Self, SourceError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| SourceError::read(format!("decode jpeg: {}", e)))?;
        let (width, height) = image.dimensions();
        Self::from_rgb(image.into_rgb8().into_raw(), width, height)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Full-resolution JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> ImageResult<Vec<u8>> {
        encode_rgb(&self.data, self.width, self.height, quality)
    }

    /// JPEG scaled down to at most `max_width` pixels wide.
    pub fn encode_display(&self, max_width: u32, quality: u8) -> ImageResult<EncodedFrame> {
        let (width, height) = display_dimensions(self.width, self.height, max_width);
        if width == self.width {
            return Ok(EncodedFrame {
                jpeg: self.encode_jpeg(quality)?,
                width,
                height,
            });
        }

        let view = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(self.width, self.height, self.data.as_slice())
            .ok_or_else(|| {
                image::ImageError::Parameter(image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ))
            })?;
        let resized = imageops::resize(&view, width, height, FilterType::Triangle);
        Ok(EncodedFrame {
            jpeg: encode_rgb(resized.as_raw(), width, height, quality)?,
            width,
            height,
        })
    }
}

/// Target size for the display path; aspect ratio is preserved.
pub fn display_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || max_width == 0 {
        return (width, height);
    }
    let scale = max_width as f64 / width as f64;
    let scaled_height = ((height as f64) * scale) as u32;
    (max_width, scaled_height.max(1))
}

fn encode_rgb(pixels: &[u8], width: u32, height: u32, quality: u8) -> ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        pixels,
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}
