//! Still-image encoding for captured frames.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::error::DetectError;
use crate::frame::Frame;

/// JPEG quality for captured stills.
pub const JPEG_QUALITY: u8 = 85;

/// Encode a frame as JPEG bytes.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, DetectError> {
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder
        .write_image(
            frame.data(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| DetectError::Encode(e.to_string()))?;
    Ok(out)
}
