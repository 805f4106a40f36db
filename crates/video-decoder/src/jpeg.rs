//! Compact in-memory frame encoding
//!
//! Frame buffers hold JPEG bytes instead of raw RGB so a full race (several thousand
//! 1920x1080 frames) fits in memory.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use race_vision_common::Result;

/// Quality used for buffered frames
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Encode an RGB frame as JPEG bytes
///
/// # Errors
///
/// Returns an error if the encoder rejects the image.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    // Compressed frames are typically ~5% of the raw size
    let mut buf = Vec::with_capacity(image.as_raw().len() / 16);
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder.encode_image(image)?;
    }
    Ok(buf)
}

/// Decode JPEG bytes produced by [`encode_jpeg`]
///
/// # Errors
///
/// Returns an error if the bytes are not a valid JPEG stream.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
    Ok(image.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_encoded_frame_keeps_geometry() {
        let frame = RgbImage::from_pixel(64, 36, Rgb([40, 120, 200]));
        let bytes = encode_jpeg(&frame, DEFAULT_JPEG_QUALITY).unwrap();
        assert!(bytes.len() < frame.as_raw().len());

        let decoded = decode_jpeg(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (64, 36));

        // Flat colour survives lossy coding within a small tolerance
        let pixel = decoded.get_pixel(10, 10);
        assert!((i16::from(pixel[2]) - 200).abs() <= 4);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_jpeg(&[0, 1, 2, 3]).is_err());
    }
}
