//! Upload validation and canonicalization
//!
//! Every image that reaches a removal provider goes through [`ImagePreparer`]:
//! the byte ceiling is enforced before decoding, oversized images are
//! downsampled so their larger side equals the configured maximum, and the
//! result is always re-encoded as PNG.

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

use crate::config::ImageConfig;
use crate::error::{Error, Result};

/// Image ready to be handed to a provider
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// PNG encoded bytes
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Whether the image was downsampled
    pub resized: bool,
}

/// Stateless image preparation with fixed limits
#[derive(Debug, Clone)]
pub struct ImagePreparer {
    max_bytes: usize,
    max_dimension: u32,
}

impl ImagePreparer {
    pub fn new(max_bytes: usize, max_dimension: u32) -> Self {
        Self {
            max_bytes,
            max_dimension,
        }
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        Self::new(config.max_upload_bytes, config.max_dimension)
    }

    /// Validate, decode, downsample if needed and re-encode as PNG
    pub fn prepare(&self, raw: &[u8]) -> Result<PreparedImage> {
        if raw.len() > self.max_bytes {
            return Err(Error::PayloadTooLarge {
                size: raw.len(),
                limit: self.max_bytes,
            });
        }
        if raw.is_empty() {
            return Err(Error::InvalidImage("empty upload".to_string()));
        }

        let image = image::load_from_memory(raw)
            .map_err(|e| Error::InvalidImage(e.to_string()))?;

        let (width, height) = image.dimensions();
        let (image, resized) = if width > self.max_dimension || height > self.max_dimension {
            let scaled = image.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3);
            tracing::debug!(
                "Downsampled {}x{} -> {}x{}",
                width,
                height,
                scaled.width(),
                scaled.height()
            );
            (scaled, true)
        } else {
            (image, false)
        };

        let bytes = encode_png(&image)?;
        Ok(PreparedImage {
            bytes,
            width: image.width(),
            height: image.height(),
            resized,
        })
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 128]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut cursor, format).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_small_image_keeps_dimensions_and_becomes_png() {
        let preparer = ImagePreparer::new(1024 * 1024, 64);
        let prepared = preparer.prepare(&encoded(40, 30, ImageFormat::Jpeg)).unwrap();

        assert_eq!((prepared.width, prepared.height), (40, 30));
        assert!(!prepared.resized);
        assert_eq!(image::guess_format(&prepared.bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_large_image_is_downsampled_preserving_aspect() {
        let preparer = ImagePreparer::new(1024 * 1024, 64);
        let prepared = preparer.prepare(&encoded(200, 100, ImageFormat::Png)).unwrap();

        assert!(prepared.resized);
        assert_eq!((prepared.width, prepared.height), (64, 32));

        let decoded = image::load_from_memory(&prepared.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (64, 32));
    }

    #[test]
    fn test_portrait_image_limits_height() {
        let preparer = ImagePreparer::new(1024 * 1024, 50);
        let prepared = preparer.prepare(&encoded(60, 120, ImageFormat::Png)).unwrap();
        assert_eq!(prepared.height, 50);
        assert!(prepared.width <= 50);
    }

    #[test]
    fn test_oversized_upload_is_rejected_before_decoding() {
        let preparer = ImagePreparer::new(16, 64);
        let err = preparer.prepare(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 17, limit: 16 }));
    }

    #[test]
    fn test_garbage_is_invalid_image() {
        let preparer = ImagePreparer::new(1024, 64);
        assert!(matches!(preparer.prepare(b"not an image at all"), Err(Error::InvalidImage(_))));
        assert!(matches!(preparer.prepare(&[]), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_preparation_is_deterministic() {
        let preparer = ImagePreparer::new(1024 * 1024, 32);
        let raw = encoded(100, 80, ImageFormat::Png);
        let a = preparer.prepare(&raw).unwrap();
        let b = preparer.prepare(&raw).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }
}
