//! Centralized page-image encoding.
//!
//! Single point for format conversion, quality settings, and thumbnail
//! generation. The storage and OCR stages both encode through here but do
//! so independently; encoded bytes are never shared between stages.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default thumbnail width for search-result previews.
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 400;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Output format for stored page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageImageFormat {
    Png,
    #[default]
    Jpeg,
    Webp,
}

impl PageImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

/// Encoded image bytes plus the metadata downstream consumers need.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub format: PageImageFormat,
    pub content_type: String,
    pub byte_size: usize,
    pub width: u32,
    pub height: u32,
}

/// Encodes page images into the configured format with quality settings.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    format: PageImageFormat,
    quality: u8,
    thumbnail_width: Option<u32>,
}

impl ImageEncoder {
    pub fn new(format: PageImageFormat, quality: u8, thumbnail_width: Option<u32>) -> Self {
        Self {
            format,
            quality: quality.clamp(1, 100),
            thumbnail_width,
        }
    }

    pub fn format(&self) -> PageImageFormat {
        self.format
    }

    /// Encode one image into the configured format.
    pub fn encode(&self, image: &DynamicImage) -> Result<EncodedImage, EncodeError> {
        let mut buffer = Cursor::new(Vec::new());

        match self.format {
            PageImageFormat::Png => {
                image.write_to(&mut buffer, ImageFormat::Png)?;
            }
            PageImageFormat::Jpeg => {
                // JPEG has no alpha channel; composite transparent sources
                // against white before encoding.
                let rgb = if image.color().has_alpha() {
                    flatten_onto_white(image)
                } else {
                    image.to_rgb8()
                };
                let encoder = JpegEncoder::new_with_quality(&mut buffer, self.quality);
                rgb.write_with_encoder(encoder)?;
            }
            PageImageFormat::Webp => {
                // The webp encoder here is lossless; quality does not apply.
                let encoder = WebPEncoder::new_lossless(&mut buffer);
                image.to_rgba8().write_with_encoder(encoder)?;
            }
        }

        let data = buffer.into_inner();
        let byte_size = data.len();
        Ok(EncodedImage {
            data,
            format: self.format,
            content_type: self.format.content_type().to_string(),
            byte_size,
            width: image.width(),
            height: image.height(),
        })
    }

    /// Encode a batch in page order.
    pub fn encode_batch(&self, images: &[DynamicImage]) -> Result<Vec<EncodedImage>, EncodeError> {
        images.iter().map(|img| self.encode(img)).collect()
    }

    /// Encode an image together with its thumbnail (when configured).
    ///
    /// Images already narrower than the thumbnail width are re-encoded
    /// unscaled so the thumbnail URL is always usable.
    pub fn encode_with_thumbnail(
        &self,
        image: &DynamicImage,
    ) -> Result<(EncodedImage, Option<EncodedImage>), EncodeError> {
        let full = self.encode(image)?;

        let thumbnail = match self.thumbnail_width {
            Some(max_width) if image.width() > max_width => {
                let ratio = max_width as f64 / image.width() as f64;
                let height = (image.height() as f64 * ratio).round().max(1.0) as u32;
                let resized = image.resize_exact(max_width, height, FilterType::Lanczos3);
                Some(self.encode(&resized)?)
            }
            Some(_) => Some(full.clone()),
            None => None,
        };

        Ok((full, thumbnail))
    }
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        rgb.put_pixel(x, y, image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::new_rgb8(width, height)
    }

    #[test]
    fn test_encode_preserves_dimensions() {
        let encoder = ImageEncoder::new(PageImageFormat::Png, 75, None);
        let encoded = encoder.encode(&test_image(120, 160)).unwrap();
        assert_eq!(encoded.width, 120);
        assert_eq!(encoded.height, 160);
        assert_eq!(encoded.content_type, "image/png");
        assert_eq!(encoded.byte_size, encoded.data.len());
        assert!(!encoded.data.is_empty());
    }

    #[test]
    fn test_jpeg_flattens_alpha() {
        let encoder = ImageEncoder::new(PageImageFormat::Jpeg, 80, None);
        let rgba = DynamicImage::new_rgba8(32, 32);
        let encoded = encoder.encode(&rgba).unwrap();
        assert_eq!(encoded.content_type, "image/jpeg");
        // Decodes back to the same dimensions.
        let decoded = image::load_from_memory(&encoded.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn test_thumbnail_proportional_resize() {
        let encoder = ImageEncoder::new(PageImageFormat::Png, 75, Some(50));
        let (full, thumb) = encoder.encode_with_thumbnail(&test_image(200, 100)).unwrap();
        let thumb = thumb.unwrap();
        assert_eq!(full.width, 200);
        assert_eq!(thumb.width, 50);
        assert_eq!(thumb.height, 25);
    }

    #[test]
    fn test_thumbnail_skips_upscale() {
        let encoder = ImageEncoder::new(PageImageFormat::Png, 75, Some(400));
        let (_, thumb) = encoder.encode_with_thumbnail(&test_image(100, 80)).unwrap();
        assert_eq!(thumb.unwrap().width, 100);
    }

    #[test]
    fn test_no_thumbnail_when_unconfigured() {
        let encoder = ImageEncoder::new(PageImageFormat::Jpeg, 75, None);
        let (_, thumb) = encoder.encode_with_thumbnail(&test_image(100, 80)).unwrap();
        assert!(thumb.is_none());
    }

    #[test]
    fn test_format_metadata() {
        assert_eq!(PageImageFormat::Jpeg.extension(), "jpg");
        assert_eq!(PageImageFormat::Webp.content_type(), "image/webp");
    }
}
