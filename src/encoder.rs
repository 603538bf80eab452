//! Preview encoding
//!
//! Shrinks a decoded page to fit the preview box and compresses it as a
//! progressive JPEG. The full-size bitmap is consumed and dropped as soon as
//! the resized copy exists, so only one large buffer is alive at a time.

use image::imageops::FilterType;
use image::DynamicImage;
use jpeg_encoder::{ColorType, Encoder};

use crate::config::WorkerConfig;
use crate::decoder::Bitmap;
use crate::error::ConversionError;
use crate::protocol::PREVIEW_MIME_TYPE;

/// Encoded preview and its final dimensions
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
}

/// Resizes and compresses bitmaps into previews
#[derive(Debug, Clone, Copy)]
pub struct ImageEncoder {
    max_width: u32,
    max_height: u32,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(800, 1200)
    }
}

impl ImageEncoder {
    /// Box sides are clamped to `1..=65535`, the JPEG frame limit.
    pub fn new(max_width: u32, max_height: u32) -> Self {
        let limit = u16::MAX as u32;
        Self {
            max_width: max_width.clamp(1, limit),
            max_height: max_height.clamp(1, limit),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.max_width, config.max_height)
    }

    /// Aspect-preserving fit inside the preview box. Never upscales.
    pub fn fit_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if width <= self.max_width && height <= self.max_height {
            return (width, height);
        }
        let scale = f64::min(
            self.max_width as f64 / width as f64,
            self.max_height as f64 / height as f64,
        );
        let fitted_width = ((width as f64 * scale).round() as u32).clamp(1, self.max_width);
        let fitted_height = ((height as f64 * scale).round() as u32).clamp(1, self.max_height);
        (fitted_width, fitted_height)
    }

    /// Resize `bitmap` to fit and encode at `quality` (1-100)
    pub fn encode(&self, bitmap: Bitmap, quality: u8) -> Result<EncodedImage, ConversionError> {
        let (width, height) = self.fit_dimensions(bitmap.width(), bitmap.height());

        let resized = if (width, height) == bitmap.dimensions() {
            bitmap
        } else {
            let resized = image::imageops::resize(&bitmap, width, height, FilterType::Triangle);
            drop(bitmap);
            resized
        };

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgba8(resized).into_rgb8();

        let mut data = Vec::new();
        let mut jpeg = Encoder::new(&mut data, quality.clamp(1, 100));
        jpeg.set_progressive(true);
        // Fitted sides never exceed the clamped box
        jpeg.encode(rgb.as_raw(), width as u16, height as u16, ColorType::Rgb)?;

        Ok(EncodedImage {
            data,
            width,
            height,
            mime_type: PREVIEW_MIME_TYPE,
        })
    }
}
