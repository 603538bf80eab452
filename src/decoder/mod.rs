//! Document decoding
//!
//! A decoder opens untrusted document bytes and rasterizes page 1 only.
//! Later pages are never touched, so memory use does not grow with the
//! length of the document.

#[cfg(feature = "mupdf")]
mod mupdf_decoder;

#[cfg(feature = "mupdf")]
pub use self::mupdf_decoder::MupdfDecoder;

use crate::error::ConversionError;

/// Decoded page bitmap
pub type Bitmap = image::RgbaImage;

/// Limits applied while decoding
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Largest bitmap (width * height) the decoder may allocate
    pub max_bitmap_pixels: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_bitmap_pixels: 25_000_000,
        }
    }
}

/// Rasterizes the first page of a document
pub trait DocumentDecoder: Send + Sync {
    /// Decode page 1 of `data` at `scale` (1.0 = 72 dpi)
    fn decode_first_page(
        &self,
        data: &[u8],
        scale: f32,
        limits: &DecodeLimits,
    ) -> Result<Bitmap, ConversionError>;
}

/// Check for a PDF header in the first KiB (some producers prepend junk)
pub fn looks_like_pdf(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    head.windows(5).any(|w| w == b"%PDF-")
}

/// Refuse bitmaps over the pixel budget before allocating them
pub fn check_bitmap_budget(
    width: u32,
    height: u32,
    limits: &DecodeLimits,
) -> Result<(), ConversionError> {
    if width == 0 || height == 0 {
        return Err(ConversionError::Decode(format!(
            "Page has empty bounds ({}x{})",
            width, height
        )));
    }
    if u64::from(width) * u64::from(height) > limits.max_bitmap_pixels {
        return Err(ConversionError::BitmapTooLarge {
            width,
            height,
            limit: limits.max_bitmap_pixels,
        });
    }
    Ok(())
}

/// Minimal one-page PDF used for warmup and smoke tests
pub const MINIMAL_PDF: &[u8] = b"%PDF-1.4
1 0 obj
<< /Type /Catalog /Pages 2 0 R >>
endobj
2 0 obj
<< /Type /Pages /Kids [3 0 R] /Count 1 >>
endobj
3 0 obj
<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << >> >>
endobj
4 0 obj
<< /Length 0 >>
stream
endstream
endobj
xref
0 5
0000000000 65535 f
0000000009 00000 n
0000000058 00000 n
0000000115 00000 n
0000000226 00000 n
trailer
<< /Size 5 /Root 1 0 R >>
startxref
276
%%EOF";

#[cfg(test)]
pub(crate) mod testing {
    //! Decoders with scripted behaviour for pipeline tests

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    /// Returns a solid page after an optional delay, counting calls
    pub struct FakeDecoder {
        pub width: u32,
        pub height: u32,
        pub delay: Duration,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeDecoder {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(612, 792)
            }
        }

        pub fn calls(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    impl DocumentDecoder for FakeDecoder {
        fn decode_first_page(
            &self,
            _data: &[u8],
            scale: f32,
            limits: &DecodeLimits,
        ) -> Result<Bitmap, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let width = (self.width as f32 * scale).round() as u32;
            let height = (self.height as f32 * scale).round() as u32;
            check_bitmap_budget(width, height, limits)?;
            Ok(Bitmap::from_pixel(width, height, image::Rgba([240, 240, 240, 255])))
        }
    }

    /// Always fails with the given message
    pub struct FailingDecoder(pub &'static str);

    impl DocumentDecoder for FailingDecoder {
        fn decode_first_page(
            &self,
            _data: &[u8],
            _scale: f32,
            _limits: &DecodeLimits,
        ) -> Result<Bitmap, ConversionError> {
            Err(ConversionError::Decode(self.0.to_string()))
        }
    }

    /// Panics inside the decoder
    pub struct PanickingDecoder;

    impl DocumentDecoder for PanickingDecoder {
        fn decode_first_page(
            &self,
            _data: &[u8],
            _scale: f32,
            _limits: &DecodeLimits,
        ) -> Result<Bitmap, ConversionError> {
            panic!("xref table is corrupt")
        }
    }
}
