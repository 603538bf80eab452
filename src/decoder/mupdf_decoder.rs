//! MuPDF page-1 decoder
//!
//! Opens the document from bytes, loads page 0 and renders it to an RGB
//! pixmap. The document, page and pixmap are owned by this call and are
//! dropped on every exit path, including early returns on error.

use mupdf::{Colorspace, Document, Matrix};

use super::{check_bitmap_budget, looks_like_pdf, Bitmap, DecodeLimits, DocumentDecoder};
use crate::error::ConversionError;

const PDF_MIME: &str = "application/pdf";

/// Decoder backed by MuPDF
#[derive(Debug, Clone, Copy, Default)]
pub struct MupdfDecoder;

impl MupdfDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentDecoder for MupdfDecoder {
    fn decode_first_page(
        &self,
        data: &[u8],
        scale: f32,
        limits: &DecodeLimits,
    ) -> Result<Bitmap, ConversionError> {
        if !looks_like_pdf(data) {
            return Err(ConversionError::UnsupportedFormat(
                "missing %PDF- header".to_string(),
            ));
        }

        let doc = Document::from_bytes(data, PDF_MIME)?;
        if doc.page_count()? < 1 {
            return Err(ConversionError::EmptyDocument);
        }

        let page = doc.load_page(0)?;
        let bounds = page.bounds()?;
        let scale = scale.clamp(0.1, 4.0);

        // Check the budget against the scaled page box before MuPDF allocates
        let width = ((bounds.x1 - bounds.x0) * scale).ceil().max(0.0) as u32;
        let height = ((bounds.y1 - bounds.y0) * scale).ceil().max(0.0) as u32;
        check_bitmap_budget(width, height, limits)?;

        let matrix = Matrix::new_scale(scale, scale);
        let colorspace = Colorspace::device_rgb();
        let pixmap = page.to_pixmap(&matrix, &colorspace, false, false)?;

        pixmap_to_bitmap(&pixmap)
    }
}

fn pixmap_to_bitmap(pixmap: &mupdf::Pixmap) -> Result<Bitmap, ConversionError> {
    samples_to_bitmap(
        pixmap.width() as u32,
        pixmap.height() as u32,
        pixmap.n() as usize,
        pixmap.samples(),
    )
}

/// Widen packed samples (RGB, optionally with extra channels) to an opaque
/// RGBA bitmap. Anything past the third component is dropped.
fn samples_to_bitmap(
    width: u32,
    height: u32,
    components: usize,
    samples: &[u8],
) -> Result<Bitmap, ConversionError> {
    let pixels = width as usize * height as usize;
    if components < 3 || samples.len() < pixels * components {
        return Err(ConversionError::Decode(format!(
            "pixmap holds {} samples, {}x{} with {} components needs {}",
            samples.len(),
            width,
            height,
            components,
            pixels * components
        )));
    }

    let mut rgba = Vec::with_capacity(pixels * 4);
    for px in samples.chunks_exact(components).take(pixels) {
        rgba.extend_from_slice(&[px[0], px[1], px[2], u8::MAX]);
    }

    Bitmap::from_raw(width, height, rgba)
        .ok_or_else(|| ConversionError::Decode("bitmap buffer size mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MINIMAL_PDF;

    #[test]
    fn test_rejects_non_pdf() {
        let err = MupdfDecoder::new()
            .decode_first_page(b"GIF89a", 1.0, &DecodeLimits::default())
            .unwrap_err();
        assert!(matches!(err, ConversionError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_decodes_minimal_pdf() {
        let bitmap = MupdfDecoder::new()
            .decode_first_page(MINIMAL_PDF, 0.5, &DecodeLimits::default())
            .unwrap();
        assert_eq!(bitmap.width(), 306);
        assert_eq!(bitmap.height(), 396);
    }

    #[test]
    fn test_samples_widen_to_opaque_rgba() {
        let rgb = [10, 20, 30, 40, 50, 60];
        let bitmap = samples_to_bitmap(2, 1, 3, &rgb).unwrap();
        assert_eq!(bitmap.get_pixel(1, 0).0, [40, 50, 60, 255]);

        let rgba = [1, 2, 3, 0, 4, 5, 6, 0];
        let bitmap = samples_to_bitmap(2, 1, 4, &rgba).unwrap();
        assert_eq!(bitmap.get_pixel(0, 0).0, [1, 2, 3, 255]);
    }

    #[test]
    fn test_short_samples_rejected() {
        let err = samples_to_bitmap(2, 2, 3, &[0u8; 9]).unwrap_err();
        assert!(matches!(err, ConversionError::Decode(_)));
        assert!(samples_to_bitmap(1, 1, 1, &[0u8]).is_err());
    }

    #[test]
    fn test_budget_applies_before_render() {
        let limits = DecodeLimits {
            max_bitmap_pixels: 100,
        };
        let err = MupdfDecoder::new()
            .decode_first_page(MINIMAL_PDF, 1.0, &limits)
            .unwrap_err();
        assert!(matches!(err, ConversionError::BitmapTooLarge { .. }));
    }
}
