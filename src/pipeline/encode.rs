//! Image encoding: `DynamicImage` → base64 `ImageData`, with a size fallback.
//!
//! Pages go to the model as lossless PNG first, since text crispness matters
//! more than bytes. When the whole request would exceed the configured input
//! threshold, [`encode_pages`] walks a compression ladder of progressively
//! smaller JPEG renditions until the payload fits. Every rung re-encodes all
//! pages in their original order, so page `i` of the result is always page `i`
//! of the input and page-relative image references stay valid.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::{debug, warn};

/// One rung of the compression ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStep {
    /// Effective DPI; the render is downscaled by `dpi / render_dpi`.
    pub dpi: u32,
    pub jpeg_quality: u8,
    pub grayscale: bool,
}

/// Tried in order until the payload fits.
pub const COMPRESSION_LADDER: [CompressionStep; 3] = [
    CompressionStep { dpi: 150, jpeg_quality: 60, grayscale: false },
    CompressionStep { dpi: 120, jpeg_quality: 40, grayscale: false },
    CompressionStep { dpi: 100, jpeg_quality: 30, grayscale: true },
];

/// Encoded pages plus what it took to get there.
#[derive(Debug, Clone)]
pub struct EncodedPages {
    /// `(page_number, image)` in input order.
    pub pages: Vec<(usize, ImageData)>,
    /// Total base64 bytes.
    pub bytes: usize,
    /// The ladder rung used, if compression was needed.
    pub step: Option<CompressionStep>,
}

impl EncodedPages {
    pub fn images(&self) -> Vec<ImageData> {
        self.pages.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn fits(&self, threshold: usize) -> bool {
        self.bytes <= threshold
    }
}

/// Encode a rasterised page as a base64 PNG ready for the model.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Raw JPEG bytes at the given quality. Used for the ladder and EPUB assets.
pub fn jpeg_bytes(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    img.to_rgb8().write_with_encoder(encoder)?;
    Ok(buf)
}

fn encode_step(
    img: &DynamicImage,
    step: CompressionStep,
    render_dpi: u32,
) -> Result<ImageData, image::ImageError> {
    let scale = (step.dpi as f64 / render_dpi.max(1) as f64).min(1.0);
    let resized = if scale < 1.0 {
        let w = ((img.width() as f64 * scale).round() as u32).max(1);
        let h = ((img.height() as f64 * scale).round() as u32).max(1);
        img.resize(w, h, FilterType::Triangle)
    } else {
        img.clone()
    };
    let source = if step.grayscale {
        DynamicImage::ImageLuma8(resized.to_luma8())
    } else {
        resized
    };
    let bytes = jpeg_bytes(&source, step.jpeg_quality)?;
    Ok(ImageData::new(STANDARD.encode(&bytes), "image/jpeg").with_detail("high"))
}

fn total_bytes(pages: &[(usize, ImageData)]) -> usize {
    pages.iter().map(|(_, d)| d.data.len()).sum()
}

/// Encode `pages` so the total payload stays under `threshold` where possible.
///
/// Returns the smallest rendition reached even if it is still over the
/// threshold; the caller decides whether that is acceptable. Fails only when
/// an image cannot be encoded at all.
pub fn encode_pages(
    pages: &[(usize, DynamicImage)],
    threshold: usize,
    render_dpi: u32,
) -> Result<EncodedPages, PipelineError> {
    let png = pages
        .iter()
        .map(|(n, img)| {
            encode_page(img)
                .map(|d| (*n, d))
                .map_err(|e| PipelineError::EncodingFailed(format!("page {n}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let bytes = total_bytes(&png);
    if bytes <= threshold {
        return Ok(EncodedPages { pages: png, bytes, step: None });
    }

    warn!(
        bytes,
        threshold,
        pages = pages.len(),
        "input exceeds size threshold, compressing"
    );

    let mut best: Option<EncodedPages> = None;
    for step in COMPRESSION_LADDER {
        let encoded = pages
            .iter()
            .map(|(n, img)| {
                encode_step(img, step, render_dpi)
                    .map(|d| (*n, d))
                    .map_err(|e| PipelineError::EncodingFailed(format!("page {n}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let bytes = total_bytes(&encoded);
        debug!(?step, bytes, "compression step");
        let candidate = EncodedPages { pages: encoded, bytes, step: Some(step) };
        if bytes <= threshold {
            return Ok(candidate);
        }
        best = Some(candidate);
    }

    // The ladder is non-empty, so `best` is always set here.
    let best = best.ok_or_else(|| PipelineError::Internal("empty compression ladder".into()))?;
    warn!(
        bytes = best.bytes,
        threshold,
        "still over threshold after compression, submitting best effort"
    );
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn noisy(w: u32, h: u32, seed: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17) ^ seed).wrapping_mul(2654435761);
            Rgba([(v >> 24) as u8, (v >> 16) as u8, (v >> 8) as u8, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(!decoded.is_empty());
    }

    #[test]
    fn under_threshold_stays_png() {
        let pages = vec![(1, noisy(20, 20, 1)), (2, noisy(20, 20, 2))];
        let out = encode_pages(&pages, usize::MAX, 150).unwrap();
        assert!(out.step.is_none());
        assert!(out.pages.iter().all(|(_, d)| d.mime_type == "image/png"));
    }

    #[test]
    fn over_threshold_compresses_and_keeps_page_order() {
        let pages = vec![(3, noisy(300, 300, 1)), (4, noisy(300, 300, 2)), (5, noisy(300, 300, 3))];
        let png = encode_pages(&pages, usize::MAX, 300).unwrap();
        let out = encode_pages(&pages, png.bytes / 2, 300).unwrap();
        assert!(out.step.is_some());
        assert!(out.bytes < png.bytes);
        let order: Vec<usize> = out.pages.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![3, 4, 5]);
        assert!(out.pages.iter().all(|(_, d)| d.mime_type == "image/jpeg"));
    }

    #[test]
    fn impossible_threshold_returns_smallest_rung() {
        let pages = vec![(1, noisy(100, 100, 9))];
        let out = encode_pages(&pages, 1, 300).unwrap();
        assert_eq!(out.step, Some(COMPRESSION_LADDER[2]));
        assert!(!out.fits(1));
    }

    #[test]
    fn jpeg_bytes_have_jpeg_magic() {
        let bytes = jpeg_bytes(&noisy(8, 8, 0), 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
