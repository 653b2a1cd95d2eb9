//! PDF page access: rasterise pages and pull embedded images via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## Why cap pixels, not DPI?
//!
//! Page sizes vary wildly: an A0 poster at 150 DPI would produce a
//! 12,000 × 17,000 px image. `max_rendered_pixels` caps the longest edge
//! regardless of physical size, keeping memory bounded.
//!
//! Stages only see the [`PageSource`] trait, so tests run without pdfium.

use crate::error::PipelineError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Embedded images smaller than this on either edge are decoration.
pub const MIN_IMAGE_EDGE: u32 = 100;

/// Read-only access to the pages of one document. Page numbers are 1-based.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page_count(&self) -> Result<usize, PipelineError>;

    /// Render `pages` in the order given. Out-of-range pages are skipped.
    async fn render(&self, pages: &[usize]) -> Result<Vec<(usize, DynamicImage)>, PipelineError>;

    /// Embedded raster images of `page` at least [`MIN_IMAGE_EDGE`] on both
    /// edges, largest first.
    async fn extract_images(&self, page: usize) -> Result<Vec<DynamicImage>, PipelineError>;
}

/// [`PageSource`] over a PDF file on disk.
#[derive(Debug, Clone)]
pub struct PdfiumPageSource {
    path: PathBuf,
    max_pixels: u32,
}

impl PdfiumPageSource {
    pub fn new(path: impl Into<PathBuf>, max_pixels: u32) -> Self {
        Self {
            path: path.into(),
            max_pixels,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, u32) -> Result<T, PipelineError> + Send + 'static,
    {
        let path = self.path.clone();
        let max_pixels = self.max_pixels;
        tokio::task::spawn_blocking(move || f(&path, max_pixels))
            .await
            .map_err(|e| PipelineError::Internal(format!("{what} task panicked: {e}")))?
    }
}

#[async_trait]
impl PageSource for PdfiumPageSource {
    async fn page_count(&self) -> Result<usize, PipelineError> {
        self.blocking("Page count", |path, _| {
            let pdfium = bind()?;
            let document = open(&pdfium, path)?;
            Ok(document.pages().len() as usize)
        })
        .await
    }

    async fn render(&self, pages: &[usize]) -> Result<Vec<(usize, DynamicImage)>, PipelineError> {
        let pages = pages.to_vec();
        self.blocking("Render", move |path, max_pixels| {
            render_pages_blocking(path, max_pixels, &pages)
        })
        .await
    }

    async fn extract_images(&self, page: usize) -> Result<Vec<DynamicImage>, PipelineError> {
        self.blocking("Image extraction", move |path, _| {
            extract_images_blocking(path, page)
        })
        .await
    }
}

fn bind() -> Result<Pdfium, PipelineError> {
    pdfium_auto::bind_pdfium_silent()
        .map_err(|e| PipelineError::PdfiumBindingFailed(e.to_string()))
}

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, PipelineError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    pdf_path: &Path,
    max_pixels: u32,
    page_numbers: &[usize],
) -> Result<Vec<(usize, DynamicImage)>, PipelineError> {
    let pdfium = bind()?;
    let document = open(&pdfium, pdf_path)?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages, rendering {}", total_pages, page_numbers.len());

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(page_numbers.len());

    for &num in page_numbers {
        if num == 0 || num > total_pages {
            warn!("Skipping page {} (out of range, total={})", num, total_pages);
            continue;
        }

        let page = pages
            .get((num - 1) as u16)
            .map_err(|e| PipelineError::RasterisationFailed {
                page: num,
                detail: format!("{:?}", e),
            })?;

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            PipelineError::RasterisationFailed {
                page: num,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!("Rendered page {} → {}x{} px", num, image.width(), image.height());

        results.push((num, image));
    }

    Ok(results)
}

/// Blocking implementation of embedded image extraction.
fn extract_images_blocking(pdf_path: &Path, page_number: usize) -> Result<Vec<DynamicImage>, PipelineError> {
    let pdfium = bind()?;
    let document = open(&pdfium, pdf_path)?;
    let pages = document.pages();
    if page_number == 0 || page_number > pages.len() as usize {
        return Ok(Vec::new());
    }

    let page = pages
        .get((page_number - 1) as u16)
        .map_err(|e| PipelineError::RasterisationFailed {
            page: page_number,
            detail: format!("{:?}", e),
        })?;

    let mut images: Vec<DynamicImage> = page
        .objects()
        .iter()
        .filter_map(|object| {
            let image_object = object.as_image_object()?;
            match image_object.get_raw_image() {
                Ok(img) => Some(img),
                Err(e) => {
                    debug!("Page {}: unreadable image object: {:?}", page_number, e);
                    None
                }
            }
        })
        .filter(|img| img.width() >= MIN_IMAGE_EDGE && img.height() >= MIN_IMAGE_EDGE)
        .collect();

    sort_largest_first(&mut images);
    debug!("Page {}: {} usable embedded images", page_number, images.len());
    Ok(images)
}

pub(crate) fn sort_largest_first(images: &mut [DynamicImage]) {
    images.sort_by_key(|img| std::cmp::Reverse(img.width() as u64 * img.height() as u64));
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn largest_image_sorts_first() {
        let mut imgs = vec![
            DynamicImage::ImageRgb8(RgbImage::new(120, 120)),
            DynamicImage::ImageRgb8(RgbImage::new(400, 300)),
            DynamicImage::ImageRgb8(RgbImage::new(200, 200)),
        ];
        sort_largest_first(&mut imgs);
        let widths: Vec<u32> = imgs.iter().map(|i| i.width()).collect();
        assert_eq!(widths, vec![400, 200, 120]);
    }
}
