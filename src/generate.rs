//! Generation stage: structure artifact in, packaged EPUB out.
//!
//! ## Units
//!
//! | unit        | artifact                       | model call |
//! |-------------|--------------------------------|------------|
//! | `scaffold`  | `epub/META-INF/container.xml`  | no         |
//! | `cover`     | `epub/titlepage.xhtml`         | no         |
//! | `toc`       | `epub/text/toc.html`           | when the book has TOC pages |
//! | `chapter_N` | `epub/text/chapter_N.html`     | yes        |
//! | `package`   | `<title>.epub`                 | no         |
//!
//! Chapters are independent and run `concurrency` at a time. A chapter that
//! exhausts its retries is marked failed and the others carry on. `package`
//! runs only once every other unit is done, so a partial book is never
//! shipped.

use crate::epub::{
    self, archive, BookMeta, NavEntry, COVER_FILE, IMAGES_DIR, NCX_FILE, OPF_FILE,
    STYLESHEET_HREF, TEXT_DIR, TITLEPAGE_FILE, TOC_HTML_FILE,
};
use crate::error::{PipelineError, UnitError};
use crate::job::{Job, UnitOutcome};
use crate::ledger::{Ledger, SharedLedger, Stage};
use crate::output::StageReport;
use crate::persist::{is_non_empty_file, write_atomic};
use crate::pipeline::encode::{encode_pages, jpeg_bytes};
use crate::pipeline::llm::ModelRequest;
use crate::pipeline::markup::{
    clean_html_response, ensure_parseable, find_placeholders, image_tag, replace_placeholders,
    to_xhtml_document, Placeholder,
};
use crate::pipeline::render::PageSource;
use crate::prompts;
use crate::structure::{DocumentStructure, PageRange, Section};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SCAFFOLD_UNIT: &str = "scaffold";
pub const COVER_UNIT: &str = "cover";
pub const TOC_UNIT: &str = "toc";
pub const PACKAGE_UNIT: &str = "package";

const BOOK_ID_KEY: &str = "book_id";
const COVER_QUALITY: u8 = 90;
const FIGURE_QUALITY: u8 = 85;

/// Ledger ids of every unit before `package`, in execution order.
pub fn unit_ids(structure: &DocumentStructure) -> Vec<String> {
    let mut ids = vec![
        SCAFFOLD_UNIT.to_string(),
        COVER_UNIT.to_string(),
        TOC_UNIT.to_string(),
    ];
    ids.extend(structure.sections.iter().map(|s| s.id.clone()));
    ids
}

/// Chapter navigation entries, in reading order.
pub fn chapter_entries(structure: &DocumentStructure) -> Vec<NavEntry> {
    structure
        .sections
        .iter()
        .map(|s| NavEntry {
            id: s.id.clone(),
            title: s.title.clone(),
            href: format!("{TEXT_DIR}/{}", s.file_name()),
        })
        .collect()
}

/// Run the generation stage.
pub async fn generate(
    job: &Job,
    pages: &dyn PageSource,
    structure: &DocumentStructure,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let ledger = SharedLedger::new(
        Ledger::load(job.paths.ledger(Stage::Generate), Stage::Generate).await?,
    );
    if ledger.metadata(BOOK_ID_KEY).await.is_none() {
        ledger
            .set_metadata(BOOK_ID_KEY, format!("urn:uuid:{}", Uuid::new_v4()))
            .await?;
    }

    let ids = unit_ids(structure);
    job.observer.on_stage_start(Stage::Generate, ids.len() + 1);
    let mut report = StageReport::new(Stage::Generate);

    let result = job
        .run_unit(&ledger, SCAFFOLD_UNIT, || write_scaffold(job))
        .await?;
    report.record(SCAFFOLD_UNIT, result);

    let result = job
        .run_unit(&ledger, COVER_UNIT, || build_cover(job, pages, structure))
        .await?;
    report.record(COVER_UNIT, result);

    let result = job
        .run_unit(&ledger, TOC_UNIT, || build_toc(job, pages, structure))
        .await?;
    report.record(TOC_UNIT, result);

    let concurrency = job.config.concurrency.max(1);
    let ledger_ref = &ledger;
    let mut results: Vec<(usize, Result<_, PipelineError>)> =
        stream::iter(structure.sections.iter().enumerate())
            .map(|(i, section)| async move {
                let result = job
                    .run_unit(ledger_ref, &section.id, || {
                        generate_chapter(job, pages, structure, section)
                    })
                    .await;
                (i, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
    results.sort_by_key(|(i, _)| *i);
    for (i, result) in results {
        report.record(&structure.sections[i].id, result?);
    }

    let pending: Vec<String> = ledger
        .read(|l| ids.iter().filter(|id| !l.is_done(id)).cloned().collect())
        .await;
    if pending.is_empty() {
        if !report.completed.is_empty() && ledger.invalidate(PACKAGE_UNIT).await? {
            info!("Units changed since the last package, repackaging");
        }
        let result = job
            .run_unit(&ledger, PACKAGE_UNIT, || package(job, &ledger, structure))
            .await?;
        report.record(PACKAGE_UNIT, result);
    } else {
        warn!(
            "Not packaging: {} unit(s) not done ({})",
            pending.len(),
            pending.join(", ")
        );
    }

    if ledger.read(|l| l.is_done(PACKAGE_UNIT)).await {
        report.artifact = Some(job.paths.epub_file(&job.config.title));
    }
    report.duration_ms = started.elapsed().as_millis() as u64;
    info!("{}", report.summary());
    job.observer.on_stage_complete(&report);
    Ok(report)
}

async fn write_scaffold(job: &Job) -> Result<UnitOutcome, PipelineError> {
    let book_dir = job.paths.epub_dir();
    epub::write_scaffold(&book_dir).await?;
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&book_dir.join(epub::CONTAINER_FILE)),
        extra: [epub::MIMETYPE_FILE, epub::STYLESHEET_FILE]
            .iter()
            .map(|f| job.paths.relative(&book_dir.join(f)))
            .collect(),
        attempts: 1,
    })
}

/// Cover image: the largest embedded image on the cover page, else a render
/// of the whole page.
async fn cover_image(
    pages: &dyn PageSource,
    page: usize,
) -> Result<Option<DynamicImage>, PipelineError> {
    let mut embedded = pages.extract_images(page).await?;
    if !embedded.is_empty() {
        return Ok(Some(embedded.swap_remove(0)));
    }
    debug!("No embedded image on cover page {}, rendering it", page);
    Ok(pages.render(&[page]).await?.into_iter().next().map(|(_, img)| img))
}

async fn build_cover(
    job: &Job,
    pages: &dyn PageSource,
    structure: &DocumentStructure,
) -> Result<UnitOutcome, PipelineError> {
    let book_dir = job.paths.epub_dir();
    let page = structure.cover_page.unwrap_or(1);
    let image = match cover_image(pages, page).await {
        Ok(img) => img,
        Err(e) => return UnitOutcome::contain(e),
    };

    let mut extra = Vec::new();
    let dims = match image {
        Some(img) => {
            let bytes = match jpeg_bytes(&img, COVER_QUALITY) {
                Ok(b) => b,
                Err(e) => return UnitOutcome::contain(PipelineError::EncodingFailed(e.to_string())),
            };
            let cover = book_dir.join(COVER_FILE);
            write_atomic(&cover, &bytes).await?;
            extra.push(job.paths.relative(&cover));
            info!("Cover from page {}: {}x{}", page, img.width(), img.height());
            Some((img.width(), img.height()))
        }
        None => {
            warn!("No cover image available, title page will show the title only");
            None
        }
    };

    let titlepage = book_dir.join(TITLEPAGE_FILE);
    write_atomic(
        &titlepage,
        epub::titlepage_xhtml(&job.config.title, dims).as_bytes(),
    )
    .await?;
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&titlepage),
        extra,
        attempts: 1,
    })
}

fn page_labels(pages: &[(usize, edgequake_llm::ImageData)]) -> String {
    pages
        .iter()
        .enumerate()
        .map(|(i, (n, _))| format!("Image {} = PDF page {}", i + 1, n))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_markup(raw: &str) -> Result<String, UnitError> {
    let html = clean_html_response(raw)?;
    ensure_parseable(&html)?;
    Ok(html)
}

async fn build_toc(
    job: &Job,
    pages: &dyn PageSource,
    structure: &DocumentStructure,
) -> Result<UnitOutcome, PipelineError> {
    let path = job.paths.epub_dir().join(TOC_HTML_FILE);
    let artifact = job.paths.relative(&path);
    let title = &job.config.title;

    let Some(range) = structure.toc_pages else {
        info!("No table-of-contents pages, building the contents page from the outline");
        let html = epub::outline_toc_html(title, &chapter_entries(structure));
        write_atomic(&path, html.as_bytes()).await?;
        return Ok(UnitOutcome::Done {
            artifact,
            extra: Vec::new(),
            attempts: 1,
        });
    };

    let numbers: Vec<usize> = range.pages().collect();
    let rendered = match pages.render(&numbers).await {
        Ok(r) => r,
        Err(e) => return UnitOutcome::contain(e),
    };
    let encoded = match encode_pages(
        &rendered,
        job.config.input_size_threshold_bytes,
        job.config.dpi,
    ) {
        Ok(e) => e,
        Err(e) => return UnitOutcome::contain(e),
    };

    let request = ModelRequest::new(
        format!("generate/{TOC_UNIT}"),
        prompts::toc_prompt(title, &structure.sections),
    )
    .content(format!(
        "Table of contents, PDF pages {} to {}:\n{}",
        range.start,
        range.end,
        page_labels(&encoded.pages)
    ))
    .images(encoded.images())
    .sampling(job.config.temperature, job.config.max_tokens);

    let result = job
        .call_model(&request, |r| parse_markup(&r.content))
        .await;
    match result {
        Ok(done) => {
            let doc = to_xhtml_document(title, &done.value, STYLESHEET_HREF);
            write_atomic(&path, doc.as_bytes()).await?;
            Ok(UnitOutcome::Done {
                artifact,
                extra: Vec::new(),
                attempts: done.attempts,
            })
        }
        Err(failure) => Ok(UnitOutcome::Failed {
            attempts: failure.attempts(),
            error: failure.into_error(),
        }),
    }
}

async fn generate_chapter(
    job: &Job,
    pages: &dyn PageSource,
    structure: &DocumentStructure,
    section: &Section,
) -> Result<UnitOutcome, PipelineError> {
    let slice = section
        .pages
        .widened(job.config.page_buffer, structure.page_count);
    let numbers: Vec<usize> = slice.pages().collect();
    let rendered = match pages.render(&numbers).await {
        Ok(r) => r,
        Err(e) => return UnitOutcome::contain(e),
    };
    let encoded = match encode_pages(
        &rendered,
        job.config.input_size_threshold_bytes,
        job.config.dpi,
    ) {
        Ok(e) => e,
        Err(e) => return UnitOutcome::contain(e),
    };

    let title = &job.config.title;
    let request = ModelRequest::new(
        format!("generate/{}", section.id),
        prompts::chapter_prompt(title, section, slice),
    )
    .content(format!(
        "Chapter \"{}\" is on PDF pages {} to {}. The attached images are labelled as follows:\n{}",
        section.title,
        section.pages.start,
        section.pages.end,
        page_labels(&encoded.pages)
    ))
    .images(encoded.images())
    .sampling(job.config.temperature, job.config.max_tokens);

    let generated = match job.call_model(&request, |r| parse_markup(&r.content)).await {
        Ok(g) => g,
        Err(failure) => {
            return Ok(UnitOutcome::Failed {
                attempts: failure.attempts(),
                error: failure.into_error(),
            })
        }
    };

    let (html, figures) = match insert_images(job, pages, section, slice, &generated.value).await {
        Ok(h) => h,
        Err(e) => return UnitOutcome::contain(e),
    };
    let path = job.paths.epub_dir().join(TEXT_DIR).join(section.file_name());
    let doc = to_xhtml_document(&section.title, &html, STYLESHEET_HREF);
    write_atomic(&path, doc.as_bytes()).await?;
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&path),
        extra: figures.iter().map(|f| job.paths.relative(f)).collect(),
        attempts: generated.attempts,
    })
}

/// Replace image placeholders with figures extracted from the pages they
/// point at. The n-th placeholder on a page gets that page's n-th largest
/// image; placeholders without a usable image stay as they are.
///
/// Returns the markup and the image files written.
async fn insert_images(
    job: &Job,
    pages: &dyn PageSource,
    section: &Section,
    slice: PageRange,
    html: &str,
) -> Result<(String, Vec<PathBuf>), PipelineError> {
    let placeholders = find_placeholders(html);
    if placeholders.is_empty() {
        return Ok((html.to_string(), Vec::new()));
    }

    let images_dir = job.paths.epub_dir().join(IMAGES_DIR);
    let mut extracted: HashMap<usize, Vec<DynamicImage>> = HashMap::new();
    let mut taken: HashMap<usize, usize> = HashMap::new();
    let mut figures: Vec<Option<String>> = Vec::with_capacity(placeholders.len());
    let mut written = Vec::new();

    let targets = placeholder_pages(&placeholders, section, slice);
    for (placeholder, target) in placeholders.iter().zip(targets) {
        let Some(page) = target else {
            debug!("{}: placeholder without a usable page: {:?}", section.id, placeholder);
            figures.push(None);
            continue;
        };
        if !extracted.contains_key(&page) {
            let images = pages.extract_images(page).await.unwrap_or_else(|e| {
                warn!("{}: image extraction failed on page {}: {}", section.id, page, e);
                Vec::new()
            });
            extracted.insert(page, images);
        }

        let nth = taken.entry(page).or_insert(0);
        let bytes = match extracted.get(&page).and_then(|imgs| imgs.get(*nth)) {
            Some(img) => jpeg_bytes(img, FIGURE_QUALITY)
                .map_err(|e| PipelineError::EncodingFailed(format!("page {page}: {e}")))?,
            None => {
                figures.push(None);
                continue;
            }
        };
        *nth += 1;
        let name = format!("{}_img_{}.jpg", section.id, written.len() + 1);
        let file = images_dir.join(&name);
        write_atomic(&file, &bytes).await?;
        written.push(file);
        figures.push(Some(image_tag(
            &format!("../{IMAGES_DIR}/{name}"),
            &placeholder.description,
        )));
    }

    let mut figures = figures.into_iter();
    let (out, replaced) = replace_placeholders(html, |_| figures.next().flatten());
    info!(
        "{}: {} of {} image placeholder(s) filled",
        section.id,
        replaced,
        placeholders.len()
    );
    Ok((out, written))
}

/// Absolute page for each placeholder.
///
/// A placeholder whose own page is missing or outside the slice takes the
/// next image page the outline reported for this section.
fn placeholder_pages(
    placeholders: &[Placeholder],
    section: &Section,
    slice: PageRange,
) -> Vec<Option<usize>> {
    let mut reported = section.image_refs.iter().copied().filter(|p| slice.contains(*p));
    placeholders
        .iter()
        .map(|placeholder| {
            placeholder
                .page
                .map(|rel| slice.start + rel)
                .filter(|p| slice.contains(*p))
                .or_else(|| reported.next())
        })
        .collect()
}

async fn package(
    job: &Job,
    ledger: &SharedLedger,
    structure: &DocumentStructure,
) -> Result<UnitOutcome, PipelineError> {
    let book_dir = job.paths.epub_dir();
    let meta = BookMeta {
        title: job.config.title.clone(),
        author: job.config.author.clone(),
        language: epub::language_code(&job.config.source_language),
        book_id: ledger
            .metadata(BOOK_ID_KEY)
            .await
            .unwrap_or_else(|| format!("urn:uuid:{}", Uuid::new_v4())),
    };
    let chapters = chapter_entries(structure);

    let ncx = book_dir.join(NCX_FILE);
    write_atomic(&ncx, epub::toc_ncx(&meta, &chapters).as_bytes()).await?;
    let images = epub::clean_unused_images(&book_dir).await?;
    let has_cover = is_non_empty_file(&book_dir.join(COVER_FILE)).await;
    let opf = book_dir.join(OPF_FILE);
    write_atomic(
        &opf,
        epub::content_opf(&meta, &chapters, &images, has_cover, Utc::now()).as_bytes(),
    )
    .await?;

    let dest = job.paths.epub_file(&meta.title);
    if let Err(e) = archive::pack(vec![book_dir], &dest).await {
        return UnitOutcome::contain(e);
    }
    info!("EPUB written to {}", dest.display());
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&dest),
        extra: vec![job.paths.relative(&ncx), job.paths.relative(&opf)],
        attempts: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure() -> DocumentStructure {
        let section = |n: usize, start, end| Section {
            id: format!("chapter_{n}"),
            title: format!("Chapter {n}"),
            level: 1,
            pages: PageRange::new(start, end),
            image_refs: Vec::new(),
            subsections: Vec::new(),
        };
        DocumentStructure {
            title: "Book".into(),
            page_count: 10,
            cover_page: Some(1),
            toc_pages: None,
            back_cover: None,
            sections: vec![section(1, 2, 5), section(2, 6, 10)],
        }
    }

    #[test]
    fn units_run_front_matter_first() {
        assert_eq!(
            unit_ids(&structure()),
            ["scaffold", "cover", "toc", "chapter_1", "chapter_2"]
        );
    }

    #[test]
    fn placeholders_without_a_page_take_reported_image_pages() {
        let mut section = structure().sections[1].clone();
        section.image_refs = vec![3, 8, 9];
        let placeholder = |page: Option<usize>| Placeholder {
            id: None,
            page,
            description: "figure".into(),
        };
        let pages = placeholder_pages(
            &[placeholder(Some(1)), placeholder(None), placeholder(Some(40)), placeholder(None)],
            &section,
            PageRange::new(5, 10),
        );
        // Page 3 lies outside the slice and is never offered.
        assert_eq!(pages, [Some(6), Some(8), Some(9), None]);
    }

    #[test]
    fn chapter_entries_point_into_text_dir() {
        let entries = chapter_entries(&structure());
        assert_eq!(entries[1].href, "text/chapter_2.html");
        assert_eq!(entries[1].title, "Chapter 2");
    }

    #[test]
    fn markup_without_a_document_region_is_rejected() {
        assert!(matches!(
            parse_markup("Sorry, I cannot help with that."),
            Err(UnitError::Validation(_))
        ));
        assert!(parse_markup("<html><body><p>ok</p></body></html>").is_ok());
    }
}
