//! Structure extraction: one model call over the whole document that yields
//! the outline every later stage walks.
//!
//! The result is written to `<job>/book_structure.json` as soon as it
//! validates. A later run that finds a valid artifact returns it without
//! rendering a single page, so the expensive call happens once per document.

use crate::error::PipelineError;
use crate::job::Job;
use crate::persist::{read_json, write_json};
use crate::pipeline::encode::encode_pages;
use crate::pipeline::llm::ModelRequest;
use crate::pipeline::render::PageSource;
use crate::prompts;
use crate::structure::DocumentStructure;
use std::time::Instant;
use tracing::{info, warn};

/// Label used for the outline call in logs and by test doubles.
pub const STRUCTURE_LABEL: &str = "structure";

/// Load the persisted structure if it is present and valid.
pub async fn load_structure(job: &Job) -> Result<Option<DocumentStructure>, PipelineError> {
    let path = job.paths.structure();
    let structure: Option<DocumentStructure> = match read_json(&path).await {
        Ok(s) => s,
        Err(PipelineError::CorruptState { detail, .. }) => {
            warn!("Ignoring unreadable {}: {}", path.display(), detail);
            None
        }
        Err(e) => return Err(e),
    };
    match structure {
        Some(s) => match s.validate() {
            Ok(()) => Ok(Some(s)),
            Err(e) => {
                warn!("Ignoring invalid {}: {}", path.display(), e);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Derive the document outline, reusing a persisted one when available.
pub async fn extract_structure(
    job: &Job,
    pages: &dyn PageSource,
) -> Result<DocumentStructure, PipelineError> {
    if let Some(existing) = load_structure(job).await? {
        info!(
            "Structure already extracted: {} sections, skipping model call",
            existing.sections.len()
        );
        return Ok(existing);
    }

    let started = Instant::now();
    let page_count = pages.page_count().await?;
    let numbers: Vec<usize> = (1..=page_count).collect();
    let rendered = pages.render(&numbers).await?;
    let encoded = encode_pages(
        &rendered,
        job.config.input_size_threshold_bytes,
        job.config.dpi,
    )?;
    if let Some(step) = encoded.step {
        info!(
            "Compressed {} pages to {} bytes (dpi {}, quality {})",
            encoded.pages.len(),
            encoded.bytes,
            step.dpi,
            step.jpeg_quality
        );
    }

    let labels = encoded
        .pages
        .iter()
        .enumerate()
        .map(|(i, (n, _))| format!("Image {} = PDF page {}", i + 1, n))
        .collect::<Vec<_>>()
        .join("\n");
    let title = job.config.title.clone();
    let request = ModelRequest::new(STRUCTURE_LABEL, prompts::structure_prompt(&title))
        .content(format!(
            "The document has {page_count} pages. The attached images are labelled as follows:\n{labels}"
        ))
        .images(encoded.images())
        .sampling(job.config.temperature, job.config.max_tokens);

    let structure = job
        .call_model(&request, |response| {
            DocumentStructure::parse_response(&response.content, &title, page_count)
        })
        .await
        .map_err(|failure| PipelineError::StructureExtraction {
            attempts: failure.attempts(),
            reason: failure.error().to_string(),
        })?
        .value;

    let path = job.paths.structure();
    write_json(&path, &structure).await?;
    job.push(&[job.paths.relative(&path)]).await;
    info!(
        "Extracted {} sections from {} pages in {:?}",
        structure.sections.len(),
        page_count,
        started.elapsed()
    );
    Ok(structure)
}
