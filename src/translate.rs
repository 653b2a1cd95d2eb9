//! Translation stage: a generated EPUB in, the same book in the target
//! language out.
//!
//! The source book is unpacked once into `translation/source/` and never
//! modified. Every translated file is written to the same relative path under
//! `translation/translated/`; packaging overlays the second tree on the first.
//!
//! ## Units
//!
//! 1. `unpack`: extract the source EPUB
//! 2. `title`: translate the book title (or take `target_title`)
//! 3. `toc`: translate the navigation labels in batches
//! 4. `metadata`: write the translated title into the OPF package
//! 5. one unit per content document, id = its path inside the book
//! 6. `package`: zip `<translated title>.epub` once everything else is done
//!
//! ## Context Window
//!
//! With `previous_content_limit = L > 0`, each document request carries the
//! last `L` characters of the visible *source* text of the documents before
//! it that are done. Failed documents contribute nothing. Documents run
//! strictly in reading order so the window is always built from settled
//! units; [`check_dependencies`] refuses to build one otherwise.

use crate::config::StructureCheck;
use crate::epub::{archive, nav};
use crate::error::{PipelineError, UnitError};
use crate::job::{Job, UnitOutcome};
use crate::ledger::{Ledger, SharedLedger, Stage, UnitState};
use crate::output::StageReport;
use crate::persist::{write_atomic, write_json};
use crate::pipeline::llm::{ModelRequest, ModelResponse};
use crate::pipeline::markup::{
    clean_html_response, compare_skeletons, ensure_parseable, reattach_prolog, visible_text,
};
use crate::prompts;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

pub const UNPACK_UNIT: &str = "unpack";
pub const TITLE_UNIT: &str = "title";
pub const TOC_UNIT: &str = "toc";
pub const METADATA_UNIT: &str = "metadata";
pub const PACKAGE_UNIT: &str = "package";

const TITLE_KEY: &str = "translated_title";

/// A content document of the book, in translation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Path inside the book, `/`-separated. Doubles as the ledger id.
    pub id: String,
    /// Navigation label, or the file stem when the document has none.
    pub title: String,
}

/// Where things live inside the unpacked source book.
#[derive(Debug, Clone)]
pub struct BookLayout {
    pub opf: String,
    pub ncx: Option<String>,
    pub title: String,
    pub nav: Vec<nav::NavPoint>,
    pub documents: Vec<Document>,
}

// ── Context window ──────────────────────────────────────────────────────────

/// Last `limit` characters of `previous` joined by newlines, or `None` when
/// the limit is zero or there is no text.
pub fn context_window(previous: &[&str], limit: usize) -> Option<String> {
    if limit == 0 {
        return None;
    }
    let joined = previous
        .iter()
        .filter(|t| !t.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    let count = joined.chars().count();
    let tail: String = joined.chars().skip(count.saturating_sub(limit)).collect();
    (!tail.trim().is_empty()).then_some(tail)
}

/// Refuse to build a context window for `documents[index]` while an earlier
/// document is still unresolved.
pub fn check_dependencies(
    ledger: &Ledger,
    documents: &[Document],
    index: usize,
) -> Result<(), PipelineError> {
    for earlier in &documents[..index] {
        let state = ledger.state(&earlier.id);
        if matches!(state, UnitState::Pending | UnitState::InProgress) {
            return Err(PipelineError::DependencyViolation {
                unit: documents[index].id.clone(),
                blocking: earlier.id.clone(),
                state: state.as_str(),
            });
        }
    }
    Ok(())
}

// ── Book layout ─────────────────────────────────────────────────────────────

/// Resolve `href` against the directory `base` (both relative to the book
/// root). Fragments are dropped; external links and paths escaping the root
/// give `None`.
pub fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.split('#').next()?.trim();
    if href.is_empty() || href.contains("://") || href.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = base
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

fn parent_of(rel: &str) -> &str {
    rel.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn is_document(rel: &str) -> bool {
    let lower = rel.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".xhtml") || lower.ends_with(".htm")
}

fn file_stem(rel: &str) -> String {
    Path::new(rel)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| rel.to_string())
}

/// Navigation order first, then the spine, then every other document sorted
/// by path. Only paths present in `all` are kept, each once.
pub fn document_order(
    nav_targets: &[(String, String)],
    spine: &[String],
    all: &[String],
) -> Vec<Document> {
    let present: HashSet<&str> = all.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut order = Vec::new();

    let mut take = |id: &str, title: Option<&str>| {
        if present.contains(id) && seen.insert(id.to_string()) {
            order.push(Document {
                id: id.to_string(),
                title: title
                    .filter(|t| !t.is_empty())
                    .map_or_else(|| file_stem(id), str::to_string),
            });
        }
    };
    for (path, title) in nav_targets {
        take(path, Some(title.as_str()));
    }
    for path in spine {
        take(path, None);
    }
    let mut rest: Vec<&String> = all.iter().collect();
    rest.sort();
    for path in rest {
        take(path, None);
    }
    order
}

fn epub_err(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Epub {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

async fn read_text(path: &Path) -> Result<String, PipelineError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::persistence(path, e))
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Read package, navigation and document list of the unpacked book.
pub async fn read_layout(source_dir: &Path, fallback_title: &str) -> Result<BookLayout, PipelineError> {
    let opf = slash_path(&archive::rootfile_path(source_dir).await?);
    let opf_path = source_dir.join(&opf);
    let package = nav::parse_opf(&read_text(&opf_path).await?)
        .map_err(|e| epub_err(&opf_path, e))?;
    let opf_dir = parent_of(&opf).to_string();

    let ncx = package
        .ncx_href
        .as_deref()
        .and_then(|href| resolve_href(&opf_dir, href));
    let nav_points = match &ncx {
        Some(rel) => {
            let path = source_dir.join(rel);
            nav::parse_ncx(&read_text(&path).await?).map_err(|e| epub_err(&path, e))?
        }
        None => Vec::new(),
    };
    let ncx_dir = ncx.as_deref().map(parent_of).unwrap_or("").to_string();
    let nav_targets: Vec<(String, String)> = nav_points
        .iter()
        .filter_map(|p| resolve_href(&ncx_dir, &p.src).map(|path| (path, p.title.clone())))
        .collect();
    let spine: Vec<String> = package
        .spine
        .iter()
        .filter_map(|href| resolve_href(&opf_dir, href))
        .collect();

    let all: Vec<String> = walkdir::WalkDir::new(source_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(source_dir).ok().map(slash_path))
        .filter(|rel| is_document(rel))
        .collect();

    Ok(BookLayout {
        title: package
            .title
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback_title.to_string()),
        documents: document_order(&nav_targets, &spine, &all),
        opf,
        ncx,
        nav: nav_points,
    })
}

// ── Response parsing ────────────────────────────────────────────────────────

/// First non-empty line of the answer, without quotes or emphasis.
pub fn parse_title(raw: &str) -> Result<String, UnitError> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let title = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '“' | '”' | '「' | '」' | '《' | '》'))
        .trim();
    if title.is_empty() {
        Err(UnitError::Validation("empty title in response".into()))
    } else {
        Ok(title.to_string())
    }
}

static RE_NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[.)、:]\s*(.*?)\s*$").unwrap());

/// Match numbered answer lines back to `originals`. Missing or empty entries
/// keep the original title; an answer with no numbered line at all is
/// rejected.
pub fn parse_numbered_titles(raw: &str, originals: &[String]) -> Result<Vec<String>, UnitError> {
    let mut translated: Vec<Option<String>> = vec![None; originals.len()];
    let mut found = 0;
    for line in raw.lines() {
        let Some(caps) = RE_NUMBERED.captures(line) else {
            continue;
        };
        let Ok(n) = caps[1].parse::<usize>() else {
            continue;
        };
        let text = caps[2].trim();
        if n >= 1 && n <= originals.len() && !text.is_empty() && translated[n - 1].is_none() {
            translated[n - 1] = Some(text.to_string());
            found += 1;
        }
    }
    if found == 0 && !originals.is_empty() {
        return Err(UnitError::Validation("no numbered titles in response".into()));
    }
    if found < originals.len() {
        warn!(
            "{} of {} titles missing from the answer, keeping the originals",
            originals.len() - found,
            originals.len()
        );
    }
    Ok(translated
        .into_iter()
        .zip(originals)
        .map(|(t, original)| t.unwrap_or_else(|| original.clone()))
        .collect())
}

// ── Stage ───────────────────────────────────────────────────────────────────

/// Path of the translated book. Never the generated book itself, even when
/// both titles sanitize to the same name.
fn output_path(job: &Job, title: &str) -> PathBuf {
    let dest = job.paths.epub_file(title);
    if dest == job.paths.epub_file(&job.config.title) {
        job.paths
            .epub_file(&format!("{} ({})", title, job.config.target_language))
    } else {
        dest
    }
}

/// Run the translation stage over `source_epub`.
pub async fn translate(job: &Job, source_epub: &Path) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let ledger = SharedLedger::new(
        Ledger::load(job.paths.ledger(Stage::Translate), Stage::Translate).await?,
    );
    let mut report = StageReport::new(Stage::Translate);

    let result = job
        .run_unit(&ledger, UNPACK_UNIT, || unpack(job, source_epub))
        .await?;
    report.record(UNPACK_UNIT, result);
    if !ledger.read(|l| l.is_done(UNPACK_UNIT)).await {
        return Ok(finish(job, report, started));
    }

    let layout = read_layout(&job.paths.translation_source(), &job.config.title).await?;
    info!(
        "Book '{}': {} document(s), {} navigation entries",
        layout.title,
        layout.documents.len(),
        layout.nav.len()
    );
    job.observer
        .on_stage_start(Stage::Translate, layout.documents.len() + 5);

    let result = job
        .run_unit(&ledger, TITLE_UNIT, || translate_title(job, &layout, &ledger))
        .await?;
    report.record(TITLE_UNIT, result);

    let result = job
        .run_unit(&ledger, TOC_UNIT, || translate_toc(job, &layout, &ledger))
        .await?;
    report.record(TOC_UNIT, result);

    let result = job
        .run_unit(&ledger, METADATA_UNIT, || translate_metadata(job, &layout, &ledger))
        .await?;
    report.record(METADATA_UNIT, result);

    let limit = job.config.previous_content_limit;
    let mut source_texts: Vec<Option<String>> = vec![None; layout.documents.len()];
    for (index, document) in layout.documents.iter().enumerate() {
        let context = if limit > 0 && !ledger.read(|l| l.is_done(&document.id)).await {
            let snapshot = ledger.snapshot().await;
            check_dependencies(&snapshot, &layout.documents, index)?;
            build_context(job, &snapshot, &layout.documents[..index], &mut source_texts, limit)
                .await?
        } else {
            None
        };
        let result = job
            .run_unit(&ledger, &document.id, || {
                translate_document(job, &layout, document, context)
            })
            .await?;
        report.record(&document.id, result);
    }

    let mut required = vec![
        TITLE_UNIT.to_string(),
        TOC_UNIT.to_string(),
        METADATA_UNIT.to_string(),
    ];
    required.extend(layout.documents.iter().map(|d| d.id.clone()));
    let pending: Vec<String> = ledger
        .read(|l| required.iter().filter(|id| !l.is_done(id)).cloned().collect())
        .await;
    if pending.is_empty() {
        let changed = report.completed.iter().any(|id| id != UNPACK_UNIT);
        if changed && ledger.invalidate(PACKAGE_UNIT).await? {
            info!("Units changed since the last package, repackaging");
        }
        let result = job
            .run_unit(&ledger, PACKAGE_UNIT, || package(job, &ledger))
            .await?;
        report.record(PACKAGE_UNIT, result);
    } else {
        warn!(
            "Not packaging: {} unit(s) not done ({})",
            pending.len(),
            pending.join(", ")
        );
    }

    if let Some(rel) = ledger
        .read(|l| {
            l.get(PACKAGE_UNIT)
                .filter(|r| r.state == UnitState::Done)
                .and_then(|r| r.output.clone())
        })
        .await
    {
        report.artifact = Some(job.paths.root().join(rel));
    }
    Ok(finish(job, report, started))
}

fn finish(job: &Job, mut report: StageReport, started: Instant) -> StageReport {
    report.duration_ms = started.elapsed().as_millis() as u64;
    info!("{}", report.summary());
    job.observer.on_stage_complete(&report);
    report
}

/// Trailing source text of the done documents in `previous`.
///
/// Walks backwards and stops reading files once `limit` characters are
/// collected.
async fn build_context(
    job: &Job,
    ledger: &Ledger,
    previous: &[Document],
    cache: &mut [Option<String>],
    limit: usize,
) -> Result<Option<String>, PipelineError> {
    let source_dir = job.paths.translation_source();
    let mut collected: Vec<usize> = Vec::new();
    let mut chars = 0;
    for (i, document) in previous.iter().enumerate().rev() {
        if !ledger.is_done(&document.id) {
            continue;
        }
        if cache[i].is_none() {
            let html = read_text(&source_dir.join(&document.id)).await?;
            cache[i] = Some(visible_text(&html));
        }
        let len = cache[i].as_deref().map_or(0, |t| t.chars().count());
        if len > 0 {
            collected.push(i);
            chars += len + 1;
        }
        if chars >= limit {
            break;
        }
    }
    collected.reverse();
    let texts: Vec<&str> = collected
        .iter()
        .filter_map(|&i| cache[i].as_deref())
        .collect();
    let context = context_window(&texts, limit);
    if let Some(c) = &context {
        debug!(
            "Context window: {} chars from {} document(s)",
            c.chars().count(),
            texts.len()
        );
    }
    Ok(context)
}

async fn unpack(job: &Job, source_epub: &Path) -> Result<UnitOutcome, PipelineError> {
    let dir = job.paths.translation_source();
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => debug!("Removed partial unpack at {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(PipelineError::persistence(&dir, e)),
    }
    let files = match archive::unpack(source_epub, &dir).await {
        Ok(f) => f,
        Err(e) => return UnitOutcome::contain(e),
    };
    let container = dir.join(crate::epub::CONTAINER_FILE);
    if !crate::persist::is_non_empty_file(&container).await {
        return UnitOutcome::contain(epub_err(source_epub, "no META-INF/container.xml"));
    }
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&container),
        extra: files
            .iter()
            .filter(|f| **f != container)
            .map(|f| job.paths.relative(f))
            .collect(),
        attempts: 1,
    })
}

/// The translated title, once the title unit is done.
async fn translated_title(job: &Job, ledger: &SharedLedger) -> Result<Option<String>, PipelineError> {
    if !ledger.read(|l| l.is_done(TITLE_UNIT)).await {
        return Ok(None);
    }
    if let Some(title) = ledger.metadata(TITLE_KEY).await {
        return Ok(Some(title));
    }
    let text = read_text(&job.paths.translated_title()).await?;
    Ok(Some(text.trim().to_string()))
}

fn title_missing() -> Result<UnitOutcome, PipelineError> {
    Ok(UnitOutcome::Failed {
        error: UnitError::Fatal("book title was not translated".into()),
        attempts: 0,
    })
}

async fn translate_title(
    job: &Job,
    layout: &BookLayout,
    ledger: &SharedLedger,
) -> Result<UnitOutcome, PipelineError> {
    let (title, attempts) = match &job.config.target_title {
        Some(t) => (t.trim().to_string(), 1),
        None => {
            let request = ModelRequest::new(
                format!("translate/{TITLE_UNIT}"),
                prompts::title_prompt(
                    &job.config.source_language,
                    &job.config.target_language,
                    &layout.title,
                ),
            )
            .content(layout.title.as_str())
            .language(&job.config.source_language, &job.config.target_language)
            .sampling(job.config.translation_temperature, 256);
            match job.call_model(&request, |r| parse_title(&r.content)).await {
                Ok(done) => (done.value, done.attempts),
                Err(failure) => {
                    return Ok(UnitOutcome::Failed {
                        attempts: failure.attempts(),
                        error: failure.into_error(),
                    })
                }
            }
        }
    };
    info!("Title: '{}' → '{}'", layout.title, title);
    let path = job.paths.translated_title();
    write_atomic(&path, title.as_bytes()).await?;
    ledger.set_metadata(TITLE_KEY, title).await?;
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&path),
        extra: Vec::new(),
        attempts,
    })
}

async fn translate_toc(
    job: &Job,
    layout: &BookLayout,
    ledger: &SharedLedger,
) -> Result<UnitOutcome, PipelineError> {
    let Some(title) = translated_title(job, ledger).await? else {
        return title_missing();
    };
    let titles_path = job.paths.toc_titles();
    let Some(ncx) = &layout.ncx else {
        write_json(&titles_path, &Vec::<String>::new()).await?;
        return Ok(UnitOutcome::Done {
            artifact: job.paths.relative(&titles_path),
            extra: Vec::new(),
            attempts: 1,
        });
    };

    let originals: Vec<String> = layout.nav.iter().map(|p| p.title.clone()).collect();
    let mut translated = Vec::with_capacity(originals.len());
    let mut attempts = 0;
    for (batch_no, batch) in originals.chunks(job.config.toc_batch_size.max(1)).enumerate() {
        let request = ModelRequest::new(
            format!("translate/{TOC_UNIT}"),
            prompts::toc_entries_prompt(
                &job.config.source_language,
                &job.config.target_language,
                batch,
            ),
        )
        .content(batch.join("\n"))
        .language(&job.config.source_language, &job.config.target_language)
        .sampling(job.config.translation_temperature, job.config.max_tokens);
        match job
            .call_model(&request, |r| parse_numbered_titles(&r.content, batch))
            .await
        {
            Ok(done) => {
                attempts += done.attempts;
                debug!("TOC batch {}: {} title(s)", batch_no + 1, done.value.len());
                translated.extend(done.value);
            }
            Err(failure) => {
                return Ok(UnitOutcome::Failed {
                    attempts: attempts + failure.attempts(),
                    error: failure.into_error(),
                })
            }
        }
    }

    let source = job.paths.translation_source().join(ncx);
    let xml = read_text(&source).await?;
    let rewritten = match nav::rewrite_ncx(&xml, Some(title.as_str()), |i| translated.get(i).cloned()) {
        Ok(x) => x,
        Err(e) => return UnitOutcome::contain(epub_err(&source, e)),
    };
    write_json(&titles_path, &translated).await?;
    let out = job.paths.translation_output().join(ncx);
    write_atomic(&out, rewritten.as_bytes()).await?;
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&out),
        extra: vec![job.paths.relative(&titles_path)],
        attempts: attempts.max(1),
    })
}

async fn translate_metadata(
    job: &Job,
    layout: &BookLayout,
    ledger: &SharedLedger,
) -> Result<UnitOutcome, PipelineError> {
    let Some(title) = translated_title(job, ledger).await? else {
        return title_missing();
    };
    let source = job.paths.translation_source().join(&layout.opf);
    let xml = read_text(&source).await?;
    let rewritten = match nav::rewrite_opf_title(&xml, &title) {
        Ok(x) => x,
        Err(e) => return UnitOutcome::contain(epub_err(&source, e)),
    };
    let out = job.paths.translation_output().join(&layout.opf);
    write_atomic(&out, rewritten.as_bytes()).await?;
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&out),
        extra: Vec::new(),
        attempts: 1,
    })
}

async fn translate_document(
    job: &Job,
    layout: &BookLayout,
    document: &Document,
    context: Option<String>,
) -> Result<UnitOutcome, PipelineError> {
    let source = read_text(&job.paths.translation_source().join(&document.id)).await?;
    let out = job.paths.translation_output().join(&document.id);

    if visible_text(&source).is_empty() {
        debug!("{}: no text, copying unchanged", document.id);
        write_atomic(&out, source.as_bytes()).await?;
        return Ok(UnitOutcome::Done {
            artifact: job.paths.relative(&out),
            extra: Vec::new(),
            attempts: 1,
        });
    }

    let config = &job.config;
    let request = ModelRequest::new(
        format!("translate/{}", document.id),
        prompts::translate_prompt(
            &config.source_language,
            &config.target_language,
            &layout.title,
            &document.title,
        ),
    )
    .content(source.as_str())
    .context(context)
    .language(&config.source_language, &config.target_language)
    .sampling(config.translation_temperature, config.max_tokens);

    let check = config.structure_check;
    let id = document.id.as_str();
    let parse = |response: ModelResponse| -> Result<String, UnitError> {
        let translated = clean_html_response(&response.content)?;
        ensure_parseable(&translated)?;
        match compare_skeletons(&source, &translated) {
            Ok(()) => Ok(translated),
            Err(e) if check == StructureCheck::Lenient => {
                warn!("{}: accepting translation with structural mismatch: {}", id, e);
                Ok(translated)
            }
            Err(e) => Err(e),
        }
    };
    match job.call_model(&request, parse).await {
        Ok(done) => {
            write_atomic(&out, reattach_prolog(&source, &done.value).as_bytes()).await?;
            Ok(UnitOutcome::Done {
                artifact: job.paths.relative(&out),
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

async fn package(job: &Job, ledger: &SharedLedger) -> Result<UnitOutcome, PipelineError> {
    let Some(title) = translated_title(job, ledger).await? else {
        return title_missing();
    };
    let dest = output_path(job, &title);
    let layers = vec![job.paths.translation_source(), job.paths.translation_output()];
    if let Err(e) = archive::pack(layers, &dest).await {
        return UnitOutcome::contain(e);
    }
    info!("Translated EPUB written to {}", dest.display());
    Ok(UnitOutcome::Done {
        artifact: job.paths.relative(&dest),
        extra: Vec::new(),
        attempts: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(ids: &[&str]) -> Vec<Document> {
        ids.iter()
            .map(|id| Document {
                id: id.to_string(),
                title: String::new(),
            })
            .collect()
    }

    #[test]
    fn context_is_the_trailing_slice() {
        let first = "a".repeat(40);
        let second = "b".repeat(30);
        let ctx = context_window(&[&first, &second], 50).unwrap();
        assert_eq!(ctx.chars().count(), 50);
        assert!(ctx.ends_with(&second));
        assert!(ctx.starts_with(&"a".repeat(19)));
        assert_eq!(ctx.chars().nth(19), Some('\n'));
    }

    #[test]
    fn context_disabled_or_empty() {
        assert_eq!(context_window(&["text"], 0), None);
        assert_eq!(context_window(&[], 50), None);
        assert_eq!(context_window(&["", ""], 50), None);
    }

    #[test]
    fn context_counts_characters_not_bytes() {
        let ctx = context_window(&["日本語のテキスト"], 3).unwrap();
        assert_eq!(ctx, "キスト");
    }

    #[test]
    fn hrefs_resolve_against_their_directory() {
        assert_eq!(resolve_href("", "text/a.html#x").as_deref(), Some("text/a.html"));
        assert_eq!(resolve_href("OEBPS", "../cover.xhtml").as_deref(), Some("cover.xhtml"));
        assert_eq!(resolve_href("OEBPS/nav", "./../t/b.html").as_deref(), Some("OEBPS/t/b.html"));
        assert_eq!(resolve_href("", "../escape.html"), None);
        assert_eq!(resolve_href("", "https://example.com/a.html"), None);
        assert_eq!(resolve_href("", "#only-fragment"), None);
    }

    #[test]
    fn documents_follow_navigation_then_spine_then_path() {
        let nav = vec![
            ("text/chapter_2.html".to_string(), "Two".to_string()),
            ("text/chapter_1.html".to_string(), "One".to_string()),
            ("text/chapter_1.html".to_string(), "One again".to_string()),
            ("text/missing.html".to_string(), "Gone".to_string()),
        ];
        let spine = vec!["titlepage.xhtml".to_string(), "text/chapter_2.html".to_string()];
        let all = vec![
            "text/z.html".to_string(),
            "text/chapter_1.html".to_string(),
            "titlepage.xhtml".to_string(),
            "text/chapter_2.html".to_string(),
            "text/a.html".to_string(),
        ];
        let order = document_order(&nav, &spine, &all);
        let ids: Vec<_> = order.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            ["text/chapter_2.html", "text/chapter_1.html", "titlepage.xhtml", "text/a.html", "text/z.html"]
        );
        assert_eq!(order[1].title, "One");
        assert_eq!(order[3].title, "a");
    }

    #[test]
    fn numbered_titles_fall_back_to_originals() {
        let originals = vec!["One".to_string(), "Two".to_string(), "Three".to_string()];
        let parsed = parse_numbered_titles("1. Eins\n\n3) Drei\nnoise", &originals).unwrap();
        assert_eq!(parsed, ["Eins", "Two", "Drei"]);
        assert!(parse_numbered_titles("no numbers here", &originals).is_err());
    }

    #[test]
    fn title_answer_is_cleaned() {
        assert_eq!(parse_title("\n  \"Der Titel\"  \nexplanation").unwrap(), "Der Titel");
        assert_eq!(parse_title("《书名》").unwrap(), "书名");
        assert!(parse_title("   \n").is_err());
    }

    #[tokio::test]
    async fn dependency_check_blocks_on_unresolved_predecessors() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path().join("translation_progress.json"), Stage::Translate)
            .await
            .unwrap();
        let documents = docs(&["a.html", "b.html", "c.html"]);
        ledger.mark_in_progress("a.html").unwrap();
        ledger.mark_failed("a.html", UnitError::Timeout(1), 4).unwrap();
        assert!(check_dependencies(&ledger, &documents, 2).is_err());
        ledger.mark_in_progress("b.html").unwrap();
        let err = check_dependencies(&ledger, &documents, 2).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DependencyViolation { ref blocking, state: "in_progress", .. } if blocking == "b.html"
        ));
        assert!(check_dependencies(&ledger, &documents, 1).is_ok());
    }
}
