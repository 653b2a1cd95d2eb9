//! Error types for the edgequake-pdf2epub library.
//!
//! Two distinct error types reflect two distinct failure scopes:
//!
//! * [`PipelineError`]: **Job-level**: the stage cannot continue at all
//!   (missing input, ledger write failure, structure extraction exhausted its
//!   retries, another process holds the job lock). Returned as
//!   `Err(PipelineError)` from the stage entry points and aborts the run.
//!
//! * [`UnitError`]: **Unit-level**: one call for one section failed
//!   (rate limit, timeout, empty model output). The retry executor decides
//!   whether to try again from [`UnitError::class`]; once retries are spent the
//!   error is recorded in the progress ledger and sibling units carry on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All job-level errors returned by the edgequake-pdf2epub library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// A stage needs an artifact an earlier stage should have produced.
    #[error("Missing artifact '{path}'\nRun the `{stage}` stage first.")]
    MissingArtifact { path: PathBuf, stage: &'static str },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Every step of the compression ladder failed to encode the pages.
    #[error("Image encoding failed: {0}")]
    EncodingFailed(String),

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The outline call failed after all retries or returned an unusable outline.
    #[error("Structure extraction failed after {attempts} attempt(s): {reason}")]
    StructureExtraction { attempts: u32, reason: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// Local state could not be written; resumption integrity is lost.
    #[error("Failed to persist '{path}': {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted JSON document (ledger, structure) could not be decoded.
    #[error("Corrupt state file '{path}': {detail}")]
    CorruptState { path: PathBuf, detail: String },

    /// A ledger transition that would break monotonic unit progress.
    #[error("Unit '{unit}' cannot move from {from} to {to}")]
    InvalidTransition {
        unit: String,
        from: &'static str,
        to: &'static str,
    },

    /// A unit was about to run while an earlier unit it depends on is unresolved.
    #[error("Unit '{unit}' depends on '{blocking}', which is still {state}")]
    DependencyViolation {
        unit: String,
        blocking: String,
        state: &'static str,
    },

    /// Another process holds the single-writer lock for this job.
    #[error("Job '{job}' is locked by {holder}\nRemove '{path}' if that process is gone.")]
    JobLocked {
        job: String,
        holder: String,
        path: PathBuf,
    },

    // ── Remote sync errors ────────────────────────────────────────────────
    #[error("Remote sync failed for '{key}' after {attempts} attempt(s): {detail}")]
    RemoteSync {
        key: String,
        attempts: u32,
        detail: String,
    },

    // ── EPUB errors ───────────────────────────────────────────────────────
    /// Reading or writing the EPUB container failed.
    #[error("EPUB error in '{path}': {detail}")]
    Epub { path: PathBuf, detail: String },

    // ── Outcome errors ────────────────────────────────────────────────────
    /// The stage finished but at least one unit ended in `failed`.
    #[error("{}/{total} units failed: {}", .failed.len(), .failed.join(", "))]
    UnitsFailed { failed: Vec<String>, total: usize },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or YAML validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// How the retry executor treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wait and try again, up to the configured bound.
    Retryable,
    /// Surface immediately; another attempt cannot help.
    Fatal,
}

/// A non-fatal error for a single unit of work.
///
/// Serializable so the last error of a failed unit can be stored in the
/// progress ledger next to its attempt count.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnitError {
    /// Network failure or 5xx from the service.
    #[error("transient service error: {0}")]
    Transient(String),

    /// HTTP 429 or an equivalent quota message.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The per-call timeout expired.
    #[error("call timed out after {0}s")]
    Timeout(u64),

    /// Authentication, malformed request, content filter.
    #[error("fatal service error: {0}")]
    Fatal(String),

    /// The service answered but the payload is empty or malformed.
    #[error("invalid model output: {0}")]
    Validation(String),

    /// The request payload still exceeds the size threshold after compression.
    #[error("input too large: {bytes} bytes exceeds {limit} bytes")]
    InputTooLarge { bytes: usize, limit: usize },
}

impl UnitError {
    /// Default classification used by every stage.
    ///
    /// Validation failures are retried because re-prompting usually fixes
    /// them. `InputTooLarge` is only raised once the compression fallback has
    /// already run, so another identical attempt cannot succeed.
    pub fn class(&self) -> ErrorClass {
        match self {
            UnitError::Transient(_)
            | UnitError::RateLimited(_)
            | UnitError::Timeout(_)
            | UnitError::Validation(_) => ErrorClass::Retryable,
            UnitError::Fatal(_) | UnitError::InputTooLarge { .. } => ErrorClass::Fatal,
        }
    }
}
