//! # edgequake-pdf2epub
//!
//! Turn a PDF into an EPUB with a vision language model, then translate the
//! EPUB into another language, one resumable unit of work at a time.
//!
//! ## Why this crate?
//!
//! A book is hundreds of model calls. Calls fail, rate limits hit, processes
//! get killed and runners get recycled. Every unit of work here (a chapter,
//! the cover, the translated title, one translated document) is recorded in a
//! per-stage progress ledger next to the artifact it produced, so a restarted
//! run skips everything already done and retries only what is missing.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Extract    one model call over all pages → book_structure.json
//!  ├─ 2. Generate   scaffold, cover, toc, one call per chapter → <title>.epub
//!  └─ 3. Translate  title, toc, then documents in reading order, each with
//!                   the tail of the previous translations as context
//! ```
//!
//! Every model call goes through the same backoff-retry executor
//! ([`retry::RetryPolicy`]). With a remote directory configured, the job
//! directory is pulled before a stage and pushed after every unit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2epub::{run, Job, JobConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = JobConfig::builder()
//!         .title("A Book")
//!         .target_language("French")
//!         .build()?;
//!     let job = Job::new(config.clone(), run::model_service(&config)?);
//!     let report = run::run_generate(&job, Some("book.pdf")).await?;
//!     println!("{}", report.summary());
//!     let report = run::run_translate(&job, None).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2epub` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod epub;
pub mod error;
pub mod extract;
pub mod generate;
pub mod job;
pub mod ledger;
pub mod output;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod run;
pub mod structure;
pub mod sync;
pub mod translate;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{JobConfig, JobConfigBuilder, StructureCheck};
pub use error::{ErrorClass, PipelineError, UnitError};
pub use job::{Job, JobLock, JobPaths};
pub use ledger::{Ledger, SharedLedger, Stage, StateCounts, UnitKey, UnitRecord, UnitState};
pub use output::{FailedUnit, StageReport};
pub use pipeline::llm::{LlmModelService, ModelRequest, ModelResponse, ModelService};
pub use pipeline::render::{PageSource, PdfiumPageSource};
pub use progress::{NoopObserver, Observer, PipelineObserver};
pub use retry::{Retried, RetryFailure, RetryPolicy};
pub use structure::{DocumentStructure, PageRange, Section, SubSection};
pub use sync::{FsObjectStore, ObjectStore, RemoteSync};
