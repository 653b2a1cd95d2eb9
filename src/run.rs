//! Top-level entry points: one function per invocation mode.
//!
//! Each mode takes the job lock, pulls remote state, runs its stage and
//! pushes the job directory back. The stages themselves know nothing about
//! locks, providers or pdfium; they see a [`Job`] and a [`PageSource`].

use crate::config::JobConfig;
use crate::error::{PipelineError, UnitError};
use crate::extract::{extract_structure, load_structure};
use crate::generate::generate;
use crate::job::Job;
use crate::ledger::{Ledger, Stage, StateCounts, UnitState};
use crate::output::StageReport;
use crate::pipeline::input::{pin_input, resolve_input};
use crate::pipeline::llm::{LlmModelService, ModelRequest, ModelResponse, ModelService};
use crate::pipeline::render::PdfiumPageSource;
use crate::structure::DocumentStructure;
use crate::translate::translate;
use async_trait::async_trait;
use edgequake_llm::{LLMProvider, ProviderFactory};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Named provider + model** (`config.provider`). Reads the matching API
///    key (`OPENAI_API_KEY`, …) from the environment.
/// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 3. **OpenAI** when `OPENAI_API_KEY` is set.
/// 4. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &JobConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref name) = config.provider {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// The production model service for `config`.
pub fn model_service(config: &JobConfig) -> Result<Arc<dyn ModelService>, PipelineError> {
    Ok(Arc::new(LlmModelService::new(resolve_provider(config)?)))
}

/// Pin `input` as the job's source PDF, or reuse the pinned copy.
///
/// A job that already has `input.pdf` (for example after a remote pull on a
/// fresh runner) needs no input argument.
pub async fn prepare_input(job: &Job, input: Option<&str>) -> Result<PathBuf, PipelineError> {
    let pinned = job.paths.input_pdf();
    match input {
        Some(input) => {
            let resolved = resolve_input(input, job.config.download_timeout_secs).await?;
            if pin_input(&resolved, &pinned).await? {
                job.push(&[job.paths.relative(&pinned)]).await;
            }
        }
        None if crate::persist::is_non_empty_file(&pinned).await => {}
        None => {
            return Err(PipelineError::MissingArtifact {
                path: pinned,
                stage: "input",
            })
        }
    }
    Ok(pinned)
}

/// `extract` mode: derive and persist the document structure.
pub async fn run_extract(job: &Job, input: Option<&str>) -> Result<DocumentStructure, PipelineError> {
    let _lock = job.lock().await?;
    job.pull().await?;
    let pdf = prepare_input(job, input).await?;
    let pages = PdfiumPageSource::new(pdf, job.config.max_rendered_pixels);
    let structure = extract_structure(job, &pages).await?;
    job.push_all().await?;
    Ok(structure)
}

/// `generate` mode: build the EPUB, extracting the structure first if needed.
pub async fn run_generate(job: &Job, input: Option<&str>) -> Result<StageReport, PipelineError> {
    let _lock = job.lock().await?;
    job.pull().await?;
    let pdf = prepare_input(job, input).await?;
    let pages = PdfiumPageSource::new(pdf, job.config.max_rendered_pixels);
    let structure = extract_structure(job, &pages).await?;
    let report = generate(job, &pages, &structure).await?;
    job.push_all().await?;
    Ok(report)
}

/// `translate` mode: translate `epub`, or the book this job generated.
pub async fn run_translate(job: &Job, epub: Option<&Path>) -> Result<StageReport, PipelineError> {
    let _lock = job.lock().await?;
    job.pull().await?;
    let source = match epub {
        Some(path) => path.to_path_buf(),
        None => {
            let generated = job.paths.epub_file(&job.config.title);
            if !crate::persist::is_non_empty_file(&generated).await {
                return Err(PipelineError::MissingArtifact {
                    path: generated,
                    stage: "generate",
                });
            }
            generated
        }
    };
    info!("Translating {} into {}", source.display(), job.config.target_language);
    let report = translate(job, &source).await?;
    job.push_all().await?;
    Ok(report)
}

/// Ledger summary of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub counts: StateCounts,
    /// `(unit, last error)` of every failed unit.
    pub failed: Vec<(String, String)>,
}

/// What `pdf2epub status` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub root: PathBuf,
    pub structure_sections: Option<usize>,
    pub stages: Vec<StageStatus>,
}

/// Stands in for the model service where no call is ever made.
struct Offline;

#[async_trait]
impl ModelService for Offline {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, UnitError> {
        Err(UnitError::Fatal(format!(
            "no model service configured for '{}'",
            request.label
        )))
    }
}

/// Read both ledgers as they are on disk, without touching any service or
/// taking the lock.
pub async fn status(config: &JobConfig) -> Result<JobStatus, PipelineError> {
    let job = Job::new(config.clone(), Arc::new(Offline));
    let mut stages = Vec::new();
    for stage in [Stage::Generate, Stage::Translate] {
        let ledger = Ledger::inspect(job.paths.ledger(stage), stage).await?;
        let failed = ledger
            .units()
            .filter(|(_, r)| r.state == UnitState::Failed)
            .map(|(id, r)| {
                (
                    id.to_string(),
                    r.last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                )
            })
            .collect();
        stages.push(StageStatus {
            stage,
            counts: ledger.counts(),
            failed,
        });
    }
    Ok(JobStatus {
        job_id: job.job_id(),
        root: job.paths.root().to_path_buf(),
        structure_sections: load_structure(&job).await?.map(|s| s.sections.len()),
        stages,
    })
}
