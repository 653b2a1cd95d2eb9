//! Configuration types for conversion and translation jobs.
//!
//! Every recognised option lives in [`JobConfig`], built through
//! [`JobConfigBuilder`] or loaded from a YAML file with
//! [`JobConfig::from_yaml_file`]. Both paths end in [`JobConfig::validate`],
//! so a job never starts with a value outside its documented range.
//!
//! Unknown YAML keys are rejected rather than ignored: a misspelt
//! `previous_content_limt` silently falling back to `0` would change
//! translation output without any visible error.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Policy applied when a translated section's tag skeleton differs from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureCheck {
    /// Treat a mismatch as a validation error and re-prompt. (default)
    #[default]
    Strict,
    /// Accept the translation and log a warning.
    Lenient,
}

/// Configuration for one document job.
///
/// # Example
/// ```rust
/// use edgequake_pdf2epub::JobConfig;
///
/// let config = JobConfig::builder()
///     .title("My Book")
///     .target_language("French")
///     .previous_content_limit(2000)
///     .build()
///     .unwrap();
/// assert_eq!(config.num_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// Book title. Also names the job directory under `work_dir`.
    /// Defaults to the input file stem when empty.
    pub title: String,

    /// Author written into the EPUB metadata.
    pub author: Option<String>,

    /// Language of the source document. Default: "English".
    pub source_language: String,

    /// Language the translation stage produces. Default: "Chinese".
    pub target_language: String,

    /// Translated title to use instead of asking the model.
    pub target_title: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini"). Auto-detected if None.
    pub provider: Option<String>,

    /// LLM model identifier. Provider default if None.
    pub model: Option<String>,

    /// Sampling temperature for structure and generation calls. Default: 0.1.
    pub temperature: f32,

    /// Sampling temperature for translation calls. Default: 0.2.
    ///
    /// Slightly higher than generation so translations read naturally
    /// instead of word-for-word.
    pub translation_temperature: f32,

    /// Maximum output tokens per call. Default: 16384.
    ///
    /// A chapter of HTML is far longer than a page of Markdown; a low cap
    /// truncates the document mid-tag and fails markup validation.
    pub max_tokens: usize,

    /// Retries after the initial attempt. Default: 3.
    pub num_retries: u32,

    /// Backoff base in milliseconds. Default: 1000.
    pub base_backoff_ms: u64,

    /// Upper bound for a single backoff wait. Default: 30.
    pub max_backoff_seconds: u64,

    /// Per-call timeout in seconds. Default: 600.
    ///
    /// Whole-chapter generation routinely takes minutes; expiry is retryable.
    pub api_timeout_secs: u64,

    /// Trailing characters of prior source text sent as translation context.
    /// 0 disables the context window. Default: 0.
    pub previous_content_limit: usize,

    /// Request payload size that triggers the compression ladder. Default: 45 MiB.
    pub input_size_threshold_bytes: usize,

    /// Rendering DPI. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Pages rendered before and after a section's range. Default: 3.
    ///
    /// Chapters do not always start on a page break; the buffer lets the
    /// model see where the previous chapter ends.
    pub page_buffer: usize,

    /// Generation units processed in parallel. Default: 1.
    pub concurrency: usize,

    /// Translation tag-skeleton policy. Default: strict.
    pub structure_check: StructureCheck,

    /// Chapter titles per TOC translation call. Default: 10.
    pub toc_batch_size: usize,

    /// Root directory holding one sub-directory per job. Default: "output".
    pub work_dir: PathBuf,

    /// Root of the object store mirrored by remote sync. Disabled if None.
    pub remote_dir: Option<PathBuf>,

    /// Age after which an abandoned job lock may be taken over. Default: 6 h.
    pub stale_lock_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            author: None,
            source_language: "English".into(),
            target_language: "Chinese".into(),
            target_title: None,
            provider: None,
            model: None,
            temperature: 0.1,
            translation_temperature: 0.2,
            max_tokens: 16384,
            num_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_seconds: 30,
            api_timeout_secs: 600,
            previous_content_limit: 0,
            input_size_threshold_bytes: 45 * 1024 * 1024,
            dpi: 150,
            max_rendered_pixels: 2000,
            page_buffer: 3,
            concurrency: 1,
            structure_check: StructureCheck::default(),
            toc_batch_size: 10,
            work_dir: PathBuf::from("output"),
            remote_dir: None,
            stale_lock_secs: 6 * 60 * 60,
            download_timeout_secs: 120,
        }
    }
}

impl JobConfig {
    /// Create a new builder for `JobConfig`.
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse YAML text and validate it.
    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        let config: JobConfig = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every range constraint.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.dpi < 72 || self.dpi > 400 {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                self.dpi
            )));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if self.max_backoff_seconds == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_backoff_seconds must be ≥ 1".into(),
            ));
        }
        if self.toc_batch_size == 0 {
            return Err(PipelineError::InvalidConfig("toc_batch_size must be ≥ 1".into()));
        }
        if self.input_size_threshold_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "input_size_threshold_bytes must be > 0".into(),
            ));
        }
        if self.target_language.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "target_language must not be empty".into(),
            ));
        }
        if self.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig("api_timeout_secs must be ≥ 1".into()));
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Directory name for this job: the title with path separators and
    /// control characters replaced.
    pub fn job_id(&self) -> String {
        sanitize_file_name(&self.title)
    }
}

/// Replace characters that are unsafe in file names.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "untitled".to_string()
    } else {
        cleaned
    }
}

/// Builder for [`JobConfig`].
#[derive(Debug)]
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    /// Start from an existing configuration, e.g. one loaded from YAML.
    pub fn from_config(config: JobConfig) -> Self {
        Self { config }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.config.title = title.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.config.author = Some(author.into());
        self
    }

    pub fn source_language(mut self, lang: impl Into<String>) -> Self {
        self.config.source_language = lang.into();
        self
    }

    pub fn target_language(mut self, lang: impl Into<String>) -> Self {
        self.config.target_language = lang.into();
        self
    }

    pub fn target_title(mut self, title: impl Into<String>) -> Self {
        self.config.target_title = Some(title.into());
        self
    }

    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.config.provider = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn translation_temperature(mut self, t: f32) -> Self {
        self.config.translation_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn num_retries(mut self, n: u32) -> Self {
        self.config.num_retries = n;
        self
    }

    pub fn base_backoff_ms(mut self, ms: u64) -> Self {
        self.config.base_backoff_ms = ms;
        self
    }

    pub fn max_backoff_seconds(mut self, secs: u64) -> Self {
        self.config.max_backoff_seconds = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn previous_content_limit(mut self, chars: usize) -> Self {
        self.config.previous_content_limit = chars;
        self
    }

    pub fn input_size_threshold_bytes(mut self, bytes: usize) -> Self {
        self.config.input_size_threshold_bytes = bytes;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn page_buffer(mut self, pages: usize) -> Self {
        self.config.page_buffer = pages;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn structure_check(mut self, check: StructureCheck) -> Self {
        self.config.structure_check = check;
        self
    }

    pub fn toc_batch_size(mut self, n: usize) -> Self {
        self.config.toc_batch_size = n.max(1);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn remote_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.remote_dir = Some(dir.into());
        self
    }

    pub fn stale_lock_secs(mut self, secs: u64) -> Self {
        self.config.stale_lock_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<JobConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
