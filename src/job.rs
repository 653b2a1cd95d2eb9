//! The job context every stage receives, plus its on-disk layout and lock.
//!
//! A [`Job`] bundles configuration, service clients, the observer and the
//! retry policy for one document. Nothing in the pipeline reads ambient
//! globals; a stage sees exactly what its `Job` carries.
//!
//! ## Layout
//!
//! ```text
//! <work_dir>/<job_id>/
//!   .lock                      single-writer sentinel (never synced)
//!   input.pdf                  pinned copy of the source PDF
//!   book_structure.json        structure artifact
//!   generation_progress.json   generation ledger
//!   translation_progress.json  translation ledger
//!   epub/                      unpacked EPUB tree being generated
//!   translation/source/        unpacked EPUB being translated (read-only)
//!   translation/translated/    translated documents, overlaid on source at pack time
//!   logs/process.log           optional log file
//!   <title>.epub               packaged outputs
//! ```

use crate::config::{sanitize_file_name, JobConfig};
use crate::error::{PipelineError, UnitError};
use crate::ledger::{SharedLedger, Stage, UnitState};
use crate::pipeline::llm::{ModelRequest, ModelResponse, ModelService};
use crate::progress::{NoopObserver, Observer};
use crate::retry::{Retried, RetryFailure, RetryPolicy};
use crate::sync::{FsObjectStore, RemoteSync};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Paths of one job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    root: PathBuf,
}

impl JobPaths {
    pub fn new(work_dir: impl AsRef<Path>, job_id: &str) -> Self {
        Self {
            root: work_dir.as_ref().join(job_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn structure(&self) -> PathBuf {
        self.root.join("book_structure.json")
    }

    pub fn ledger(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.ledger_file_name())
    }

    pub fn input_pdf(&self) -> PathBuf {
        self.root.join("input.pdf")
    }

    pub fn epub_dir(&self) -> PathBuf {
        self.root.join("epub")
    }

    pub fn translation_source(&self) -> PathBuf {
        self.root.join("translation").join("source")
    }

    pub fn translation_output(&self) -> PathBuf {
        self.root.join("translation").join("translated")
    }

    pub fn translated_title(&self) -> PathBuf {
        self.root.join("translation").join("title.txt")
    }

    pub fn toc_titles(&self) -> PathBuf {
        self.root.join("translation").join("toc_titles.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("process.log")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Packaged EPUB named after `title`.
    pub fn epub_file(&self, title: &str) -> PathBuf {
        self.root.join(format!("{}.epub", sanitize_file_name(title)))
    }

    /// `path` relative to the job root; paths outside it are returned as-is.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// How a unit's work ended, short of a job-level error.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// The artifact (relative to the job root) is written. `extra` lists
    /// every other file the unit wrote; all of them travel with the unit.
    Done {
        artifact: PathBuf,
        extra: Vec<PathBuf>,
        attempts: u32,
    },
    Failed { error: UnitError, attempts: u32 },
}

impl UnitOutcome {
    pub fn from_retry(result: Result<Retried<PathBuf>, RetryFailure>) -> Self {
        match result {
            Ok(r) => UnitOutcome::Done {
                artifact: r.value,
                extra: Vec::new(),
                attempts: r.attempts,
            },
            Err(f) => UnitOutcome::Failed {
                attempts: f.attempts(),
                error: f.into_error(),
            },
        }
    }

    /// Keep a local error inside the unit that raised it. Errors that put the
    /// job directory at risk still abort the run.
    pub fn contain(error: PipelineError) -> Result<Self, PipelineError> {
        match error {
            PipelineError::Persistence { .. }
            | PipelineError::CorruptState { .. }
            | PipelineError::InvalidTransition { .. }
            | PipelineError::Internal(_) => Err(error),
            other => Ok(UnitOutcome::Failed {
                error: UnitError::Fatal(other.to_string()),
                attempts: 1,
            }),
        }
    }
}

/// What [`Job::run_unit`] did with a unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitResult {
    Skipped,
    Completed { attempts: u32 },
    Failed { error: UnitError, attempts: u32 },
}

/// Everything a stage needs to process one document.
pub struct Job {
    pub config: JobConfig,
    pub paths: JobPaths,
    pub model: Arc<dyn ModelService>,
    pub remote: Option<RemoteSync>,
    pub observer: Observer,
    pub retry: RetryPolicy,
}

impl Job {
    /// Build a job from its configuration. Remote sync is enabled when
    /// `remote_dir` is set.
    pub fn new(config: JobConfig, model: Arc<dyn ModelService>) -> Self {
        let job_id = config.job_id();
        let paths = JobPaths::new(&config.work_dir, &job_id);
        let retry = RetryPolicy::from_config(&config);
        let remote = config.remote_dir.as_ref().map(|dir| {
            RemoteSync::new(
                Arc::new(FsObjectStore::new(dir)),
                job_id.clone(),
                paths.root(),
                retry,
            )
        });
        Self {
            config,
            paths,
            model,
            remote,
            observer: Arc::new(NoopObserver),
            retry,
        }
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_remote(mut self, remote: Option<RemoteSync>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        if let Some(remote) = self.remote.as_mut() {
            remote.set_retry(retry);
        }
        self
    }

    pub fn job_id(&self) -> String {
        self.config.job_id()
    }

    /// Take the single-writer lock for this job.
    pub async fn lock(&self) -> Result<JobLock, PipelineError> {
        JobLock::acquire(
            &self.paths.lock(),
            &self.job_id(),
            Duration::from_secs(self.config.stale_lock_secs),
        )
        .await
    }

    /// Call the model through the retry executor.
    ///
    /// `parse` runs inside the retried operation, so a response it rejects
    /// with [`UnitError::Validation`] is re-requested.
    pub async fn call_model<T, P>(
        &self,
        request: &ModelRequest,
        parse: P,
    ) -> Result<Retried<T>, RetryFailure>
    where
        P: Fn(ModelResponse) -> Result<T, UnitError>,
    {
        let model = self.model.as_ref();
        let parse = &parse;
        self.retry
            .execute(
                &request.label,
                |_| async move {
                    let response = model.complete(request).await?;
                    parse(response)
                },
                UnitError::class,
            )
            .await
    }

    /// Upload `paths` (relative to the job root). Failures are logged only;
    /// the end-of-stage push reports them.
    pub async fn push(&self, paths: &[PathBuf]) {
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.push(paths).await {
                warn!("Remote push failed, will retry at end of stage: {}", e);
            }
        }
    }

    /// Drive one unit through the ledger: skip if done, otherwise mark it in
    /// progress, run `work`, and record the outcome.
    ///
    /// A `PipelineError` from `work` aborts the job and leaves the unit
    /// `in_progress`, which the next load resets to `pending`.
    pub async fn run_unit<F, Fut>(
        &self,
        ledger: &SharedLedger,
        id: &str,
        work: F,
    ) -> Result<UnitResult, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UnitOutcome, PipelineError>>,
    {
        let stage = ledger.read(|l| l.stage()).await;
        if ledger.state(id).await == UnitState::Done {
            debug!("{stage}/{id}: already done, skipping");
            self.observer.on_unit_skipped(stage, id);
            return Ok(UnitResult::Skipped);
        }

        ledger.begin(id).await?;
        self.observer.on_unit_start(stage, id);
        info!("{stage}/{id}: started");

        let ledger_file = PathBuf::from(stage.ledger_file_name());
        match work().await? {
            UnitOutcome::Done {
                artifact,
                extra,
                attempts,
            } => {
                ledger.complete(id, &artifact, extra.clone(), attempts).await?;
                info!("{stage}/{id}: done ({} attempt(s))", attempts);
                // The ledger goes last so the remote never records a unit
                // whose files are not there yet.
                let mut written = extra;
                written.push(artifact);
                written.push(ledger_file);
                self.push(&written).await;
                self.observer.on_unit_complete(stage, id, attempts);
                Ok(UnitResult::Completed { attempts })
            }
            UnitOutcome::Failed { error, attempts } => {
                error!("{stage}/{id}: failed after {} attempt(s): {}", attempts, error);
                ledger.fail(id, error.clone(), attempts).await?;
                self.push(&[ledger_file]).await;
                self.observer.on_unit_failed(stage, id, &error.to_string());
                Ok(UnitResult::Failed { error, attempts })
            }
        }
    }

    /// Final push of the whole job directory. Unlike per-unit pushes, a
    /// failure here is an error.
    pub async fn push_all(&self) -> Result<(), PipelineError> {
        match &self.remote {
            Some(remote) => remote.push_all().await.map(|n| {
                debug!("Pushed {} file(s) to remote", n);
            }),
            None => Ok(()),
        }
    }

    /// Fetch remote state before a stage starts.
    pub async fn pull(&self) -> Result<(), PipelineError> {
        match &self.remote {
            Some(remote) => {
                let pulled = remote.pull().await?;
                if pulled > 0 {
                    info!("Pulled {} file(s) from remote", pulled);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

// ── Single-writer lock ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held while a process mutates a job directory. Removed on drop.
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
}

impl JobLock {
    /// Create `path` exclusively. A lock older than `stale_after` is assumed
    /// abandoned (killed runner) and taken over.
    pub async fn acquire(
        path: &Path,
        job: &str,
        stale_after: Duration,
    ) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::persistence(parent, e))?;
        }

        let mut holder = String::from("another process");
        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let body = serde_json::to_vec(&record)
                        .map_err(|e| PipelineError::Internal(e.to_string()))?;
                    file.write_all(&body)
                        .await
                        .map_err(|e| PipelineError::persistence(path, e))?;
                    file.sync_all()
                        .await
                        .map_err(|e| PipelineError::persistence(path, e))?;
                    debug!("Acquired job lock {}", path.display());
                    return Ok(JobLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let (who, age) = inspect_lock(path).await;
                    holder = who;
                    if age < stale_after {
                        break;
                    }
                    warn!(
                        "Taking over stale job lock held by {} ({}s old)",
                        holder,
                        age.as_secs()
                    );
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(PipelineError::persistence(path, e)),
                    }
                }
                Err(e) => return Err(PipelineError::persistence(path, e)),
            }
        }

        Err(PipelineError::JobLocked {
            job: job.to_string(),
            holder,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove job lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Describe the lock holder and the lock's age. Unreadable records fall back
/// to the file's modification time.
async fn inspect_lock(path: &Path) -> (String, Duration) {
    let now = Utc::now();
    if let Ok(bytes) = tokio::fs::read(path).await {
        if let Ok(record) = serde_json::from_slice::<LockRecord>(&bytes) {
            let age = now
                .signed_duration_since(record.acquired_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            return (format!("pid {} since {}", record.pid, record.acquired_at), age);
        }
    }
    let age = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .unwrap_or(Duration::ZERO);
    ("an unknown process".to_string(), age)
}
