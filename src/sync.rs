//! Remote sync: mirror a job directory to and from an object store.
//!
//! Runners are ephemeral, so each stage pulls the job's remote state before
//! it starts and pushes every unit's artifact plus the ledger as soon as the
//! unit finishes. Keys are `<job_id>/<path relative to the job root>` with
//! `/` separators. Pull is last-writer-wins by modification time: a remote
//! object only replaces a local file that is missing or older. Re-uploading
//! is idempotent because keys are derived from paths.
//!
//! The lock file and in-flight temp files are never transferred.

use crate::error::{PipelineError, UnitError};
use crate::persist::TMP_SUFFIX;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Minimal blob store: put, get, list.
///
/// Errors are [`UnitError`]s so the retry executor can classify them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), UnitError>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, UnitError>;

    /// Every object whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, UnitError>;
}

/// [`ObjectStore`] over a directory: a mounted bucket or a shared volume.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, UnitError> {
        let rel = Path::new(key);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(UnitError::Fatal(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

fn io_error(what: &str, key: &str, e: std::io::Error) -> UnitError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput => {
            UnitError::Fatal(format!("{what} '{key}': {e}"))
        }
        _ => UnitError::Transient(format!("{what} '{key}': {e}")),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), UnitError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("put", key, e))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("put", key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("put", key, e))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, UnitError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("get", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, UnitError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ObjectMeta>, UnitError> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|e| UnitError::Transient(format!("list: {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(key) = key_for(&root, entry.path()) else {
                    continue;
                };
                if !key.starts_with(&prefix) || key.ends_with(TMP_SUFFIX) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .map_err(|e| UnitError::Transient(format!("list: {e}")))?;
                let modified = meta
                    .modified()
                    .map_err(|e| UnitError::Transient(format!("list: {e}")))?;
                out.push(ObjectMeta {
                    key,
                    size: meta.len(),
                    last_modified: DateTime::<Utc>::from(modified),
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| UnitError::Transient(format!("list task failed: {e}")))?
    }
}

/// `/`-separated key of `path` below `root`.
fn key_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Never transferred: the single-writer lock and temp files.
fn is_local_only(rel: &str) -> bool {
    rel == ".lock" || rel.ends_with(TMP_SUFFIX)
}

/// Mirrors one job directory to `<job_id>/` in an [`ObjectStore`].
#[derive(Clone)]
pub struct RemoteSync {
    store: Arc<dyn ObjectStore>,
    job_id: String,
    root: PathBuf,
    retry: RetryPolicy,
}

impl RemoteSync {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        job_id: impl Into<String>,
        root: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            root: root.into(),
            retry,
        }
    }

    pub fn set_retry(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    fn key(&self, rel: &str) -> String {
        format!("{}/{}", self.job_id, rel)
    }

    fn failure(key: &str, f: crate::retry::RetryFailure) -> PipelineError {
        PipelineError::RemoteSync {
            key: key.to_string(),
            attempts: f.attempts(),
            detail: f.error().to_string(),
        }
    }

    /// Fetch remote objects that are missing locally or newer than the local
    /// copy. An empty remote is not an error. Returns the number of files
    /// written.
    pub async fn pull(&self) -> Result<usize, PipelineError> {
        let prefix = format!("{}/", self.job_id);
        let store = self.store.as_ref();
        let listed = self
            .retry
            .execute("remote/list", |_| store.list(&prefix), UnitError::class)
            .await
            .map_err(|f| Self::failure(&prefix, f))?
            .value;

        let mut pulled = 0;
        for meta in listed {
            let Some(rel) = meta.key.strip_prefix(&prefix) else {
                continue;
            };
            if rel.is_empty() || is_local_only(rel) {
                continue;
            }
            let local = self.root.join(rel);
            if let Some(local_mtime) = local_modified(&local).await {
                if local_mtime >= meta.last_modified {
                    debug!("Remote {} is not newer than local, keeping local", rel);
                    continue;
                }
            }
            let key = meta.key.as_str();
            let bytes = self
                .retry
                .execute("remote/get", |_| store.get(key), UnitError::class)
                .await
                .map_err(|f| Self::failure(key, f))?
                .value;
            let Some(bytes) = bytes else {
                // Listed but gone: another runner replaced it mid-pull.
                continue;
            };
            crate::persist::write_atomic(&local, &bytes).await?;
            pulled += 1;
        }
        Ok(pulled)
    }

    /// Upload `paths` (relative to the job root). Missing files are skipped.
    pub async fn push(&self, paths: &[PathBuf]) -> Result<usize, PipelineError> {
        let mut pushed = 0;
        for rel in paths {
            let Some(rel_key) = key_for(Path::new(""), rel) else {
                continue;
            };
            if is_local_only(&rel_key) {
                continue;
            }
            let local = self.root.join(rel);
            let bytes = match tokio::fs::read(&local).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(PipelineError::persistence(&local, e)),
            };
            self.put(&rel_key, bytes).await?;
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Upload every file of the job directory that differs from the remote copy.
    pub async fn push_all(&self) -> Result<usize, PipelineError> {
        let prefix = format!("{}/", self.job_id);
        let store = self.store.as_ref();
        let remote: HashMap<String, ObjectMeta> = self
            .retry
            .execute("remote/list", |_| store.list(&prefix), UnitError::class)
            .await
            .map_err(|f| Self::failure(&prefix, f))?
            .value
            .into_iter()
            .map(|m| (m.key.clone(), m))
            .collect();

        let root = self.root.clone();
        let locals = tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    let rel = key_for(&root, e.path())?;
                    let meta = e.metadata().ok()?;
                    let modified = DateTime::<Utc>::from(meta.modified().ok()?);
                    Some((rel, meta.len(), modified))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("walk task failed: {e}")))?;

        let mut pushed = 0;
        for (rel, size, modified) in locals {
            if is_local_only(&rel) {
                continue;
            }
            if let Some(r) = remote.get(&self.key(&rel)) {
                if r.size == size && r.last_modified >= modified {
                    continue;
                }
            }
            let local = self.root.join(&rel);
            let bytes = tokio::fs::read(&local)
                .await
                .map_err(|e| PipelineError::persistence(&local, e))?;
            self.put(&rel, bytes).await?;
            pushed += 1;
        }
        info!("Remote sync: {} file(s) uploaded for job '{}'", pushed, self.job_id);
        Ok(pushed)
    }

    async fn put(&self, rel: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        let key = self.key(rel);
        let store = self.store.as_ref();
        let key_ref = key.as_str();
        let bytes = &bytes;
        self.retry
            .execute(
                "remote/put",
                |_| store.put(key_ref, bytes.clone()),
                UnitError::class,
            )
            .await
            .map_err(|f| Self::failure(&key, f))?;
        debug!("Pushed {}", key);
        Ok(())
    }
}

async fn local_modified(path: &Path) -> Option<DateTime<Utc>> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}
