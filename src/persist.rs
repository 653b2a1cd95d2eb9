//! Crash-safe file writes.
//!
//! Every artifact and state file goes through [`write_atomic`]: the bytes land
//! in a sibling temp file, are flushed to disk, and only then renamed over the
//! target. A process killed mid-write leaves either the old file or the new
//! one, never a truncated mix.

use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Suffix of in-flight temp files. Remote sync never uploads these.
pub const TMP_SUFFIX: &str = ".tmp";

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Write `bytes` to `path` atomically, creating parent directories.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::persistence(parent, e))?;
    }

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| PipelineError::persistence(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| PipelineError::persistence(&tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| PipelineError::persistence(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PipelineError::persistence(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::CorruptState {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    write_atomic(path, &json).await
}

/// Read a JSON document; `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::persistence(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipelineError::CorruptState {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

/// True when `path` is a regular file with at least one byte.
pub async fn is_non_empty_file(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.is_file() && m.len() > 0)
}

pub async fn is_file(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.is_file())
}
