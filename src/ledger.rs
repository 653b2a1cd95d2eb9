//! Durable per-unit progress record, the single source of truth for resumption.
//!
//! One JSON file per stage (`generation_progress.json`,
//! `translation_progress.json`) maps each unit id to its state, output
//! artifact, cumulative attempt count and last error. The file is rewritten
//! atomically after every transition, so a killed process loses at most the
//! unit that was in flight.
//!
//! ## State machine
//!
//! ```text
//! pending ──▶ in_progress ──▶ done
//!                  │
//!                  └────────▶ failed ──▶ in_progress (next run)
//! ```
//!
//! `done` is terminal. Loading repairs two crash artefacts: records left
//! `in_progress` go back to `pending`, and `done` records whose artifact is
//! missing or empty go back to `pending`, so a `done` record always points at
//! a real, non-empty file.
//!
//! Artifact paths are stored relative to the ledger's directory so a ledger
//! pulled onto another runner still resolves.

use crate::error::{PipelineError, UnitError};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Pipeline phase that owns a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Generate,
    Translate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Translate => "translate",
        }
    }

    /// File name of this stage's ledger inside the job directory.
    pub fn ledger_file_name(&self) -> &'static str {
        match self {
            Stage::Generate => "generation_progress.json",
            Stage::Translate => "translation_progress.json",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a unit: `(stage, section_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub stage: Stage,
    pub section_id: String,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.section_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::InProgress => "in_progress",
            UnitState::Done => "done",
            UnitState::Failed => "failed",
        }
    }
}

/// Persisted state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub state: UnitState,
    /// Artifact path relative to the job directory, set once `done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Other files the unit wrote (images, stylesheet, unpacked book).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<PathBuf>,
    /// Attempts across every run, for observability only.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<UnitError>,
    pub updated_at: DateTime<Utc>,
}

impl UnitRecord {
    fn pending() -> Self {
        Self {
            state: UnitState::Pending,
            output: None,
            extra: Vec::new(),
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Per-state counts, used by summaries and `pdf2epub status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

/// The progress ledger of one stage of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(skip)]
    path: PathBuf,
    stage: Stage,
    /// Small stage-level facts that must survive restarts (book id, translated title).
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    units: BTreeMap<String, UnitRecord>,
}

impl Ledger {
    /// Load the ledger at `path`, or start empty if the file does not exist.
    pub async fn load(path: impl Into<PathBuf>, stage: Stage) -> Result<Self, PipelineError> {
        let mut ledger = Self::inspect(path, stage).await?;
        ledger.reconcile().await;
        Ok(ledger)
    }

    /// Load exactly what is on disk, without reconciling. For inspection
    /// only: a ledger read this way must not drive a run.
    pub async fn inspect(path: impl Into<PathBuf>, stage: Stage) -> Result<Self, PipelineError> {
        let path = path.into();
        let ledger = match persist::read_json::<Ledger>(&path).await? {
            Some(mut l) => {
                if l.stage != stage {
                    return Err(PipelineError::CorruptState {
                        path,
                        detail: format!("ledger belongs to stage '{}', expected '{stage}'", l.stage),
                    });
                }
                l.path = path;
                l
            }
            None => {
                debug!(path = %path.display(), "no ledger on disk, starting clean");
                Ledger {
                    path,
                    stage,
                    metadata: BTreeMap::new(),
                    units: BTreeMap::new(),
                }
            }
        };
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Directory that artifact paths are relative to.
    pub fn root(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn key(&self, id: &str) -> UnitKey {
        UnitKey {
            stage: self.stage,
            section_id: id.to_string(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    /// State of `id`; units never seen are `pending`.
    pub fn state(&self, id: &str) -> UnitState {
        self.units.get(id).map_or(UnitState::Pending, |r| r.state)
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.state(id) == UnitState::Done
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn units(&self) -> impl Iterator<Item = (&str, &UnitRecord)> {
        self.units.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn counts(&self) -> StateCounts {
        let mut c = StateCounts::default();
        for r in self.units.values() {
            match r.state {
                UnitState::Pending => c.pending += 1,
                UnitState::InProgress => c.in_progress += 1,
                UnitState::Done => c.done += 1,
                UnitState::Failed => c.failed += 1,
            }
        }
        c
    }

    /// Ids currently in `state`, sorted.
    pub fn ids_in(&self, state: UnitState) -> Vec<String> {
        self.units
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn mark_in_progress(&mut self, id: &str) -> Result<(), PipelineError> {
        let record = self
            .units
            .entry(id.to_string())
            .or_insert_with(UnitRecord::pending);
        match record.state {
            UnitState::Pending | UnitState::Failed => {
                record.state = UnitState::InProgress;
                record.updated_at = Utc::now();
                Ok(())
            }
            from => Err(PipelineError::InvalidTransition {
                unit: id.to_string(),
                from: from.as_str(),
                to: UnitState::InProgress.as_str(),
            }),
        }
    }

    /// Mark `id` done with `artifact` (relative to [`Ledger::root`]).
    ///
    /// Refuses if the artifact is missing or empty.
    pub async fn mark_done(
        &mut self,
        id: &str,
        artifact: impl Into<PathBuf>,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        self.mark_done_with(id, artifact, Vec::new(), attempts).await
    }

    /// [`Ledger::mark_done`] for a unit that also wrote `extra` files. Every
    /// one of them must exist.
    pub async fn mark_done_with(
        &mut self,
        id: &str,
        artifact: impl Into<PathBuf>,
        extra: Vec<PathBuf>,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        let artifact = artifact.into();
        let absolute = self.root().join(&artifact);
        if !persist::is_non_empty_file(&absolute).await {
            return Err(PipelineError::MissingArtifact {
                path: absolute,
                stage: self.stage.as_str(),
            });
        }
        for rel in &extra {
            let path = self.root().join(rel);
            if !persist::is_file(&path).await {
                return Err(PipelineError::MissingArtifact {
                    path,
                    stage: self.stage.as_str(),
                });
            }
        }
        let record = self.in_progress_record(id, UnitState::Done)?;
        record.state = UnitState::Done;
        record.output = Some(artifact);
        record.extra = extra;
        record.attempts = record.attempts.saturating_add(attempts);
        record.last_error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        id: &str,
        error: UnitError,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        let record = self.in_progress_record(id, UnitState::Failed)?;
        record.state = UnitState::Failed;
        record.attempts = record.attempts.saturating_add(attempts);
        record.last_error = Some(error);
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Send a done unit back to `pending` because an input it was built
    /// from changed. Returns whether anything changed.
    pub fn invalidate(&mut self, id: &str) -> bool {
        match self.units.get_mut(id) {
            Some(r) if r.state == UnitState::Done => {
                r.state = UnitState::Pending;
                r.output = None;
                r.extra.clear();
                r.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    fn in_progress_record(
        &mut self,
        id: &str,
        to: UnitState,
    ) -> Result<&mut UnitRecord, PipelineError> {
        match self.units.get_mut(id) {
            Some(r) if r.state == UnitState::InProgress => Ok(r),
            other => Err(PipelineError::InvalidTransition {
                unit: id.to_string(),
                from: other.map_or(UnitState::Pending, |r| r.state).as_str(),
                to: to.as_str(),
            }),
        }
    }

    /// Persist atomically. Any failure is fatal to the job.
    pub async fn save(&self) -> Result<(), PipelineError> {
        persist::write_json(&self.path, self).await
    }

    /// Undo crash artefacts; returns how many records were reset.
    async fn reconcile(&mut self) -> usize {
        let root = self.root().to_path_buf();
        let mut reset = 0;
        for (id, record) in self.units.iter_mut() {
            let stale = match record.state {
                UnitState::InProgress => {
                    warn!(unit = %id, "unit was in progress when the last run stopped, resetting");
                    true
                }
                UnitState::Done => {
                    let mut present = match &record.output {
                        Some(rel) => persist::is_non_empty_file(&root.join(rel)).await,
                        None => false,
                    };
                    for rel in &record.extra {
                        if !present {
                            break;
                        }
                        present = persist::is_file(&root.join(rel)).await;
                    }
                    if !present {
                        warn!(unit = %id, "done unit is missing files on disk, resetting");
                    }
                    !present
                }
                UnitState::Pending | UnitState::Failed => false,
            };
            if stale {
                record.state = UnitState::Pending;
                record.output = None;
                record.extra.clear();
                record.updated_at = Utc::now();
                reset += 1;
            }
        }
        reset
    }
}

/// A ledger shared by concurrent workers of one stage.
///
/// Every transition takes the lock, mutates, and saves before releasing it,
/// so writes are serialized and no update is lost.
#[derive(Debug, Clone)]
pub struct SharedLedger {
    inner: Arc<Mutex<Ledger>>,
}

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    pub async fn state(&self, id: &str) -> UnitState {
        self.inner.lock().await.state(id)
    }

    /// Read access under the lock.
    pub async fn read<R>(&self, f: impl FnOnce(&Ledger) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    pub async fn begin(&self, id: &str) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        guard.mark_in_progress(id)?;
        guard.save().await
    }

    pub async fn complete(
        &self,
        id: &str,
        artifact: impl Into<PathBuf>,
        extra: Vec<PathBuf>,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        guard.mark_done_with(id, artifact, extra, attempts).await?;
        guard.save().await
    }

    pub async fn fail(
        &self,
        id: &str,
        error: UnitError,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        guard.mark_failed(id, error, attempts)?;
        guard.save().await
    }

    /// [`Ledger::invalidate`], saved when it changed something.
    pub async fn invalidate(&self, id: &str) -> Result<bool, PipelineError> {
        let mut guard = self.inner.lock().await;
        if !guard.invalidate(id) {
            return Ok(false);
        }
        guard.save().await?;
        Ok(true)
    }

    pub async fn set_metadata(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock().await;
        guard.set_metadata(key, value);
        guard.save().await
    }

    pub async fn metadata(&self, key: &str) -> Option<String> {
        self.inner.lock().await.metadata(key).map(str::to_string)
    }

    pub async fn snapshot(&self) -> Ledger {
        self.inner.lock().await.clone()
    }

    pub async fn path(&self) -> PathBuf {
        self.inner.lock().await.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(root: &Path, rel: &str, body: &str) {
        let p = root.join(rel);
        tokio::fs::create_dir_all(p.parent().unwrap()).await.unwrap();
        tokio::fs::write(p, body).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let l = Ledger::load(dir.path().join("generation_progress.json"), Stage::Generate)
            .await
            .unwrap();
        assert_eq!(l.counts(), StateCounts::default());
        assert_eq!(l.state("chapter_1"), UnitState::Pending);
        assert!(l.get("chapter_1").is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_progress.json");
        let mut l = Ledger::load(&path, Stage::Generate).await.unwrap();

        write(dir.path(), "epub/text/chapter_1.html", "<p>one</p>").await;
        l.mark_in_progress("chapter_1").unwrap();
        l.mark_done("chapter_1", "epub/text/chapter_1.html", 2).await.unwrap();
        l.mark_in_progress("chapter_2").unwrap();
        l.mark_failed("chapter_2", UnitError::Transient("503".into()), 4).unwrap();
        l.set_metadata("book_id", "urn:uuid:1");
        l.save().await.unwrap();

        let back = Ledger::load(&path, Stage::Generate).await.unwrap();
        assert_eq!(back.state("chapter_1"), UnitState::Done);
        assert_eq!(back.get("chapter_1").unwrap().attempts, 2);
        assert_eq!(back.state("chapter_2"), UnitState::Failed);
        assert_eq!(
            back.get("chapter_2").unwrap().last_error,
            Some(UnitError::Transient("503".into()))
        );
        assert_eq!(back.metadata("book_id"), Some("urn:uuid:1"));
        assert_eq!(back.ids_in(UnitState::Failed), vec!["chapter_2".to_string()]);
    }

    #[tokio::test]
    async fn attempts_accumulate_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::load(dir.path().join("l.json"), Stage::Generate).await.unwrap();
        l.mark_in_progress("c").unwrap();
        l.mark_failed("c", UnitError::Timeout(1), 4).unwrap();
        l.mark_in_progress("c").unwrap();
        write(dir.path(), "c.html", "x").await;
        l.mark_done("c", "c.html", 1).await.unwrap();
        assert_eq!(l.get("c").unwrap().attempts, 5);
        assert!(l.get("c").unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn done_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::load(dir.path().join("l.json"), Stage::Generate).await.unwrap();
        write(dir.path(), "c.html", "x").await;
        l.mark_in_progress("c").unwrap();
        l.mark_done("c", "c.html", 1).await.unwrap();
        let err = l.mark_in_progress("c").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { from: "done", .. }));
    }

    #[tokio::test]
    async fn invalidate_only_touches_done_units() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::load(dir.path().join("l.json"), Stage::Generate).await.unwrap();
        write(dir.path(), "book.epub", "zip").await;
        l.mark_in_progress("package").unwrap();
        l.mark_done("package", "book.epub", 1).await.unwrap();
        l.mark_in_progress("chapter_1").unwrap();
        l.mark_failed("chapter_1", UnitError::Timeout(1), 1).unwrap();

        assert!(l.invalidate("package"));
        assert_eq!(l.state("package"), UnitState::Pending);
        assert!(l.get("package").unwrap().output.is_none());
        assert!(!l.invalidate("chapter_1"));
        assert_eq!(l.state("chapter_1"), UnitState::Failed);
        assert!(!l.invalidate("absent"));
    }

    #[tokio::test]
    async fn done_requires_non_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::load(dir.path().join("l.json"), Stage::Generate).await.unwrap();
        write(dir.path(), "empty.html", "").await;
        l.mark_in_progress("c").unwrap();
        assert!(l.mark_done("c", "empty.html", 1).await.is_err());
        assert!(l.mark_done("c", "absent.html", 1).await.is_err());
        assert_eq!(l.state("c"), UnitState::InProgress);
    }

    #[tokio::test]
    async fn done_unit_missing_an_extra_file_resets_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_progress.json");
        let mut l = Ledger::load(&path, Stage::Generate).await.unwrap();
        write(dir.path(), "epub/titlepage.xhtml", "<svg/>").await;
        write(dir.path(), "epub/cover.jpg", "jpeg").await;
        l.mark_in_progress("cover").unwrap();
        assert!(l
            .mark_done_with("cover", "epub/titlepage.xhtml", vec!["epub/gone.jpg".into()], 1)
            .await
            .is_err());
        l.mark_done_with("cover", "epub/titlepage.xhtml", vec!["epub/cover.jpg".into()], 1)
            .await
            .unwrap();
        l.save().await.unwrap();

        let back = Ledger::load(&path, Stage::Generate).await.unwrap();
        assert_eq!(back.state("cover"), UnitState::Done);
        assert_eq!(back.get("cover").unwrap().extra, [PathBuf::from("epub/cover.jpg")]);

        tokio::fs::remove_file(dir.path().join("epub/cover.jpg")).await.unwrap();
        let back = Ledger::load(&path, Stage::Generate).await.unwrap();
        assert_eq!(back.state("cover"), UnitState::Pending);
        assert!(back.get("cover").unwrap().extra.is_empty());
    }

    #[tokio::test]
    async fn done_without_pending_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::load(dir.path().join("l.json"), Stage::Generate).await.unwrap();
        write(dir.path(), "c.html", "x").await;
        assert!(l.mark_done("c", "c.html", 1).await.is_err());
        assert!(l.mark_failed("c", UnitError::Timeout(1), 1).is_err());
    }

    #[tokio::test]
    async fn load_resets_in_progress_and_orphaned_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translation_progress.json");
        let mut l = Ledger::load(&path, Stage::Translate).await.unwrap();
        write(dir.path(), "a.html", "a").await;
        write(dir.path(), "b.html", "b").await;
        l.mark_in_progress("a").unwrap();
        l.mark_done("a", "a.html", 1).await.unwrap();
        l.mark_in_progress("b").unwrap();
        l.mark_done("b", "b.html", 1).await.unwrap();
        l.mark_in_progress("c").unwrap();
        l.save().await.unwrap();

        tokio::fs::remove_file(dir.path().join("b.html")).await.unwrap();

        let back = Ledger::load(&path, Stage::Translate).await.unwrap();
        assert_eq!(back.state("a"), UnitState::Done);
        assert_eq!(back.state("b"), UnitState::Pending);
        assert_eq!(back.state("c"), UnitState::Pending);
    }

    #[tokio::test]
    async fn stage_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.json");
        Ledger::load(&path, Stage::Generate).await.unwrap().save().await.unwrap();
        let err = Ledger::load(&path, Stage::Translate).await.unwrap_err();
        assert!(matches!(err, PipelineError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn shared_ledger_serialises_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation_progress.json");
        let shared = SharedLedger::new(Ledger::load(&path, Stage::Generate).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let shared = shared.clone();
            let root = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                let id = format!("chapter_{i}");
                let rel = format!("{id}.html");
                tokio::fs::write(root.join(&rel), "x").await.unwrap();
                shared.begin(&id).await.unwrap();
                shared.complete(&id, rel, Vec::new(), 1).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let back = Ledger::load(&path, Stage::Generate).await.unwrap();
        assert_eq!(back.counts().done, 16);
    }

    #[test]
    fn unit_key_display() {
        let k = UnitKey {
            stage: Stage::Translate,
            section_id: "chapter_3".into(),
        };
        assert_eq!(k.to_string(), "translate/chapter_3");
    }
}
