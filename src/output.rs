//! Stage reports: what each stage did, for summaries and exit status.

use crate::error::{PipelineError, UnitError};
use crate::job::UnitResult;
use crate::ledger::Stage;
use serde::Serialize;
use std::path::PathBuf;

/// A unit that ended the run in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUnit {
    pub id: String,
    pub error: UnitError,
    /// Attempts made in this run.
    pub attempts: u32,
}

/// Outcome of running one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Units completed in this run.
    pub completed: Vec<String>,
    /// Units the ledger already recorded as done.
    pub skipped: Vec<String>,
    pub failed: Vec<FailedUnit>,
    /// Packaged output, when the stage got that far.
    pub artifact: Option<PathBuf>,
    /// Attempts made by units that ran, retries included.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            artifact: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.skipped.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }

    /// `Err(UnitsFailed)` when any unit failed, so callers can exit non-zero.
    pub fn into_result(self) -> Result<StageReport, PipelineError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PipelineError::UnitsFailed {
                failed: self.failed_ids(),
                total: self.total(),
            })
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "{}: {} completed, {} skipped, {} failed",
            self.stage,
            self.completed.len(),
            self.skipped.len(),
            self.failed.len()
        );
        if !self.failed.is_empty() {
            s.push_str(&format!(" ({})", self.failed_ids().join(", ")));
        }
        s
    }
}

impl StageReport {
    pub fn record(&mut self, id: &str, result: UnitResult) {
        match result {
            UnitResult::Skipped => self.skipped.push(id.to_string()),
            UnitResult::Completed { attempts } => {
                self.attempts += attempts;
                self.completed.push(id.to_string());
            }
            UnitResult::Failed { error, attempts } => {
                self.attempts += attempts;
                self.failed.push(FailedUnit {
                    id: id.to_string(),
                    error,
                    attempts,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_passes_through() {
        let mut r = StageReport::new(Stage::Generate);
        r.completed.push("chapter_1".into());
        r.skipped.push("scaffold".into());
        assert!(r.is_success());
        assert_eq!(r.total(), 2);
        assert!(r.into_result().is_ok());
    }

    #[test]
    fn failures_become_units_failed() {
        let mut r = StageReport::new(Stage::Translate);
        r.completed.push("chapter_1".into());
        r.failed.push(FailedUnit {
            id: "chapter_2".into(),
            error: UnitError::Timeout(600),
            attempts: 4,
        });
        assert_eq!(r.summary(), "translate: 1 completed, 0 skipped, 1 failed (chapter_2)");
        let err = r.into_result().unwrap_err();
        assert_eq!(err.to_string(), "1/2 units failed: chapter_2");
    }
}
