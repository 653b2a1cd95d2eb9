//! Observer trait for per-unit pipeline events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] into the [`crate::job::Job`] to
//! receive events as each stage walks its units. The CLI uses it to drive an
//! `indicatif` progress bar; tests use it to count events.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a channel, a log, or a terminal bar without
//! the library knowing how the host application communicates. The trait is
//! `Send + Sync` because generation units may run concurrently.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2epub::{PipelineObserver, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     completed: AtomicUsize,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_unit_complete(&self, stage: Stage, unit: &str, attempts: u32) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}/{unit} done after {attempts} attempt(s), {done} so far");
//!     }
//! }
//! ```

use crate::ledger::Stage;
use crate::output::StageReport;
use std::sync::Arc;

/// Called by the stages as they process units.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// With `concurrency > 1`, `on_unit_start`, `on_unit_complete` and
/// `on_unit_failed` may be called concurrently from different tasks.
pub trait PipelineObserver: Send + Sync {
    /// Called once the stage knows how many units it has. Translation
    /// learns that only after unpacking the book.
    ///
    /// # Arguments
    /// * `total_units`: units in the stage, including already-done ones
    fn on_stage_start(&self, stage: Stage, total_units: usize) {
        let _ = (stage, total_units);
    }

    /// Called just before a unit's first model call.
    fn on_unit_start(&self, stage: Stage, unit: &str) {
        let _ = (stage, unit);
    }

    /// Called when a unit is marked done.
    fn on_unit_complete(&self, stage: Stage, unit: &str, attempts: u32) {
        let _ = (stage, unit, attempts);
    }

    /// Called for units the ledger already records as done.
    fn on_unit_skipped(&self, stage: Stage, unit: &str) {
        let _ = (stage, unit);
    }

    /// Called when a unit is marked failed after retries are exhausted.
    ///
    /// # Arguments
    /// * `error`: human-readable error description
    fn on_unit_failed(&self, stage: Stage, unit: &str, error: &str) {
        let _ = (stage, unit, error);
    }

    /// Called once after every unit has been attempted.
    fn on_stage_complete(&self, report: &StageReport) {
        let _ = report;
    }
}

/// A no-op observer for callers that don't need progress events.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::job::Job`].
pub type Observer = Arc<dyn PipelineObserver>;
