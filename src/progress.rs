//! Progress-callback trait for stage and unit events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the runner works through each stage. The CLI renders them as an
//! `indicatif` progress bar; a service could forward them to a channel.
//!
//! # Example
//!
//! ```rust
//! use bio2csv::{PipelineConfig, PipelineProgressCallback, StageName};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_unit_complete(&self, stage: StageName, unit_id: &str, bytes: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} {unit_id} done ({bytes} bytes)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .stages([StageName::Join])
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::config::StageName;
use crate::consistency::ConsistencyReport;
use crate::runner::RunSummary;
use std::sync::Arc;

/// Called by the runner as it processes each stage.
///
/// Units of a stage run concurrently, so the per-unit methods may be called
/// from several tasks at once. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once per stage before any unit is looked at.
    fn on_stage_start(&self, stage: StageName, total_units: usize) {
        let _ = (stage, total_units);
    }

    /// Called when a unit's existing output is reused.
    fn on_unit_skipped(&self, stage: StageName, unit_id: &str) {
        let _ = (stage, unit_id);
    }

    /// Called just before the transform runs for a unit.
    fn on_unit_start(&self, stage: StageName, unit_id: &str) {
        let _ = (stage, unit_id);
    }

    /// Called after a unit's output has been persisted.
    fn on_unit_complete(&self, stage: StageName, unit_id: &str, bytes: usize) {
        let _ = (stage, unit_id, bytes);
    }

    /// Called when a unit fails.
    fn on_unit_error(&self, stage: StageName, unit_id: &str, error: &str) {
        let _ = (stage, unit_id, error);
    }

    /// Called once per stage after every unit has been attempted.
    fn on_stage_complete(&self, summary: &RunSummary) {
        let _ = summary;
    }

    /// Called after each stage boundary check.
    fn on_consistency_report(&self, report: &ConsistencyReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
