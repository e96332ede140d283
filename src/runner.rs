//! Generic executor for one pipeline stage.
//!
//! A [`Stage`] is an explicit `(name, transform, code version)` triple plus
//! the stores it reads and writes. [`run_stage`] walks every unit of the input
//! source, decides per unit whether the existing output can be reused, and
//! calls the transform only for units that need it.
//!
//! ## Skip rule
//!
//! A unit is skipped iff its output artifact is readable (digest and
//! structural check pass), its stored code version equals the stage's, and,
//! when fingerprint verification is on, its stored input fingerprint equals
//! the fingerprint of the current input. Anything else reprocesses.
//!
//! ## Isolation
//!
//! Units run on a bounded `buffer_unordered` pool. A unit's failure is
//! recorded in the [`RunSummary`] and never cancels its siblings.

use crate::config::StageName;
use crate::error::{StoreError, TransformError};
use crate::progress::ProgressCallback;
use crate::store::{fingerprint, UnitSource, UnitStore};
use crate::unit::UnitId;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The per-unit work of a stage.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Produce the output payload for one unit from its input payload.
    async fn apply(&self, unit_id: &UnitId, input: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Cooperative cancellation shared between the driver and the caller.
///
/// Checked before each unit starts; units already running finish and are
/// persisted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One stage of the explicit stage list handed to the driver.
pub struct Stage {
    pub name: StageName,
    pub code_version: String,
    pub transform: Arc<dyn Transform>,
    pub input: Arc<dyn UnitSource>,
    pub output: UnitStore,
    pub concurrency: usize,
}

/// Options shared by every stage of a run.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub verify_fingerprints: bool,
    pub progress: Option<ProgressCallback>,
    pub cancel: CancelFlag,
}

/// A unit that failed, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_id: UnitId,
    pub error: TransformError,
}

/// What a stage run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub stage: StageName,
    pub code_version: String,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Units never started because the run was cancelled.
    pub cancelled: usize,
    /// Failed units, sorted by id.
    pub failures: Vec<UnitFailure>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed + self.cancelled
    }

    pub fn failed_ids(&self) -> Vec<&UnitId> {
        self.failures.iter().map(|f| &f.unit_id).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Why a unit is (re)processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Missing,
    Corrupt(String),
    VersionChanged { stored: String },
    InputChanged,
}

enum Outcome {
    Processed,
    Skipped,
    Failed(TransformError),
    Cancelled,
}

/// Decide whether `unit_id` must be processed.
///
/// `input_fingerprint` is only consulted when fingerprint verification is on;
/// pass `None` otherwise so the input is never read for a skip decision.
pub fn decide(
    output: &UnitStore,
    unit_id: &UnitId,
    code_version: &str,
    input_fingerprint: Option<&str>,
) -> Result<Decision, StoreError> {
    match output.get(unit_id) {
        Ok(artifact) => {
            if artifact.provenance.code_version != code_version {
                return Ok(Decision::VersionChanged {
                    stored: artifact.provenance.code_version,
                });
            }
            match input_fingerprint {
                Some(fp) if fp != artifact.provenance.input_fingerprint => {
                    Ok(Decision::InputChanged)
                }
                _ => Ok(Decision::Skip),
            }
        }
        Err(StoreError::NotFound { .. }) => Ok(Decision::Missing),
        Err(StoreError::Corrupt { detail, .. }) => Ok(Decision::Corrupt(detail)),
        Err(e) => Err(e),
    }
}

/// Run one stage over every unit of its input.
///
/// Never fails as a whole: an unlistable input is reported as a
/// [`StoreError`] by the caller before this is reached, and every per-unit
/// problem ends up in the summary.
pub async fn run_stage(
    stage: &Stage,
    unit_ids: Vec<UnitId>,
    options: &RunOptions,
) -> RunSummary {
    let start = Instant::now();
    let total = unit_ids.len();
    info!(
        "Stage {} ({}): {} units, concurrency {}",
        stage.name, stage.code_version, total, stage.concurrency
    );
    if let Some(ref cb) = options.progress {
        cb.on_stage_start(stage.name, total);
    }

    let mut outcomes: Vec<(UnitId, Outcome)> = stream::iter(unit_ids.into_iter().map(|unit_id| {
        async move {
            let outcome = process_unit(stage, &unit_id, options).await;
            (unit_id, outcome)
        }
    }))
    .buffer_unordered(stage.concurrency.max(1))
    .collect()
    .await;

    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut summary = RunSummary {
        stage: stage.name,
        code_version: stage.code_version.clone(),
        processed: 0,
        skipped: 0,
        failed: 0,
        cancelled: 0,
        failures: Vec::new(),
        duration_ms: 0,
    };
    for (unit_id, outcome) in outcomes {
        match outcome {
            Outcome::Processed => summary.processed += 1,
            Outcome::Skipped => summary.skipped += 1,
            Outcome::Cancelled => summary.cancelled += 1,
            Outcome::Failed(error) => {
                summary.failed += 1;
                summary.failures.push(UnitFailure { unit_id, error });
            }
        }
    }
    summary.duration_ms = start.elapsed().as_millis() as u64;

    info!(
        "Stage {} complete: {} processed, {} skipped, {} failed, {} cancelled in {}ms",
        stage.name,
        summary.processed,
        summary.skipped,
        summary.failed,
        summary.cancelled,
        summary.duration_ms
    );
    if let Some(ref cb) = options.progress {
        cb.on_stage_complete(&summary);
    }
    summary
}

async fn process_unit(stage: &Stage, unit_id: &UnitId, options: &RunOptions) -> Outcome {
    if options.cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    // Load the input up front only when the skip rule needs its fingerprint.
    let mut input: Option<Vec<u8>> = None;
    if options.verify_fingerprints {
        match stage.input.load(unit_id) {
            Ok(bytes) => input = Some(bytes),
            Err(e) => return fail(stage, unit_id, input_unavailable(e), options),
        }
    }
    let input_fp = input.as_deref().map(fingerprint);

    match decide(&stage.output, unit_id, &stage.code_version, input_fp.as_deref()) {
        Ok(Decision::Skip) => {
            debug!("{} {}: up to date, skipping", stage.name, unit_id);
            if let Some(ref cb) = options.progress {
                cb.on_unit_skipped(stage.name, unit_id.as_str());
            }
            return Outcome::Skipped;
        }
        Ok(Decision::Missing) => debug!("{} {}: no output yet", stage.name, unit_id),
        Ok(Decision::Corrupt(detail)) => {
            warn!("{} {}: corrupt artifact, reprocessing ({})", stage.name, unit_id, detail)
        }
        Ok(Decision::VersionChanged { stored }) => debug!(
            "{} {}: stored version {} != {}, reprocessing",
            stage.name, unit_id, stored, stage.code_version
        ),
        Ok(Decision::InputChanged) => {
            debug!("{} {}: input fingerprint changed, reprocessing", stage.name, unit_id)
        }
        Err(e) => warn!("{} {}: could not read output ({}), reprocessing", stage.name, unit_id, e),
    }

    let input = match input {
        Some(bytes) => bytes,
        None => match stage.input.load(unit_id) {
            Ok(bytes) => bytes,
            Err(e) => return fail(stage, unit_id, input_unavailable(e), options),
        },
    };
    let input_fp = input_fp.unwrap_or_else(|| fingerprint(&input));

    if let Some(ref cb) = options.progress {
        cb.on_unit_start(stage.name, unit_id.as_str());
    }

    let payload = match stage.transform.apply(unit_id, &input).await {
        Ok(payload) => payload,
        Err(e) => return fail(stage, unit_id, e, options),
    };

    if let Err(e) = stage
        .output
        .put(unit_id, &payload, &stage.code_version, &input_fp)
    {
        return fail(
            stage,
            unit_id,
            TransformError::Store {
                detail: e.to_string(),
            },
            options,
        );
    }

    if let Some(ref cb) = options.progress {
        cb.on_unit_complete(stage.name, unit_id.as_str(), payload.len());
    }
    Outcome::Processed
}

fn input_unavailable(e: StoreError) -> TransformError {
    TransformError::InputUnavailable {
        detail: e.to_string(),
    }
}

fn fail(stage: &Stage, unit_id: &UnitId, error: TransformError, options: &RunOptions) -> Outcome {
    warn!("{} {}: failed: {}", stage.name, unit_id, error);
    if let Some(ref cb) = options.progress {
        cb.on_unit_error(stage.name, unit_id.as_str(), &error.to_string());
    }
    Outcome::Failed(error)
}
