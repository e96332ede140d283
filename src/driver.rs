//! Run entry points: wire the four stages together and run them in order.
//!
//! ## Why an explicit stage list?
//!
//! [`Pipeline`] holds a plain `Vec<Stage>` built by [`Pipeline::from_config`].
//! Each entry names its transform, its code version and the stores it reads
//! and writes; nothing is discovered at runtime. Reading the constructor is
//! enough to know what a run will do.
//!
//! ## Fail-fast, then isolate
//!
//! Everything that would make *every* unit fail is checked before the first
//! stage starts: the source PDF must exist and start with `%PDF`, its outline
//! must yield at least one subject, and (when the parse stage is selected)
//! an LLM provider must resolve. After that, failures are per unit and only
//! show up in the [`PipelineReport`].

use crate::config::{PipelineConfig, StageName};
use crate::consistency::{check, check_stage, ConsistencyReport};
use crate::error::PipelineError;
use crate::pipeline::join::{self, load_records, write_tables};
use crate::pipeline::parse::{self, resolve_provider, Generator, LlmGenerator, ParseTransform};
use crate::pipeline::split::{self, SplitPlan, SplitTransform};
use crate::pipeline::extract::{self, ExtractTransform};
use crate::runner::{run_stage, RunOptions, RunSummary, Stage};
use crate::store::{ArtifactKind, CurrentArtifacts, UnitSource, UnitStore};
use crate::unit::UnitId;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What a run did, stage by stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    /// One summary per stage that ran, in order.
    pub summaries: Vec<RunSummary>,
    /// One report per stage boundary checked, in order.
    pub consistency: Vec<ConsistencyReport>,
    /// CSV files written by the join stage.
    pub tables: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl PipelineReport {
    /// True when any unit failed or was cancelled. Drives the exit code.
    pub fn has_failures(&self) -> bool {
        self.summaries.iter().any(|s| !s.is_clean())
    }

    pub fn is_consistent(&self) -> bool {
        self.consistency.iter().all(ConsistencyReport::is_consistent)
    }

    pub fn summary(&self, stage: StageName) -> Option<&RunSummary> {
        self.summaries.iter().find(|s| s.stage == stage)
    }
}

/// The source document, loaded and planned.
pub struct SplitInput {
    pub plan: SplitPlan,
    pub source: Arc<Vec<u8>>,
}

/// The join step: current records in, CSV tables out.
pub struct JoinStep {
    pub records: CurrentArtifacts,
    pub code_version: String,
    pub tables_dir: PathBuf,
}

/// An explicit, ordered list of stages plus the final join.
pub struct Pipeline {
    stages: Vec<Stage>,
    join: Option<JoinStep>,
    options: RunOptions,
}

fn open_store(
    dir: PathBuf,
    kind: ArtifactKind,
    stage: StageName,
) -> Result<UnitStore, PipelineError> {
    UnitStore::open(dir, kind).map_err(|source| PipelineError::Store { stage, source })
}

/// The stage whose output `stage` reads. `None` for split (reads the source).
fn upstream_of(stage: StageName) -> Option<StageName> {
    match stage {
        StageName::Split => None,
        StageName::Extract => Some(StageName::Split),
        StageName::Parse => Some(StageName::Extract),
        StageName::Join => Some(StageName::Parse),
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>, join: Option<JoinStep>, options: RunOptions) -> Self {
        Self {
            stages,
            join,
            options,
        }
    }

    /// Build the stage list for the stages `config` selects.
    ///
    /// `split` is required when the split stage is selected, `generator`
    /// when the parse stage is.
    pub fn from_config(
        config: &PipelineConfig,
        split: Option<SplitInput>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Result<Self, PipelineError> {
        let split_version = config.code_version(StageName::Split, split::CODE_VERSION);
        let extract_version = config.code_version(StageName::Extract, extract::CODE_VERSION);
        let parse_version = config.code_version(StageName::Parse, parse::CODE_VERSION);
        let join_version = config.code_version(StageName::Join, join::CODE_VERSION);

        let split_store = open_store(config.split_dir(), ArtifactKind::Pdf, StageName::Split)?;
        let text_store = open_store(config.text_dir(), ArtifactKind::Text, StageName::Extract)?;
        let parsed_store = open_store(config.parsed_dir(), ArtifactKind::Record, StageName::Parse)?;

        let mut stages = Vec::new();

        if config.runs(StageName::Split) {
            let split = split.ok_or_else(|| {
                PipelineError::InvalidConfig("the split stage needs a planned source PDF".into())
            })?;
            stages.push(Stage {
                name: StageName::Split,
                code_version: split_version.clone(),
                transform: Arc::new(SplitTransform::new(split.source)),
                input: Arc::new(split.plan),
                output: split_store.clone(),
                concurrency: config.concurrency,
            });
        }

        if config.runs(StageName::Extract) {
            stages.push(Stage {
                name: StageName::Extract,
                code_version: extract_version.clone(),
                transform: Arc::new(ExtractTransform),
                input: Arc::new(CurrentArtifacts::new(split_store, split_version)),
                output: text_store.clone(),
                concurrency: config.concurrency,
            });
        }

        if config.runs(StageName::Parse) {
            let generator = generator.ok_or_else(|| {
                PipelineError::InvalidConfig("the parse stage needs a generator".into())
            })?;
            let mut transform =
                ParseTransform::new(generator, Duration::from_secs(config.api_timeout_secs))
                    .with_rejected_dir(config.rejected_dir());
            if let Some(ref prompt) = config.system_prompt {
                transform = transform.with_system_prompt(prompt.clone());
            }
            stages.push(Stage {
                name: StageName::Parse,
                code_version: parse_version.clone(),
                transform: Arc::new(transform),
                input: Arc::new(CurrentArtifacts::new(text_store, extract_version)),
                output: parsed_store.clone(),
                concurrency: config.llm_concurrency,
            });
        }

        let join = config.runs(StageName::Join).then(|| JoinStep {
            records: CurrentArtifacts::new(parsed_store, parse_version),
            code_version: join_version,
            tables_dir: config.tables_dir(),
        });

        let options = RunOptions {
            verify_fingerprints: config.verify_fingerprints,
            progress: config.progress_callback.clone(),
            cancel: config.cancel.clone(),
        };
        Ok(Self::new(stages, join, options))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage in order, checking each boundary, then join.
    ///
    /// Returns `Err` only when a store cannot be listed or the tables cannot
    /// be written; unit failures are in the report.
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let start = Instant::now();
        let mut report = PipelineReport::default();

        for stage in &self.stages {
            let ids = stage
                .input
                .list_ids()
                .map_err(|source| PipelineError::Store {
                    stage: stage.name,
                    source,
                })?;

            let summary = run_stage(stage, ids.iter().cloned().collect(), &self.options).await;
            report.summaries.push(summary);

            let consistency = check_stage(
                upstream_of(stage.name),
                stage.name,
                &ids,
                &stage.output,
                &stage.code_version,
            )
            .map_err(|source| PipelineError::Store {
                stage: stage.name,
                source,
            })?;
            self.record_consistency(&mut report, consistency);

            if self.options.cancel.is_cancelled() {
                warn!("Run cancelled after stage {}", stage.name);
                report.duration_ms = start.elapsed().as_millis() as u64;
                return Ok(report);
            }
        }

        if let Some(ref step) = self.join {
            self.run_join(step, &mut report)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Run complete in {}ms: {}",
            report.duration_ms,
            if report.has_failures() {
                "some units failed"
            } else {
                "all units succeeded"
            }
        );
        Ok(report)
    }

    fn run_join(&self, step: &JoinStep, report: &mut PipelineReport) -> Result<(), PipelineError> {
        let start = Instant::now();
        let store_err = |source| PipelineError::Store {
            stage: StageName::Join,
            source,
        };
        if let Some(ref cb) = self.options.progress {
            cb.on_stage_start(StageName::Join, 0);
        }

        let upstream = step.records.list_ids().map_err(store_err)?;
        let records =
            load_records(step.records.store(), step.records.code_version()).map_err(store_err)?;
        let tables = join::join(&records);
        report.tables = write_tables(&tables, &step.tables_dir)?;

        let summary = RunSummary {
            stage: StageName::Join,
            code_version: step.code_version.clone(),
            processed: records.len(),
            skipped: 0,
            failed: 0,
            cancelled: 0,
            failures: Vec::new(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Stage join complete: {} records → {} tables in {}ms",
            summary.processed,
            report.tables.len(),
            summary.duration_ms
        );
        if let Some(ref cb) = self.options.progress {
            cb.on_stage_complete(&summary);
        }
        report.summaries.push(summary);

        let mut consistency = check(&upstream, &tables.unit_ids());
        consistency.from = Some(StageName::Parse);
        consistency.to = Some(StageName::Join);
        self.record_consistency(report, consistency);
        Ok(())
    }

    fn record_consistency(&self, report: &mut PipelineReport, consistency: ConsistencyReport) {
        consistency.log();
        if let Some(ref cb) = self.options.progress {
            cb.on_consistency_report(&consistency);
        }
        report.consistency.push(consistency);
    }
}

// ── Public entry points ──────────────────────────────────────────────────────

/// Run the configured stages end to end.
///
/// This is the primary entry point for the library.
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors, before any unit work:
/// - source PDF missing, unreadable, not a PDF, or without subjects
/// - no LLM provider configured (when the parse stage is selected)
/// - a work directory that cannot be created
///
/// Unit failures are reported in the returned [`PipelineReport`].
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    let generator: Option<Arc<dyn Generator>> = if config.runs(StageName::Parse) {
        let provider = resolve_provider(config)?;
        Some(Arc::new(LlmGenerator::new(
            provider,
            config.temperature,
            config.max_tokens,
            config.max_retries,
            config.retry_backoff_ms,
        )))
    } else {
        None
    };
    run_with_generator(config, generator).await
}

/// Like [`run_pipeline`], with a caller-supplied generator for the parse
/// stage instead of an `edgequake-llm` provider.
pub async fn run_with_generator(
    config: &PipelineConfig,
    generator: Option<Arc<dyn Generator>>,
) -> Result<PipelineReport, PipelineError> {
    info!("Starting run: stages {:?}, work dir {}", config.stages, config.work_dir.display());

    let split = if config.runs(StageName::Split) {
        let path = config.source_pdf.as_deref().ok_or_else(|| {
            PipelineError::InvalidConfig("the split stage needs a source PDF".into())
        })?;
        let source = Arc::new(read_source(path)?);
        let plan = SplitPlan::from_pdf(path, Arc::clone(&source), config.page_offset).await?;
        Some(SplitInput { plan, source })
    } else {
        None
    };

    Pipeline::from_config(config, split, generator)?.run().await
}

/// Synchronous wrapper around [`run_pipeline`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_pipeline_sync(config: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run_pipeline(config))
}

/// Compare the existing stores without running any stage.
///
/// Does not need the source PDF or an LLM provider.
pub fn check_only(config: &PipelineConfig) -> Result<Vec<ConsistencyReport>, PipelineError> {
    let split_version = config.code_version(StageName::Split, split::CODE_VERSION);
    let extract_version = config.code_version(StageName::Extract, extract::CODE_VERSION);
    let parse_version = config.code_version(StageName::Parse, parse::CODE_VERSION);

    let split_store = open_store(config.split_dir(), ArtifactKind::Pdf, StageName::Split)?;
    let text_store = open_store(config.text_dir(), ArtifactKind::Text, StageName::Extract)?;
    let parsed_store = open_store(config.parsed_dir(), ArtifactKind::Record, StageName::Parse)?;

    let current = |store: &UnitStore, version: &str, stage| {
        store
            .current_ids(version)
            .map_err(|source| PipelineError::Store { stage, source })
    };
    let split_ids = current(&split_store, &split_version, StageName::Split)?;
    let text_ids = current(&text_store, &extract_version, StageName::Extract)?;
    let parsed_ids = current(&parsed_store, &parse_version, StageName::Parse)?;

    let mut reports = Vec::with_capacity(3);
    for (to, upstream, store, version) in [
        (StageName::Extract, &split_ids, &text_store, &extract_version),
        (StageName::Parse, &text_ids, &parsed_store, &parse_version),
    ] {
        let report = check_stage(upstream_of(to), to, upstream, store, version)
            .map_err(|source| PipelineError::Store { stage: to, source })?;
        report.log();
        reports.push(report);
    }

    let joined = read_joined_ids(&config.tables_dir().join("personal.csv"))?;
    let mut report = check(&parsed_ids, &joined);
    report.from = Some(StageName::Parse);
    report.to = Some(StageName::Join);
    report.log();
    reports.push(report);

    Ok(reports)
}

// ── Internal helpers ─────────────────────────────────────────────────────────

/// Read the source PDF, validating existence, permissions and magic bytes.
fn read_source(path: &Path) -> Result<Vec<u8>, PipelineError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(PipelineError::SourceNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(PipelineError::ReadFailed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };

    if !bytes.starts_with(b"%PDF") {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }

    debug!("Read source PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

/// Unit ids in the `unit_id` column of a written `personal.csv`.
fn read_joined_ids(path: &Path) -> Result<BTreeSet<UnitId>, PipelineError> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let read_err = |detail: String| PipelineError::ReadFailed {
        path: path.to_path_buf(),
        detail,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| read_err(e.to_string()))?;
    let mut ids = BTreeSet::new();
    for row in reader.records() {
        let row = row.map_err(|e| read_err(e.to_string()))?;
        if let Some(id) = row.get(0).and_then(UnitId::parse) {
            ids.insert(id);
        }
    }
    Ok(ids)
}
