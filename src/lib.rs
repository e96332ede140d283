//! # bio2csv
//!
//! Turn a biographical reference work (one PDF, one bookmark per subject)
//! into relational CSV tables, one stage at a time, re-doing only the work
//! whose inputs or code changed.
//!
//! ## Why this crate?
//!
//! The expensive step is the LLM call that turns a subject's free text into a
//! structured record. A source of a few hundred subjects takes a while and
//! costs real money, so re-running everything after a prompt tweak or a
//! crash is not an option. Every intermediate artifact is therefore stored
//! per subject with a provenance sidecar (code version + input fingerprint),
//! and a stage only recomputes units whose artifact is missing or stale.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source.pdf
//!  │
//!  ├─ 1. Split    bookmarks → one PDF per subject     split/<id>.pdf
//!  ├─ 2. Extract  text layer via pdfium               text/<id>.txt
//!  ├─ 3. Parse    LLM → BiographyRecord (+ repair)    parsed/<id>.json
//!  ├─ 4. Join     records → six CSV tables            tables/*.csv
//!  └─ *  Check    unit sets agree between stages      consistency report
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bio2csv::{run_pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from EDGEQUAKE_LLM_PROVIDER / OPENAI_API_KEY / …
//!     let config = PipelineConfig::builder()
//!         .work_dir("work")
//!         .source_pdf("women_in_math.pdf")
//!         .page_offset(12)
//!         .build()?;
//!     let report = run_pipeline(&config).await?;
//!     for summary in &report.summaries {
//!         eprintln!(
//!             "{}: {} processed, {} skipped, {} failed",
//!             summary.stage, summary.processed, summary.skipped, summary.failed
//!         );
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `bio2csv` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod consistency;
pub mod driver;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod runner;
pub mod store;
pub mod unit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{parse_code_version, PipelineConfig, PipelineConfigBuilder, StageName};
pub use consistency::ConsistencyReport;
pub use driver::{check_only, run_pipeline, run_pipeline_sync, run_with_generator, PipelineReport};
pub use error::{ParseFailure, PipelineError, StoreError, TransformError};
pub use pipeline::parse::Generator;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use record::BiographyRecord;
pub use runner::{CancelFlag, RunSummary};
pub use store::{ArtifactKind, UnitStore};
pub use unit::{Unit, UnitId};
