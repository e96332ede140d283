//! Error types for the bio2csv library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`PipelineError`] is **fatal**: the run cannot start or cannot finish its
//!   bookkeeping (missing source PDF, no LLM credential, unwritable work
//!   directory). Returned as `Err(PipelineError)` from [`crate::run_pipeline`]
//!   before any per-unit work has been attempted.
//!
//! * [`TransformError`] is **non-fatal**: a single unit failed (corrupt page
//!   range, generator timeout, unparseable response). Recorded in
//!   [`crate::runner::RunSummary`] while sibling units keep going.
//!
//! * [`StoreError`] is returned by [`crate::store::UnitStore`]. `NotFound` is an
//!   expected outcome that drives reprocessing, `Corrupt` triggers reprocessing
//!   with a warning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::config::StageName;

/// All fatal errors returned by the bio2csv library.
///
/// Unit-level failures use [`TransformError`] and are stored in
/// [`crate::runner::RunSummary`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Source PDF was not found at the given path.
    #[error("Source PDF not found: '{path}'\nCheck the path exists and is readable.")]
    SourceNotFound { path: PathBuf },

    /// Process does not have read permission on the source.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// PDF header/trailer/xref or outline is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// The outline yielded no subject bookmarks at all.
    #[error("No subject bookmarks found in '{path}' (page offset {page_offset})")]
    NoUnits { path: PathBuf, page_offset: usize },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium, or place the library in the working\n\
directory or on the system library path.\n"
    )]
    PdfiumBindingFailed(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a pipeline output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A unit store could not be listed or opened.
    #[error("Store error in stage '{stage}': {source}")]
    Store {
        stage: StageName,
        #[source]
        source: StoreError,
    },

    /// Reading a previously produced file failed.
    #[error("Failed to read '{path}': {detail}")]
    ReadFailed { path: PathBuf, detail: String },

    /// HTTP submission failed before any payload was accepted.
    #[error("Request to '{url}' failed: {reason}")]
    RequestFailed { url: String, reason: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by [`crate::store::UnitStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// No artifact exists for the unit. Expected; means "must process".
    #[error("No artifact for unit '{unit_id}'")]
    NotFound { unit_id: String },

    /// An artifact exists but cannot be trusted (digest mismatch, bad
    /// provenance, structurally invalid payload).
    #[error("Corrupt artifact for unit '{unit_id}': {detail}")]
    Corrupt { unit_id: String, detail: String },

    /// Underlying filesystem failure.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A generator response that could not be turned into a record, even after
/// local repair.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("unit '{unit_id}': unparseable response ({reason})")]
pub struct ParseFailure {
    pub unit_id: String,
    pub raw_response: String,
    pub reason: String,
}

/// A non-fatal error for a single unit.
///
/// Stored alongside the unit id in [`crate::runner::RunSummary`]. The stage
/// continues with the remaining units.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum TransformError {
    /// The upstream artifact could not be loaded.
    #[error("input unavailable: {detail}")]
    InputUnavailable { detail: String },

    /// pdfium failed on this unit's pages.
    #[error("PDF processing failed: {detail}")]
    Pdf { detail: String },

    /// Input payload was not valid UTF-8 text.
    #[error("input is not valid UTF-8: {detail}")]
    Encoding { detail: String },

    /// The generator call failed after retries.
    #[error("generator call failed after {retries} retries: {detail}")]
    Generator { retries: u32, detail: String },

    /// The generator call did not finish in time.
    #[error("generator call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The response was not structurally valid JSON, even after repair.
    #[error(transparent)]
    Parse(ParseFailure),

    /// The output could not be persisted.
    #[error("could not store output: {detail}")]
    Store { detail: String },
}

impl From<ParseFailure> for TransformError {
    fn from(failure: ParseFailure) -> Self {
        TransformError::Parse(failure)
    }
}
