//! Stage transforms for the biography pipeline.
//!
//! Each submodule implements one step. The runner knows nothing about what a
//! stage does; it only sees a [`Transform`](crate::runner::Transform) plus a
//! declared code version, so every stage can be tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! source.pdf ──▶ split ──▶ extract ──▶ parse ──▶ join
//!               (outline)  (pdfium)    (LLM)     (CSV)
//!               <id>.pdf   <id>.txt    <id>.json six tables
//! ```
//!
//! 1. [`split`]   cut the source at its bookmarks, one PDF per subject
//! 2. [`extract`] read the text layer of each subject PDF; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`parse`]   ask the LLM for a structured record; the only stage with
//!    network I/O. Malformed replies go through [`repair`] first
//! 4. [`join`]    flatten all current records into the CSV tables
//!
//! [`pdfium`] holds the shared library binding used by split and extract.

pub mod extract;
pub mod join;
pub mod parse;
pub mod pdfium;
pub mod repair;
pub mod split;
