//! Extract stage: single-subject PDF → plain UTF-8 text.
//!
//! Text comes straight from the PDF's text layer via pdfium; pages are joined
//! with a newline in page order. No OCR: the source is a born-digital reference
//! work, and a unit whose pages carry no text yields an empty text file rather
//! than a failure. The parse stage then sees an empty entry, which the
//! consistency report makes visible downstream.

use super::pdfium;
use crate::error::TransformError;
use crate::runner::Transform;
use crate::unit::UnitId;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Declared revision of the extract logic.
pub const CODE_VERSION: &str = "extract-v1";

/// Stateless; pdfium is bound per call inside `spawn_blocking`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractTransform;

fn extract_text_blocking(pdf: &[u8]) -> Result<String, String> {
    let pdfium = pdfium::bind().map_err(|e| e.to_string())?;
    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| format!("{:?}", e))?;

    let mut pages = Vec::new();
    for (idx, page) in document.pages().iter().enumerate() {
        let text = page
            .text()
            .map_err(|e| format!("page {}: {:?}", idx + 1, e))?;
        pages.push(text.all());
    }
    Ok(pages.join("\n"))
}

#[async_trait]
impl Transform for ExtractTransform {
    async fn apply(&self, unit_id: &UnitId, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        let pdf = input.to_vec();
        let text = tokio::task::spawn_blocking(move || extract_text_blocking(&pdf))
            .await
            .map_err(|e| TransformError::Pdf {
                detail: format!("extract task panicked: {e}"),
            })?
            .map_err(|detail| TransformError::Pdf { detail })?;

        if text.trim().is_empty() {
            warn!("{}: no text layer", unit_id);
        } else {
            debug!("{}: {} chars of text", unit_id, text.chars().count());
        }
        Ok(text.into_bytes())
    }
}
