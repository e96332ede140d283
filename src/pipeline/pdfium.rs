//! Binding to the pdfium shared library.
//!
//! Lookup order:
//!
//! 1. `PDFIUM_LIB_PATH`, when set and the file exists
//! 2. the platform library name in the working directory (`./libpdfium.so`)
//! 3. the system library search path
//!
//! Binding happens inside each blocking task, the same way every pdfium call
//! in this crate is confined to `spawn_blocking`.

use crate::error::PipelineError;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Bind to pdfium, trying each location in turn.
pub fn bind() -> Result<Pdfium, PipelineError> {
    if let Ok(env_path) = std::env::var("PDFIUM_LIB_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            debug!("Binding pdfium from PDFIUM_LIB_PATH {}", path.display());
            return Pdfium::bind_to_library(&path)
                .map(Pdfium::new)
                .map_err(|e| {
                    PipelineError::PdfiumBindingFailed(format!("{}: {:?}", path.display(), e))
                });
        }
        warn!(
            "PDFIUM_LIB_PATH '{}' not found; trying the working directory",
            path.display()
        );
    }

    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{:?}", e)))
}

/// True when some pdfium library can be bound.
pub fn is_available() -> bool {
    bind().is_ok()
}
