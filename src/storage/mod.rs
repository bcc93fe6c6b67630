//! Persistence layer.
//!
//! Both the work queue and the report log are small key→record JSON
//! documents. Each store reads and rewrites its whole document under a
//! store-wide write lock; documents hold hundreds of entries at most.

pub mod report_store;
pub mod work_store;

pub use report_store::ReportStore;
pub use work_store::WorkStore;

use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::types::RunnerError;

pub(crate) type Document = Map<String, Value>;

/// Create the document (and its parent directory) as `{}` if missing.
pub(crate) fn ensure_document(path: &Path) -> Result<(), RunnerError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            RunnerError::Storage(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }
    write_document(path, &Document::new())?;
    debug!(path = %path.display(), "Created empty document");
    Ok(())
}

/// Read a document. A missing or blank file reads as empty.
pub(crate) fn read_document(path: &Path) -> Result<Document, RunnerError> {
    if !path.exists() {
        return Ok(Document::new());
    }

    let json = std::fs::read_to_string(path)
        .map_err(|e| RunnerError::Storage(format!("Failed to read {}: {e}", path.display())))?;
    if json.trim().is_empty() {
        return Ok(Document::new());
    }

    serde_json::from_str(&json).map_err(|e| {
        RunnerError::Configuration(format!("Malformed document {}: {e}", path.display()))
    })
}

/// Replace a document. Written to a sibling temp file and renamed into
/// place so readers never observe a half-written file.
pub(crate) fn write_document(path: &Path, document: &Document) -> Result<(), RunnerError> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| RunnerError::Storage(format!("Failed to serialise document: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| RunnerError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| RunnerError::Storage(format!("Failed to replace {}: {e}", path.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
