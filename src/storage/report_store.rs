//! Append-only outcome log.
//!
//! Key → list of [`ReportEntry`], keyed like the work queue. Cleared by
//! provisioning, accumulated during runs, rendered into per-key digests
//! for the notification sink.

use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ensure_document, read_document, write_document, Document};
use crate::types::{ReportEntry, ReportStatus, RunMode, RunnerError};

pub struct ReportStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ReportStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let path = path.into();
        ensure_document(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Reset the log to an empty document.
    pub async fn clear(&self) -> Result<(), RunnerError> {
        let _guard = self.write_lock.lock().await;
        write_document(&self.path, &Document::new())?;
        debug!(path = %self.path.display(), "Reports cleared");
        Ok(())
    }

    pub async fn append(
        &self,
        key: &str,
        text: impl Into<String>,
        success: ReportStatus,
    ) -> Result<(), RunnerError> {
        let entry = ReportEntry {
            text: text.into(),
            success,
            recorded_at: chrono::Utc::now(),
        };

        let _guard = self.write_lock.lock().await;
        let mut document = read_document(&self.path)?;
        let mut entries = entries_of(&document, key)?;
        entries.push(entry);

        let value = serde_json::to_value(&entries)
            .map_err(|e| RunnerError::Storage(format!("Failed to serialise report: {e}")))?;
        document.insert(key.to_string(), value);
        write_document(&self.path, &document)
    }

    pub async fn entries(&self, key: &str) -> Result<Vec<ReportEntry>, RunnerError> {
        entries_of(&read_document(&self.path)?, key)
    }

    /// Render every entry for `key`, or `None` when there is nothing to report.
    pub async fn get_digest(
        &self,
        key: &str,
        label: &str,
        address: Option<&str>,
        last_module: bool,
        mode: RunMode,
    ) -> Result<Option<String>, RunnerError> {
        let entries = self.entries(key).await?;
        Ok(render_digest(&entries, label, address, last_module, mode))
    }
}

fn entries_of(document: &Document, key: &str) -> Result<Vec<ReportEntry>, RunnerError> {
    match document.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| RunnerError::Configuration(format!("Malformed report for {key}: {e}"))),
    }
}

/// Build the human-readable digest for one key.
pub fn render_digest(
    entries: &[ReportEntry],
    label: &str,
    address: Option<&str>,
    last_module: bool,
    mode: RunMode,
) -> Option<String> {
    if entries.is_empty() {
        return None;
    }

    let mut digest = String::with_capacity(64 * (entries.len() + 2));
    digest.push_str(label);
    digest.push('\n');
    if let Some(address) = address {
        digest.push_str(address);
        digest.push('\n');
    }
    digest.push('\n');

    for entry in entries {
        digest.push_str(entry.success.glyph());
        digest.push_str(&entry.text);
        digest.push('\n');
    }

    if last_module {
        let ok = entries
            .iter()
            .filter(|e| e.success == ReportStatus::Success)
            .count();
        digest.push_str(&format!(
            "\n{}: {ok}/{} actions succeeded\nAll work for this account is finished\n",
            mode.title(),
            entries.len()
        ));
    }

    Some(digest.trim_end().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
