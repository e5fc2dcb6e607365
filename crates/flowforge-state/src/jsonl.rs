//! Append-only JSONL attempt store.
//!
//! One JSON object per line, one `write` syscall per record, so concurrent
//! readers never observe a partial record. Attempts and execution reports
//! live in separate files under the store root:
//!
//! ```text
//! <root>/attempts.jsonl
//! <root>/reports/<workflow>.jsonl
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{StorageError, StorageResult};
use crate::fakes::rank_similar;
use crate::storage_traits::{normalize_workflow_name, AttemptRecord, AttemptStore};

/// File-backed [`AttemptStore`].
pub struct JsonlAttemptStore {
    root: PathBuf,
    // Serializes appends; reads go straight to the file.
    write_lock: Mutex<()>,
}

impl JsonlAttemptStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("reports"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn attempts_path(&self) -> PathBuf {
        self.root.join("attempts.jsonl")
    }

    fn reports_path(&self, workflow: &str) -> PathBuf {
        self.root
            .join("reports")
            .join(format!("{}.jsonl", normalize_workflow_name(workflow)))
    }

    fn append_line(path: &Path, value: &serde_json::Value) -> StorageResult<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        // Single write call keeps the record append atomic for readers.
        file.write_all(&line)?;
        Ok(())
    }

    fn read_lines(path: &Path) -> StorageResult<Vec<serde_json::Value>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(line).map_err(|e| StorageError::CorruptRecord {
                    path: path.display().to_string(),
                    line: idx + 1,
                    detail: e.to_string(),
                })?;
            rows.push(value);
        }
        Ok(rows)
    }

    fn load_attempts(&self) -> StorageResult<Vec<AttemptRecord>> {
        let rows = Self::read_lines(&self.attempts_path())?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<AttemptRecord>(row) {
                Ok(record) => records.push(record),
                // Skip rather than fail: one old-schema line must not poison
                // the whole telemetry history.
                Err(e) => warn!(error = %e, "skipping unreadable attempt record"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl AttemptStore for JsonlAttemptStore {
    async fn append(&self, record: AttemptRecord) -> StorageResult<()> {
        let value = serde_json::to_value(&record)?;
        let _guard = self.write_lock.lock().await;
        Self::append_line(&self.attempts_path(), &value)
    }

    async fn recent(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<AttemptRecord>> {
        let records = self.load_attempts()?;
        Ok(records
            .into_iter()
            .rev()
            .filter(|r| workflow.map_or(true, |w| r.workflow == w))
            .take(limit)
            .collect())
    }

    async fn query_similar(
        &self,
        description: &str,
        k: usize,
    ) -> StorageResult<Vec<AttemptRecord>> {
        let records = self.load_attempts()?;
        Ok(rank_similar(&records, description, k))
    }

    async fn append_report(
        &self,
        workflow: &str,
        report: serde_json::Value,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        Self::append_line(&self.reports_path(workflow), &report)
    }

    async fn recent_reports(
        &self,
        workflow: &str,
        limit: usize,
    ) -> StorageResult<Vec<serde_json::Value>> {
        let rows = Self::read_lines(&self.reports_path(workflow))?;
        Ok(rows.into_iter().rev().take(limit).collect())
    }
}
