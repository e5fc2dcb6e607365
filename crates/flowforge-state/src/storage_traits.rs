//! Storage trait definitions for FlowForge
//!
//! These traits define the storage abstractions behind the compile loop:
//! - `AttemptStore`: append-only build-attempt and execution-report telemetry
//! - `VersionRegistry`: stable artifact version management (promote/history)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; file-backed implementations live in
//! `jsonl` and `registry_fs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

// ---------------------------------------------------------------------------
// AttemptStore — build attempt and execution telemetry
// ---------------------------------------------------------------------------

/// One immutable line of build-attempt telemetry.
///
/// Records are append-only: once written they are never mutated or deleted.
/// `code` is retained alongside `code_hash` so the registry-reuse tier of the
/// build loop can rebind a previously verified tool without a second store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Workflow the attempt belongs to.
    pub workflow: String,

    /// Step identifier within the workflow spec.
    pub step_id: String,

    /// Human-readable step description (drives similarity lookup).
    pub step_description: String,

    /// Name of the candidate tool.
    pub tool_name: String,

    /// Candidate origin tag (`builtin`, `registry`, `generated`, `template`).
    pub origin: String,

    /// SHA-256 hex of the candidate code.
    pub code_hash: String,

    /// Candidate code at the time of the attempt.
    pub code: String,

    /// 1-based index of the attempt within one step's build.
    pub attempt_index: u32,

    /// Whether verification passed.
    pub success: bool,

    /// Coarse error class when verification failed.
    pub error_class: Option<String>,

    /// Bounded error text snippet.
    pub error_snippet: Option<String>,

    /// Guidance text that was fed into the candidate generator, if any.
    pub feedback_used: Option<String>,

    /// When the attempt was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Append-only attempt/telemetry store.
///
/// Guarantees:
/// - `append` is atomic per record: readers never observe partial records.
/// - Records append in the order attempts are dispatched by one builder.
/// - `query_similar` ranks failed attempts first by token similarity so the
///   build loop can seed candidate generation with prior failure guidance.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Append one attempt record.
    async fn append(&self, record: AttemptRecord) -> StorageResult<()>;

    /// Most recent records, newest first, optionally scoped to one workflow.
    async fn recent(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<AttemptRecord>>;

    /// Prior failed attempts most similar to `description`, best match first.
    async fn query_similar(
        &self,
        description: &str,
        k: usize,
    ) -> StorageResult<Vec<AttemptRecord>>;

    /// Append one execution report (opaque JSON payload) for a workflow.
    async fn append_report(
        &self,
        workflow: &str,
        report: serde_json::Value,
    ) -> StorageResult<()>;

    /// Most recent execution reports for a workflow, newest first.
    async fn recent_reports(
        &self,
        workflow: &str,
        limit: usize,
    ) -> StorageResult<Vec<serde_json::Value>>;
}

// ---------------------------------------------------------------------------
// VersionRegistry — stable artifact versions
// ---------------------------------------------------------------------------

/// One promoted stable version. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StableVersion {
    /// Normalized workflow name.
    pub workflow: String,

    /// Monotonically increasing version number (previous max + 1).
    pub version: u64,

    /// Snapshot of the optimized spec at promotion time.
    pub spec: serde_json::Value,

    /// Stability score that justified the promotion.
    pub stability_score: f64,

    /// When the promotion happened.
    pub promoted_at: DateTime<Utc>,
}

/// Append-only version registry.
///
/// Guarantees:
/// - `promote` assigns the previous maximum version for the name plus one.
/// - Prior versions are never mutated, deleted, or overwritten.
#[async_trait]
pub trait VersionRegistry: Send + Sync {
    /// Register a new stable version for `workflow` and return it.
    async fn promote(
        &self,
        workflow: &str,
        spec: serde_json::Value,
        stability_score: f64,
    ) -> StorageResult<StableVersion>;

    /// The highest promoted version for `workflow`, if any.
    async fn latest(&self, workflow: &str) -> StorageResult<Option<StableVersion>>;

    /// All promoted versions for `workflow`, ascending by version number.
    async fn history(&self, workflow: &str) -> StorageResult<Vec<StableVersion>>;
}

/// Sanitize a workflow name for use as a registry key or directory name.
///
/// Non-alphanumeric characters collapse to `_`; an empty result falls back
/// to `"workflow"`.
pub fn normalize_workflow_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "workflow".to_string()
    } else {
        trimmed
    }
}
