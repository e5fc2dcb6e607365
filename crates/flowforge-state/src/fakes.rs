//! In-memory fakes for testing and default compiler wiring.
//!
//! Behaviorally equivalent to the file-backed implementations, minus
//! persistence. Safe for concurrent use via an internal async mutex.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StorageResult;
use crate::similarity::description_similarity;
use crate::storage_traits::{
    normalize_workflow_name, AttemptRecord, AttemptStore, StableVersion, VersionRegistry,
};

/// In-memory append-only attempt store.
#[derive(Default)]
pub struct MemoryAttemptStore {
    records: Mutex<Vec<AttemptRecord>>,
    reports: Mutex<BTreeMap<String, Vec<serde_json::Value>>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of recorded attempts (test helper).
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether no attempts have been recorded (test helper).
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn append(&self, record: AttemptRecord) -> StorageResult<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn recent(
        &self,
        workflow: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<AttemptRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| workflow.map_or(true, |w| r.workflow == w))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn query_similar(
        &self,
        description: &str,
        k: usize,
    ) -> StorageResult<Vec<AttemptRecord>> {
        let records = self.records.lock().await;
        Ok(rank_similar(&records, description, k))
    }

    async fn append_report(
        &self,
        workflow: &str,
        report: serde_json::Value,
    ) -> StorageResult<()> {
        self.reports
            .lock()
            .await
            .entry(workflow.to_string())
            .or_default()
            .push(report);
        Ok(())
    }

    async fn recent_reports(
        &self,
        workflow: &str,
        limit: usize,
    ) -> StorageResult<Vec<serde_json::Value>> {
        let reports = self.reports.lock().await;
        Ok(reports
            .get(workflow)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Rank `records` against `description`, failures first, best match first.
///
/// Failed attempts carry the guidance the build loop wants; successful
/// attempts follow so the registry-reuse tier can still find verified code.
pub(crate) fn rank_similar(
    records: &[AttemptRecord],
    description: &str,
    k: usize,
) -> Vec<AttemptRecord> {
    let mut scored: Vec<(f64, &AttemptRecord)> = records
        .iter()
        .map(|r| (description_similarity(description, &r.step_description), r))
        .filter(|(score, _)| *score > 0.0)
        .collect();

    // Failures first, then similarity descending, then newest first.
    scored.sort_by(|(sa, ra), (sb, rb)| {
        ra.success
            .cmp(&rb.success)
            .then(sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal))
            .then(rb.recorded_at.cmp(&ra.recorded_at))
    });

    scored.into_iter().take(k).map(|(_, r)| r.clone()).collect()
}

/// In-memory append-only version registry.
#[derive(Default)]
pub struct MemoryVersionRegistry {
    entries: Mutex<BTreeMap<String, Vec<StableVersion>>>,
}

impl MemoryVersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionRegistry for MemoryVersionRegistry {
    async fn promote(
        &self,
        workflow: &str,
        spec: serde_json::Value,
        stability_score: f64,
    ) -> StorageResult<StableVersion> {
        let name = normalize_workflow_name(workflow);
        let mut entries = self.entries.lock().await;
        let versions = entries.entry(name.clone()).or_default();
        let next = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let record = StableVersion {
            workflow: name,
            version: next,
            spec,
            stability_score,
            promoted_at: Utc::now(),
        };
        versions.push(record.clone());
        Ok(record)
    }

    async fn latest(&self, workflow: &str) -> StorageResult<Option<StableVersion>> {
        let name = normalize_workflow_name(workflow);
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&name)
            .and_then(|versions| versions.iter().max_by_key(|v| v.version).cloned()))
    }

    async fn history(&self, workflow: &str) -> StorageResult<Vec<StableVersion>> {
        let name = normalize_workflow_name(workflow);
        let entries = self.entries.lock().await;
        let mut versions = entries.get(&name).cloned().unwrap_or_default();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }
}
