//! Filesystem version registry and artifact sink.
//!
//! The registry keeps one JSON document per workflow name:
//!
//! ```text
//! <root>/versions/<name>.json      — ascending list of StableVersion rows
//! ```
//!
//! The artifact sink writes one directory per promoted version:
//!
//! ```text
//! <root>/artifacts/<name>/<version>/spec.json
//! <root>/artifacts/<name>/<version>/tools/<tool>.sh
//! <root>/artifacts/<name>/<version>/runbook.md
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::storage_traits::{normalize_workflow_name, StableVersion, VersionRegistry};

/// File-backed [`VersionRegistry`].
pub struct FsVersionRegistry {
    root: PathBuf,
    // One promotion at a time; reads do not take the lock.
    promote_lock: Mutex<()>,
}

impl FsVersionRegistry {
    /// Open (creating directories as needed) a registry rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("versions"))?;
        Ok(Self {
            root,
            promote_lock: Mutex::new(()),
        })
    }

    fn registry_path(&self, name: &str) -> PathBuf {
        self.root.join("versions").join(format!("{name}.json"))
    }

    fn load(&self, name: &str) -> StorageResult<Vec<StableVersion>> {
        let path = self.registry_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut versions: Vec<StableVersion> = serde_json::from_str(&raw)?;
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    fn store(&self, name: &str, versions: &[StableVersion]) -> StorageResult<()> {
        let path = self.registry_path(name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(versions)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl VersionRegistry for FsVersionRegistry {
    async fn promote(
        &self,
        workflow: &str,
        spec: serde_json::Value,
        stability_score: f64,
    ) -> StorageResult<StableVersion> {
        let name = normalize_workflow_name(workflow);
        let _guard = self.promote_lock.lock().await;

        let mut versions = self.load(&name)?;
        let next = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let record = StableVersion {
            workflow: name.clone(),
            version: next,
            spec,
            stability_score,
            promoted_at: Utc::now(),
        };
        versions.push(record.clone());
        self.store(&name, &versions)?;
        info!(workflow = %name, version = next, score = stability_score, "promoted stable version");
        Ok(record)
    }

    async fn latest(&self, workflow: &str) -> StorageResult<Option<StableVersion>> {
        let name = normalize_workflow_name(workflow);
        Ok(self.load(&name)?.into_iter().max_by_key(|v| v.version))
    }

    async fn history(&self, workflow: &str) -> StorageResult<Vec<StableVersion>> {
        let name = normalize_workflow_name(workflow);
        self.load(&name)
    }
}

/// Executable payload written next to a promoted spec.
#[derive(Debug, Clone, Default)]
pub struct ExecutionArtifact {
    /// Tool name -> script body.
    pub tool_scripts: BTreeMap<String, String>,

    /// Human-readable runbook contents.
    pub runbook: String,
}

/// Writes the per-version artifact directory for a promotion.
pub struct ArtifactSink {
    root: PathBuf,
}

impl ArtifactSink {
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory for one (workflow, version) pair.
    pub fn version_dir(&self, workflow: &str, version: u64) -> PathBuf {
        self.root
            .join(normalize_workflow_name(workflow))
            .join(version.to_string())
    }

    /// Write the optimized spec serialization, tool scripts, and runbook.
    ///
    /// Refuses to overwrite an existing version directory — promoted
    /// artifacts are immutable.
    pub fn write(
        &self,
        workflow: &str,
        version: u64,
        spec: &serde_json::Value,
        artifact: &ExecutionArtifact,
    ) -> StorageResult<PathBuf> {
        let dir = self.version_dir(workflow, version);
        if dir.exists() {
            return Err(StorageError::VersionConflict {
                workflow: normalize_workflow_name(workflow),
                detail: format!("artifact directory for version {version} already exists"),
            });
        }
        let tools_dir = dir.join("tools");
        std::fs::create_dir_all(&tools_dir)?;

        std::fs::write(dir.join("spec.json"), serde_json::to_vec_pretty(spec)?)?;
        for (name, code) in &artifact.tool_scripts {
            std::fs::write(tools_dir.join(format!("{name}.sh")), code)?;
        }
        std::fs::write(dir.join("runbook.md"), &artifact.runbook)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_promote_assigns_monotonic_versions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsVersionRegistry::open(dir.path()).unwrap();

        let v1 = registry
            .promote("demo", serde_json::json!({"steps": []}), 0.8)
            .await
            .unwrap();
        let v2 = registry
            .promote("demo", serde_json::json!({"steps": []}), 0.9)
            .await
            .unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = FsVersionRegistry::open(dir.path()).unwrap();
            registry
                .promote("demo", serde_json::json!({}), 0.8)
                .await
                .unwrap();
        }

        let registry = FsVersionRegistry::open(dir.path()).unwrap();
        let history = registry.history("demo").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);

        let v2 = registry
            .promote("demo", serde_json::json!({}), 0.9)
            .await
            .unwrap();
        assert_eq!(v2.version, 2, "numbering continues after reopen");
    }

    #[tokio::test]
    async fn test_artifact_sink_writes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ArtifactSink::open(dir.path()).unwrap();

        let mut artifact = ExecutionArtifact::default();
        artifact
            .tool_scripts
            .insert("tool_fetch".to_string(), "printf hi\n".to_string());
        artifact.runbook = "# Runbook\n".to_string();

        let written = sink
            .write("My Demo", 1, &serde_json::json!({"name": "My Demo"}), &artifact)
            .unwrap();

        assert!(written.join("spec.json").exists());
        assert!(written.join("tools/tool_fetch.sh").exists());
        assert!(written.join("runbook.md").exists());
    }

    #[tokio::test]
    async fn test_artifact_sink_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ArtifactSink::open(dir.path()).unwrap();
        let artifact = ExecutionArtifact::default();

        sink.write("demo", 1, &serde_json::json!({}), &artifact)
            .unwrap();
        let second = sink.write("demo", 1, &serde_json::json!({}), &artifact);
        assert!(matches!(
            second,
            Err(StorageError::VersionConflict { .. })
        ));
    }
}
