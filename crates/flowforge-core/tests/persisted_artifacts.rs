//! Compile loop over the file-backed stores.
//!
//! Verifies the persisted artifact layout: JSONL attempt telemetry, the
//! per-name version registry document, and the per-version artifact
//! directory (spec serialization, tool scripts, runbook).

use std::sync::Arc;

use serde_json::json;

use flowforge_core::{
    ArtifactSink, AttemptStore, CompilerConfig, EdgeSpec, FsVersionRegistry, JsonlAttemptStore,
    StepSpec, VersionRegistry, WorkflowCompiler, WorkflowSpec,
};

fn feed_digest_spec() -> WorkflowSpec {
    let mut spec = WorkflowSpec::new("feed digest");
    spec.description = "Summarize a feed and stamp the digest time.".to_string();

    let mut stamp = StepSpec::new("stamp", "record the current timestamp");
    stamp.timeout_seconds = 10;
    let mut condense = StepSpec::new("condense", "summarize the feed content");
    condense.timeout_seconds = 10;
    let mut digest = StepSpec::new("digest", "produce the final digest");
    digest.timeout_seconds = 10;

    spec.steps.extend([stamp, condense, digest]);
    spec.edges.push(EdgeSpec::new("stamp", "digest"));
    spec.edges.push(EdgeSpec::new("condense", "digest"));
    spec
}

#[tokio::test]
async fn compile_persists_attempts_versions_and_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let attempts = Arc::new(JsonlAttemptStore::open(root.path().join("telemetry")).unwrap());
    let registry = Arc::new(FsVersionRegistry::open(root.path().join("registry")).unwrap());
    let artifacts = ArtifactSink::open(root.path().join("artifacts")).unwrap();

    let config = CompilerConfig {
        min_stability_samples: 3,
        confirmation_runs: 2,
        ..CompilerConfig::default()
    };
    let compiler = WorkflowCompiler::new(
        config,
        Arc::clone(&attempts) as Arc<dyn AttemptStore>,
        Arc::clone(&registry) as Arc<dyn VersionRegistry>,
    )
    .unwrap()
    .with_artifacts(artifacts);

    let outcome = compiler
        .compile(feed_digest_spec(), json!({"query": "daily feed"}))
        .await
        .unwrap();

    assert!(outcome.succeeded());
    let promoted = outcome.promoted.expect("stable compile promotes");
    assert_eq!(promoted.version, 1);
    assert_eq!(promoted.workflow, "feed_digest");

    // Telemetry: one attempt per step at minimum, plus every report.
    let records = attempts.recent(None, 100).await.unwrap();
    assert!(records.len() >= 3);
    assert!(root.path().join("telemetry/attempts.jsonl").exists());
    let reports = attempts.recent_reports("feed digest", 100).await.unwrap();
    assert_eq!(reports.len(), 3, "initial run plus two confirmations");

    // Registry document for the normalized name.
    assert!(root.path().join("registry/versions/feed_digest.json").exists());
    let latest = registry.latest("feed digest").await.unwrap().unwrap();
    assert_eq!(latest.version, 1);

    // Artifact directory layout.
    let version_dir = root.path().join("artifacts/feed_digest/1");
    assert!(version_dir.join("spec.json").exists());
    assert!(version_dir.join("runbook.md").exists());
    let tools: Vec<_> = std::fs::read_dir(version_dir.join("tools"))
        .unwrap()
        .collect();
    assert_eq!(tools.len(), 3, "one script per bound step");

    let runbook = std::fs::read_to_string(version_dir.join("runbook.md")).unwrap();
    assert!(runbook.contains("# feed digest v1"));
    assert!(runbook.contains("stamp -> digest"));
}

#[tokio::test]
async fn second_compile_reuses_registry_and_bumps_version() {
    let root = tempfile::tempdir().unwrap();
    let attempts = Arc::new(JsonlAttemptStore::open(root.path().join("telemetry")).unwrap());
    let registry = Arc::new(FsVersionRegistry::open(root.path().join("registry")).unwrap());

    let config = CompilerConfig {
        min_stability_samples: 3,
        confirmation_runs: 2,
        ..CompilerConfig::default()
    };

    for expected_version in 1..=2u64 {
        let compiler = WorkflowCompiler::new(
            config.clone(),
            Arc::clone(&attempts) as Arc<dyn AttemptStore>,
            Arc::clone(&registry) as Arc<dyn VersionRegistry>,
        )
        .unwrap();
        let outcome = compiler
            .compile(feed_digest_spec(), json!({"query": "daily feed"}))
            .await
            .unwrap();
        assert_eq!(
            outcome.promoted.map(|v| v.version),
            Some(expected_version),
            "promotion is monotonic across compiles"
        );
    }

    let history = registry.history("feed digest").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].version < history[1].version);
}
