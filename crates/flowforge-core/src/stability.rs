//! Stability evaluation and version promotion.
//!
//! The stability score is the recency-weighted fraction of execution reports
//! whose terminal step fully succeeded (linear weights, newest report
//! heaviest). Promotion requires the score to meet the configured threshold
//! over a minimum sample of reports; version numbers are assigned by the
//! registry and strictly increase per workflow name.
//!
//! A declined promotion is a normal outcome, not an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flowforge_state::{StableVersion, VersionRegistry};

use crate::domain::{ExecutionReport, Result};
use crate::optimize::OptimizedSpec;

/// Verdict over a sequence of execution reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityVerdict {
    /// Recency-weighted success fraction in [0.0, 1.0].
    pub score: f64,

    pub sample_count: usize,

    /// Whether the score and sample count clear the promotion gate.
    pub stable: bool,

    pub reason: String,
}

/// Computes stability verdicts and gates promotion.
pub struct StabilityEvaluator {
    threshold: f64,
    min_samples: usize,
}

impl StabilityEvaluator {
    pub fn new(threshold: f64, min_samples: usize) -> Self {
        Self {
            threshold,
            min_samples: min_samples.max(1),
        }
    }

    /// Score `reports` (ordered oldest to newest).
    pub fn evaluate(&self, reports: &[ExecutionReport]) -> StabilityVerdict {
        if reports.is_empty() {
            return StabilityVerdict {
                score: 0.0,
                sample_count: 0,
                stable: false,
                reason: "no execution reports available".to_string(),
            };
        }

        // Linear recency weights: report i (1-based) weighs i.
        let mut weighted_success = 0.0f64;
        let mut total_weight = 0.0f64;
        for (index, report) in reports.iter().enumerate() {
            let weight = (index + 1) as f64;
            total_weight += weight;
            if report.terminal_succeeded() {
                weighted_success += weight;
            }
        }
        let score = weighted_success / total_weight;

        let enough_samples = reports.len() >= self.min_samples;
        let stable = enough_samples && score >= self.threshold;
        let reason = if stable {
            "stable workflow artifact".to_string()
        } else if !enough_samples {
            format!(
                "insufficient evidence: {} of {} required reports",
                reports.len(),
                self.min_samples
            )
        } else {
            format!(
                "score {score:.3} below stability threshold {:.3}",
                self.threshold
            )
        };

        debug!(score, samples = reports.len(), stable, "stability evaluated");
        StabilityVerdict {
            score,
            sample_count: reports.len(),
            stable,
            reason,
        }
    }

    /// Promote `spec` when `verdict` clears the gate.
    ///
    /// Returns `None` when the verdict is not stable — a normal
    /// non-promotion outcome, never an error.
    pub async fn promote(
        &self,
        registry: &Arc<dyn VersionRegistry>,
        workflow: &str,
        spec: &OptimizedSpec,
        verdict: &StabilityVerdict,
    ) -> Result<Option<StableVersion>> {
        if !verdict.stable {
            debug!(workflow, reason = %verdict.reason, "promotion declined");
            return Ok(None);
        }
        let snapshot = serde_json::to_value(spec.spec())?;
        let version = registry
            .promote(workflow, snapshot, verdict.score)
            .await?;
        info!(
            workflow,
            version = version.version,
            score = verdict.score,
            "promoted stable version"
        );
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunStatus, StepSpec, WorkflowSpec};
    use crate::optimize::Optimizer;
    use crate::validate::validate;
    use chrono::Utc;
    use flowforge_state::MemoryVersionRegistry;
    use uuid::Uuid;

    fn report(succeeded: bool) -> ExecutionReport {
        ExecutionReport {
            run_id: Uuid::new_v4(),
            workflow: "demo".to_string(),
            spec_digest: "d".repeat(64),
            status: if succeeded {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            steps: vec![],
            final_output: None,
            failure_summary: None,
            started_at: Utc::now(),
            duration_ms: 5,
            iteration: 0,
        }
    }

    fn reports(pattern: &[bool]) -> Vec<ExecutionReport> {
        pattern.iter().map(|&ok| report(ok)).collect()
    }

    fn optimized_spec() -> OptimizedSpec {
        let mut spec = WorkflowSpec::new("demo");
        spec.steps.push(StepSpec::new("answer", "produce the answer"));
        Optimizer::standard()
            .optimize(validate(spec).unwrap())
            .unwrap()
    }

    #[test]
    fn test_empty_reports_are_unstable() {
        let verdict = StabilityEvaluator::new(0.75, 5).evaluate(&[]);
        assert!(!verdict.stable);
        assert_eq!(verdict.sample_count, 0);
    }

    #[test]
    fn test_eight_of_ten_successes_clears_075() {
        // Two early failures, eight recent successes.
        let mut pattern = vec![false, false];
        pattern.extend(std::iter::repeat(true).take(8));
        let verdict = StabilityEvaluator::new(0.75, 5).evaluate(&reports(&pattern));
        assert!(verdict.stable, "score {} should clear 0.75", verdict.score);
    }

    #[test]
    fn test_three_of_ten_successes_fails_075() {
        // Even with the successes most recent, 3/10 cannot clear 0.75.
        let mut pattern = vec![false; 7];
        pattern.extend(std::iter::repeat(true).take(3));
        let verdict = StabilityEvaluator::new(0.75, 5).evaluate(&reports(&pattern));
        assert!(!verdict.stable, "score {} should miss 0.75", verdict.score);
    }

    #[test]
    fn test_recent_failures_weigh_heavier() {
        let early_failures = reports(&[false, false, true, true, true]);
        let late_failures = reports(&[true, true, true, false, false]);
        let evaluator = StabilityEvaluator::new(0.75, 1);
        assert!(
            evaluator.evaluate(&early_failures).score
                > evaluator.evaluate(&late_failures).score
        );
    }

    #[test]
    fn test_min_samples_gate() {
        let verdict = StabilityEvaluator::new(0.5, 5).evaluate(&reports(&[true, true]));
        assert!(!verdict.stable);
        assert!(verdict.reason.contains("insufficient evidence"));
    }

    #[tokio::test]
    async fn test_promote_gated_on_verdict() {
        let registry: Arc<dyn VersionRegistry> = Arc::new(MemoryVersionRegistry::new());
        let evaluator = StabilityEvaluator::new(0.75, 5);
        let spec = optimized_spec();

        let mut pattern = vec![false, false];
        pattern.extend(std::iter::repeat(true).take(8));
        let good = evaluator.evaluate(&reports(&pattern));
        let promoted = evaluator
            .promote(&registry, "demo", &spec, &good)
            .await
            .unwrap();
        assert_eq!(promoted.map(|v| v.version), Some(1));

        let bad = evaluator.evaluate(&reports(&[false; 10]));
        let declined = evaluator
            .promote(&registry, "demo", &spec, &bad)
            .await
            .unwrap();
        assert!(declined.is_none());
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let registry: Arc<dyn VersionRegistry> = Arc::new(MemoryVersionRegistry::new());
        let evaluator = StabilityEvaluator::new(0.5, 1);
        let spec = optimized_spec();
        let verdict = evaluator.evaluate(&reports(&[true, true, true]));

        let mut last = 0u64;
        for _ in 0..3 {
            let version = evaluator
                .promote(&registry, "demo", &spec, &verdict)
                .await
                .unwrap()
                .expect("stable verdict promotes");
            assert!(version.version > last);
            last = version.version;
        }
    }
}
