//! Build-verify loop controller.
//!
//! For each step, candidates are tried in a fixed order until one passes
//! sandbox verification: builtin catalog, shared-registry reuse, freshly
//! generated candidates (bounded, with failure guidance fed back), and
//! finally the deterministic template fallback. Every attempt is appended to
//! the attempt store before the next candidate is tried, so the audit trail
//! is complete even when a compile is interrupted.
//!
//! The loop guarantees progress: every step ends with *some* verified tool.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use flowforge_state::{AttemptRecord, AttemptStore};

use crate::catalog::{tool_name_for, BuiltinCatalog};
use crate::config::CompilerConfig;
use crate::domain::{
    classify_error_text, CandidateOrigin, FlowForgeError, Result, StepSpec, ToolBinding,
    ToolCandidate, ToolVerificationResult,
};
use crate::sandbox::SandboxEngine;

/// Bound on persisted error/feedback snippets.
const SNIPPET_LIMIT: usize = 500;

/// External candidate generator boundary.
///
/// Opaque to the core: given a step description, shared task context, and
/// prior failure summaries, it returns zero or more candidates. Calls are
/// bounded by `CompilerConfig::generator_timeout` on the caller side.
#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    async fn generate(
        &self,
        step: &StepSpec,
        task_context: &str,
        prior_failures: &[String],
    ) -> anyhow::Result<Vec<ToolCandidate>>;
}

/// Outcome of building one step.
#[derive(Debug, Clone)]
pub struct BuiltStep {
    pub step_id: String,
    pub candidate: ToolCandidate,
    pub verification: ToolVerificationResult,
    pub attempts: u32,
}

impl BuiltStep {
    /// The binding to attach to the step spec.
    pub fn binding(&self) -> ToolBinding {
        ToolBinding {
            name: self.candidate.name.clone(),
            code: self.candidate.code.clone(),
            origin: self.candidate.origin,
        }
    }
}

/// Orchestrates candidate selection and sandbox verification per step.
pub struct StepBuilder {
    config: CompilerConfig,
    sandbox: Arc<SandboxEngine>,
    catalog: BuiltinCatalog,
    generator: Option<Arc<dyn CandidateGenerator>>,
    attempts: Arc<dyn AttemptStore>,
}

impl StepBuilder {
    pub fn new(
        config: CompilerConfig,
        sandbox: Arc<SandboxEngine>,
        generator: Option<Arc<dyn CandidateGenerator>>,
        attempts: Arc<dyn AttemptStore>,
    ) -> Self {
        Self {
            config,
            sandbox,
            catalog: BuiltinCatalog::new(),
            generator,
            attempts,
        }
    }

    /// Build a verified tool for one step.
    ///
    /// Always returns a candidate; when every bounded attempt fails, the
    /// template fallback is accepted rather than leaving the step unbuilt.
    pub async fn build_step(
        &self,
        workflow: &str,
        step: &StepSpec,
        task_context: &str,
    ) -> Result<BuiltStep> {
        let mut attempt_index = 0u32;
        let mut seen_hashes: BTreeSet<String> = BTreeSet::new();
        let mut failure_texts: Vec<String> = self.prior_failure_guidance(step).await?;

        // (1) Builtin catalog.
        if let Some(candidate) = self.catalog.resolve(step) {
            attempt_index += 1;
            seen_hashes.insert(candidate.code_hash());
            let verification = self
                .verify_and_record(workflow, step, &candidate, attempt_index, None)
                .await?;
            if verification.success() {
                info!(step = %step.id, "builtin candidate verified");
                return Ok(BuiltStep {
                    step_id: step.id.clone(),
                    candidate,
                    verification,
                    attempts: attempt_index,
                });
            }
            failure_texts.push(verification.error_text());
        }

        // (2) Shared registry reuse.
        if let Some(candidate) = self.registry_candidate(step).await? {
            attempt_index += 1;
            seen_hashes.insert(candidate.code_hash());
            let verification = self
                .verify_and_record(
                    workflow,
                    step,
                    &candidate,
                    attempt_index,
                    Some("shared_registry_candidate"),
                )
                .await?;
            if verification.success() {
                info!(step = %step.id, "registry candidate verified");
                return Ok(BuiltStep {
                    step_id: step.id.clone(),
                    candidate,
                    verification,
                    attempts: attempt_index,
                });
            }
            failure_texts.push(verification.error_text());
        }

        // (3) Generated candidates, bounded by max_build_retries.
        if let Some(generator) = &self.generator {
            for round in 0..self.config.max_build_retries {
                let generated = match tokio::time::timeout(
                    self.config.generator_timeout,
                    generator.generate(step, task_context, &failure_texts),
                )
                .await
                {
                    Ok(Ok(candidates)) => candidates,
                    Ok(Err(e)) => {
                        warn!(step = %step.id, error = %e, "candidate generator failed");
                        break;
                    }
                    Err(_) => {
                        warn!(step = %step.id, "candidate generator timed out");
                        break;
                    }
                };

                let Some(candidate) = generated.into_iter().next() else {
                    debug!(step = %step.id, round, "generator returned no candidates");
                    break;
                };

                attempt_index += 1;
                let feedback = failure_texts.last().cloned();

                if !seen_hashes.insert(candidate.code_hash()) {
                    // Identical code will fail identically; stop the retry
                    // loop early instead of burning the budget.
                    let repeat = "repeated identical candidate code; stopping retries".to_string();
                    self.record_attempt(
                        workflow,
                        step,
                        &candidate,
                        attempt_index,
                        false,
                        Some(repeat.clone()),
                        feedback.as_deref(),
                    )
                    .await?;
                    failure_texts.push(repeat);
                    break;
                }

                let verification = self
                    .verify_and_record(workflow, step, &candidate, attempt_index, feedback.as_deref())
                    .await?;
                if verification.success() {
                    info!(step = %step.id, round, "generated candidate verified");
                    return Ok(BuiltStep {
                        step_id: step.id.clone(),
                        candidate,
                        verification,
                        attempts: attempt_index,
                    });
                }
                failure_texts.push(verification.error_text());
            }
        }

        // (4) Template fallback — guaranteed to satisfy the contract.
        let candidate = self.catalog.fallback(step);
        attempt_index += 1;
        let verification = self
            .verify_and_record(
                workflow,
                step,
                &candidate,
                attempt_index,
                Some("fallback_after_exhausted_candidates"),
            )
            .await?;
        if !verification.success() {
            // The fallback failing means the sandbox itself is broken; this
            // is the one unrecoverable build outcome.
            return Err(FlowForgeError::Build {
                step_id: step.id.clone(),
                detail: format!(
                    "template fallback failed verification: {}",
                    verification.error_text()
                ),
            });
        }
        info!(step = %step.id, attempts = attempt_index, "accepted template fallback");
        Ok(BuiltStep {
            step_id: step.id.clone(),
            candidate,
            verification,
            attempts: attempt_index,
        })
    }

    /// Guidance lines from prior failed attempts for similar steps.
    async fn prior_failure_guidance(&self, step: &StepSpec) -> Result<Vec<String>> {
        let rows = self.attempts.query_similar(&step.description, 3).await?;
        let lines: Vec<String> = rows
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                let class = r.error_class.as_deref().unwrap_or("verifier_error");
                match &r.error_snippet {
                    Some(snippet) => format!("prior failure [{class}]: {snippet}"),
                    None => format!("prior failure [{class}]"),
                }
            })
            .collect();
        Ok(lines)
    }

    /// A previously verified tool for a similar enough description.
    async fn registry_candidate(&self, step: &StepSpec) -> Result<Option<ToolCandidate>> {
        let rows = self.attempts.query_similar(&step.description, 10).await?;
        let threshold = self.config.registry_confidence_threshold;

        for row in rows {
            if !row.success || row.code.trim().is_empty() {
                continue;
            }
            // query_similar ranks by similarity but does not expose the
            // score; recompute the gate here against the reused description.
            let similarity = description_overlap(&step.description, &row.step_description);
            if similarity < threshold {
                continue;
            }
            debug!(
                step = %step.id,
                source_step = %row.step_id,
                similarity,
                "reusing registry candidate"
            );
            return Ok(Some(ToolCandidate {
                name: tool_name_for(&step.id),
                code: row.code,
                sample_input: serde_json::json!({"query": "Example user request"}),
                origin: CandidateOrigin::Registry,
            }));
        }
        Ok(None)
    }

    async fn verify_and_record(
        &self,
        workflow: &str,
        step: &StepSpec,
        candidate: &ToolCandidate,
        attempt_index: u32,
        feedback: Option<&str>,
    ) -> Result<ToolVerificationResult> {
        let verification = self
            .sandbox
            .run_with_timeout(candidate, &candidate.sample_input, step.timeout())
            .await;
        self.record_attempt(
            workflow,
            step,
            candidate,
            attempt_index,
            verification.success(),
            if verification.success() {
                None
            } else {
                Some(verification.error_text())
            },
            feedback,
        )
        .await?;
        Ok(verification)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        workflow: &str,
        step: &StepSpec,
        candidate: &ToolCandidate,
        attempt_index: u32,
        success: bool,
        error_text: Option<String>,
        feedback: Option<&str>,
    ) -> Result<()> {
        let error_class = error_text
            .as_deref()
            .map(|text| classify_error_text(text).to_string());
        let record = AttemptRecord {
            workflow: workflow.to_string(),
            step_id: step.id.clone(),
            step_description: step.description.clone(),
            tool_name: candidate.name.clone(),
            origin: candidate.origin.to_string(),
            code_hash: candidate.code_hash(),
            code: candidate.code.clone(),
            attempt_index,
            success,
            error_class,
            error_snippet: error_text.map(|t| truncate(&t, SNIPPET_LIMIT)),
            feedback_used: feedback.map(|t| truncate(t, SNIPPET_LIMIT)),
            recorded_at: Utc::now(),
        };
        self.attempts.append(record).await?;
        Ok(())
    }
}

/// Token-overlap similarity mirroring the attempt store's ranking metric.
fn description_overlap(query: &str, target: &str) -> f64 {
    let tokens = |text: &str| -> BTreeSet<String> {
        text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|t| t.len() >= 3)
            .map(|t| t.to_lowercase())
            .collect()
    };
    let left = tokens(query);
    let right = tokens(target);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxConfig;
    use flowforge_state::MemoryAttemptStore;
    use serde_json::json;

    struct ScriptedGenerator {
        codes: Vec<&'static str>,
    }

    #[async_trait]
    impl CandidateGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            step: &StepSpec,
            _task_context: &str,
            prior_failures: &[String],
        ) -> anyhow::Result<Vec<ToolCandidate>> {
            let index = prior_failures.len().min(self.codes.len() - 1);
            Ok(vec![ToolCandidate {
                name: tool_name_for(&step.id),
                code: self.codes[index].to_string(),
                sample_input: json!({"query": "example"}),
                origin: CandidateOrigin::Generated,
            }])
        }
    }

    fn builder_with(
        generator: Option<Arc<dyn CandidateGenerator>>,
        attempts: Arc<MemoryAttemptStore>,
    ) -> StepBuilder {
        let sandbox = Arc::new(SandboxEngine::new(SandboxConfig::default()));
        StepBuilder::new(CompilerConfig::default(), sandbox, generator, attempts)
    }

    #[tokio::test]
    async fn test_builtin_candidate_wins_first() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let builder = builder_with(None, attempts.clone());
        let step = StepSpec::new("now", "report the current timestamp");

        let built = builder.build_step("wf", &step, "context").await.unwrap();
        assert_eq!(built.candidate.origin, CandidateOrigin::Builtin);
        assert!(built.verification.success());
        assert_eq!(attempts.len().await, 1);
    }

    #[tokio::test]
    async fn test_generated_candidate_after_failures() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let generator = Arc::new(ScriptedGenerator {
            codes: vec![
                // First candidate crashes, second satisfies the contract.
                "exit 1\n",
                "cat > /dev/null\nprintf '{\"status\":\"ok\",\"result\":\"fixed\"}\\n'\n",
            ],
        });
        let builder = builder_with(Some(generator), attempts.clone());
        let step = StepSpec::new("transform", "perform a bespoke transformation");

        let built = builder.build_step("wf", &step, "context").await.unwrap();
        assert_eq!(built.candidate.origin, CandidateOrigin::Generated);
        assert!(built.verification.success());
        assert!(built.attempts >= 2, "failure then success recorded");
        assert_eq!(attempts.len().await as u32, built.attempts);
    }

    #[tokio::test]
    async fn test_fallback_always_produces_verified_tool() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let generator = Arc::new(ScriptedGenerator {
            codes: vec!["exit 7\n"],
        });
        let builder = builder_with(Some(generator), attempts.clone());
        let step = StepSpec::new("doomed", "perform an impossible transformation");

        let built = builder.build_step("wf", &step, "context").await.unwrap();
        assert_eq!(built.candidate.origin, CandidateOrigin::Template);
        assert!(built.verification.success(), "fallback must verify");
    }

    #[tokio::test]
    async fn test_duplicate_code_short_circuits_retries() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        // Same broken code every round.
        let generator = Arc::new(ScriptedGenerator {
            codes: vec!["exit 1\n", "exit 1\n", "exit 1\n"],
        });
        let builder = builder_with(Some(generator), attempts.clone());
        let step = StepSpec::new("repeat", "perform a bespoke transformation");

        let built = builder.build_step("wf", &step, "context").await.unwrap();
        assert_eq!(built.candidate.origin, CandidateOrigin::Template);

        let recent = attempts.recent(Some("wf"), 20).await.unwrap();
        let dup = recent
            .iter()
            .filter(|r| {
                r.error_snippet
                    .as_deref()
                    .is_some_and(|s| s.contains("repeated identical"))
            })
            .count();
        assert_eq!(dup, 1, "one duplicate marker, then fallback");
    }

    #[tokio::test]
    async fn test_registry_reuse_of_prior_success() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let good_code = "cat > /dev/null\nprintf '{\"status\":\"ok\",\"result\":\"reused\"}\\n'\n";
        attempts
            .append(AttemptRecord {
                workflow: "earlier".to_string(),
                step_id: "clean".to_string(),
                step_description: "normalize the customer record fields".to_string(),
                tool_name: "tool_clean".to_string(),
                origin: "generated".to_string(),
                code_hash: "h".to_string(),
                code: good_code.to_string(),
                attempt_index: 1,
                success: true,
                error_class: None,
                error_snippet: None,
                feedback_used: None,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();

        let builder = builder_with(None, attempts.clone());
        let step = StepSpec::new("clean2", "normalize the customer record fields");

        let built = builder.build_step("wf", &step, "context").await.unwrap();
        assert_eq!(built.candidate.origin, CandidateOrigin::Registry);
        assert!(built.verification.success());
        assert_eq!(built.candidate.name, "tool_clean2");
    }
}
