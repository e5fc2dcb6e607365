//! The closed compile loop.
//!
//! validate -> build verified tools -> optimize -> execute -> on failure,
//! reflect and patch the IR, then recompile -- bounded by `max_reflections`.
//! After a successful pass, confirmation runs gather the repeated-execution
//! evidence the stability evaluator needs before promotion.
//!
//! Only structural errors abort. Build failures, sandbox timeouts, contract
//! violations, and execution failures are absorbed up to their bounds and
//! surfaced in the outcome: a compile that completes with fallback tools or
//! without a promotion is a normal, observable result.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use flowforge_state::{ArtifactSink, AttemptStore, ExecutionArtifact, StableVersion, VersionRegistry};

use crate::builder::{CandidateGenerator, StepBuilder};
use crate::config::CompilerConfig;
use crate::domain::{ExecutionReport, FlowForgeError, Result, WorkflowSpec};
use crate::executor::GraphExecutor;
use crate::optimize::{OptimizedSpec, Optimizer};
use crate::reflect::ReflectionController;
use crate::sandbox::SandboxEngine;
use crate::stability::{StabilityEvaluator, StabilityVerdict};
use crate::validate::{validate, ValidatedSpec};

/// Result of one full compile.
#[derive(Debug)]
pub struct CompileOutcome {
    /// The final optimized spec (the last good one when reflection ran out).
    pub spec: OptimizedSpec,

    /// Every execution report gathered across iterations, oldest first.
    pub reports: Vec<ExecutionReport>,

    pub verdict: StabilityVerdict,

    /// The promoted version, when stability cleared the gate.
    pub promoted: Option<StableVersion>,

    /// Reflection iterations actually used.
    pub iterations: u32,
}

impl CompileOutcome {
    /// The most recent execution report.
    pub fn final_report(&self) -> Option<&ExecutionReport> {
        self.reports.last()
    }

    /// Whether the most recent execution fully succeeded.
    pub fn succeeded(&self) -> bool {
        self.final_report()
            .map(|r| r.terminal_succeeded())
            .unwrap_or(false)
    }
}

/// Compiles workflow specs into verified, versioned executable artifacts.
pub struct WorkflowCompiler {
    config: CompilerConfig,
    sandbox: Arc<SandboxEngine>,
    optimizer: Optimizer,
    attempts: Arc<dyn AttemptStore>,
    registry: Arc<dyn VersionRegistry>,
    generator: Option<Arc<dyn CandidateGenerator>>,
    artifacts: Option<ArtifactSink>,
}

impl WorkflowCompiler {
    /// Create a compiler over the given stores.
    pub fn new(
        config: CompilerConfig,
        attempts: Arc<dyn AttemptStore>,
        registry: Arc<dyn VersionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let sandbox = Arc::new(SandboxEngine::new(config.sandbox.clone()));
        Ok(Self {
            config,
            sandbox,
            optimizer: Optimizer::standard(),
            attempts,
            registry,
            generator: None,
            artifacts: None,
        })
    }

    /// Attach the external candidate generator.
    pub fn with_generator(mut self, generator: Arc<dyn CandidateGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Attach an artifact sink for promoted versions.
    pub fn with_artifacts(mut self, artifacts: ArtifactSink) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Run the full compile loop over `spec`.
    pub async fn compile(&self, spec: WorkflowSpec, input: Value) -> Result<CompileOutcome> {
        let workflow = spec.name.clone();
        info!(workflow = %workflow, "compile started");

        // Structural errors abort here, before any build or execute work.
        let validated = validate(spec)?;

        let bound = self.build_tools(&workflow, validated).await?;

        let executor = GraphExecutor::new(Arc::clone(&self.sandbox), self.config.parallelism_limit);
        let reflector =
            ReflectionController::new(self.config.max_reflections, Arc::clone(&self.attempts));
        let evaluator = StabilityEvaluator::new(
            self.config.stability_threshold,
            self.config.min_stability_samples,
        );

        let mut current = bound;
        let mut reports: Vec<ExecutionReport> = Vec::new();
        let mut last_good: Option<OptimizedSpec> = None;
        let mut last_optimized: Option<OptimizedSpec> = None;
        let mut iteration = 0u32;
        let mut run_index = 0u32;

        loop {
            let optimized = self.optimizer.optimize(current.clone())?;
            last_optimized = Some(optimized.clone());

            let report = executor.execute(&optimized, &input, run_index).await;
            run_index += 1;
            self.record_report(&workflow, &report).await;
            let succeeded = report.terminal_succeeded();
            reports.push(report.clone());

            if succeeded {
                info!(iteration, "execution succeeded; gathering confirmation evidence");
                last_good = Some(optimized.clone());
                for _ in 0..self.config.confirmation_runs {
                    let confirmation = executor.execute(&optimized, &input, run_index).await;
                    run_index += 1;
                    self.record_report(&workflow, &confirmation).await;
                    reports.push(confirmation);
                }
                break;
            }

            let Some(patch) = reflector.reflect(&report, optimized.spec(), iteration).await?
            else {
                info!(iteration, "no further patch available; keeping last good spec");
                break;
            };
            info!(iteration, ?patch, "applying reflection patch");

            // Patches produce a new spec value; the executed spec is never
            // mutated. A patch that breaks a structural invariant ends the
            // loop instead of aborting the whole compile.
            let patched = ReflectionController::apply(optimized.spec(), &patch);
            match validate(patched) {
                Ok(next) => current = next,
                Err(e) => {
                    warn!(error = %e, "reflection patch produced an invalid spec; stopping");
                    break;
                }
            }
            iteration += 1;
        }

        let verdict = evaluator.evaluate(&reports);
        // The loop body always runs at least once, so one of these is set.
        let final_spec = match last_good.or(last_optimized) {
            Some(spec) => spec,
            None => {
                return Err(FlowForgeError::Structural(
                    "compile loop produced no optimized spec".to_string(),
                ))
            }
        };

        let promoted = evaluator
            .promote(&self.registry, &workflow, &final_spec, &verdict)
            .await?;

        if let Some(version) = &promoted {
            self.write_artifact(&workflow, version, &final_spec, &verdict)?;
        }

        info!(
            workflow = %workflow,
            iterations = iteration,
            runs = reports.len(),
            stable = verdict.stable,
            promoted = promoted.as_ref().map(|v| v.version),
            "compile finished"
        );

        Ok(CompileOutcome {
            spec: final_spec,
            reports,
            verdict,
            promoted,
            iterations: iteration,
        })
    }

    /// Bind a verified tool to every step via the build-verify loop.
    async fn build_tools(&self, workflow: &str, validated: ValidatedSpec) -> Result<ValidatedSpec> {
        let builder = StepBuilder::new(
            self.config.clone(),
            Arc::clone(&self.sandbox),
            self.generator.clone(),
            Arc::clone(&self.attempts),
        );

        let mut spec = validated.into_inner();
        let task_context = spec
            .metadata
            .get("requirements")
            .and_then(Value::as_str)
            .unwrap_or(&spec.description)
            .to_string();

        let mut bindings = Vec::with_capacity(spec.steps.len());
        for step in &spec.steps {
            // Reflection may have already bound a replacement; keep it.
            if step.tool.is_some() {
                continue;
            }
            let built = builder.build_step(workflow, step, &task_context).await?;
            bindings.push((step.id.clone(), built.binding()));
        }
        for (step_id, binding) in bindings {
            if let Some(step) = spec.steps.iter_mut().find(|s| s.id == step_id) {
                step.tool = Some(binding);
            }
        }

        // Tool binding cannot break structure, but the wrapper is the proof.
        validate(spec)
    }

    async fn record_report(&self, workflow: &str, report: &ExecutionReport) {
        match serde_json::to_value(report) {
            Ok(value) => {
                if let Err(e) = self.attempts.append_report(workflow, value).await {
                    warn!(error = %e, "failed to append execution report");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize execution report"),
        }
    }

    fn write_artifact(
        &self,
        workflow: &str,
        version: &StableVersion,
        spec: &OptimizedSpec,
        verdict: &StabilityVerdict,
    ) -> Result<()> {
        let Some(sink) = &self.artifacts else {
            return Ok(());
        };

        let mut artifact = ExecutionArtifact::default();
        for step in &spec.spec().steps {
            if let Some(tool) = &step.tool {
                artifact
                    .tool_scripts
                    .insert(tool.name.clone(), tool.code.clone());
            }
        }
        artifact.runbook = render_runbook(spec.spec(), version, verdict);

        let snapshot = serde_json::to_value(spec.spec())?;
        let dir = sink.write(workflow, version.version, &snapshot, &artifact)?;
        info!(path = %dir.display(), "wrote artifact directory");
        Ok(())
    }
}

/// Human-readable runbook for a promoted version.
fn render_runbook(
    spec: &WorkflowSpec,
    version: &StableVersion,
    verdict: &StabilityVerdict,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} v{}\n\n", spec.name, version.version));
    if !spec.description.is_empty() {
        out.push_str(&format!("{}\n\n", spec.description));
    }
    out.push_str(&format!(
        "Stability score {:.3} over {} execution reports.\n\n",
        verdict.score, verdict.sample_count
    ));
    out.push_str("## Steps\n\n");
    for step in &spec.steps {
        let tool = step
            .tool
            .as_ref()
            .map(|t| format!("{} ({})", t.name, t.origin))
            .unwrap_or_else(|| "unbound".to_string());
        out.push_str(&format!("- `{}` — {} — tool: {}\n", step.id, step.description, tool));
    }
    out.push_str("\n## Edges\n\n");
    for edge in &spec.edges {
        let marker = if edge.explicit { "" } else { " (inferred)" };
        out.push_str(&format!("- {} -> {}{}\n", edge.from, edge.to, marker));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_runbook_lists_steps_and_edges() {
        use crate::domain::{CandidateOrigin, EdgeSpec, StepSpec, ToolBinding};
        use chrono::Utc;

        let mut spec = WorkflowSpec::new("digest");
        let mut fetch = StepSpec::new("fetch", "fetch the feed");
        fetch.tool = Some(ToolBinding {
            name: "tool_fetch".to_string(),
            code: "printf ok\n".to_string(),
            origin: CandidateOrigin::Builtin,
        });
        spec.steps.push(fetch);
        spec.steps.push(StepSpec::new("summarize", "combine results"));
        spec.edges.push(EdgeSpec::new("fetch", "summarize"));

        let version = StableVersion {
            workflow: "digest".to_string(),
            version: 3,
            spec: serde_json::json!({}),
            stability_score: 0.9,
            promoted_at: Utc::now(),
        };
        let verdict = StabilityVerdict {
            score: 0.9,
            sample_count: 5,
            stable: true,
            reason: "stable workflow artifact".to_string(),
        };

        let runbook = render_runbook(&spec, &version, &verdict);
        assert!(runbook.contains("# digest v3"));
        assert!(runbook.contains("tool_fetch (builtin)"));
        assert!(runbook.contains("fetch -> summarize"));
    }
}
