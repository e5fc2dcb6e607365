//! Reflection: turning execution failures into IR patches.
//!
//! Pure at the seam that matters: `reflect` inspects a report and a spec and
//! emits a patch; `apply` constructs a new spec value. The spec an in-flight
//! execution is reading is never mutated.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flowforge_state::AttemptStore;

use crate::catalog::{tool_name_for, BuiltinCatalog};
use crate::domain::{
    CandidateOrigin, ErrorClass, ExecutionReport, Result, StepStatus, ToolBinding, WorkflowSpec,
};
use crate::graph;

/// Widening caps, mirroring the bounded doubling the compile loop relies on.
const MAX_WIDENED_TIMEOUT_SECONDS: u64 = 900;
const MAX_WIDENED_ATTEMPTS: u32 = 10;

/// Dominant failure shape of one execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TimeoutHeavy,
    ContractHeavy,
    DependencyMissing,
    SynthesisStarved,
}

/// One bounded mutation of the IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IrPatch {
    /// Rebind a step to the next-best verified candidate.
    ReplaceTool { step_id: String, binding: ToolBinding },

    /// Grow a step's timeout and attempt budget (doubling, capped).
    WidenPolicy {
        step_id: String,
        timeout_seconds: u64,
        max_attempts: u32,
    },

    /// Remove a structurally unnecessary (inferred) edge.
    DropEdge { from: String, to: String },
}

/// Classifies failures and emits bounded IR patches.
pub struct ReflectionController {
    max_reflections: u32,
    attempts: Arc<dyn AttemptStore>,
    catalog: BuiltinCatalog,
}

impl ReflectionController {
    pub fn new(max_reflections: u32, attempts: Arc<dyn AttemptStore>) -> Self {
        Self {
            max_reflections,
            attempts,
            catalog: BuiltinCatalog::new(),
        }
    }

    /// Classify the dominant failure in `report`, if any step failed.
    pub fn classify(&self, report: &ExecutionReport) -> Option<FailureKind> {
        let failing = report.failing_steps();
        if failing.is_empty() && report.terminal_succeeded() {
            return None;
        }

        // Starvation: the terminal had nothing to work with.
        let starved = report
            .failure_summary
            .as_deref()
            .is_some_and(|s| s.contains("no usable inputs"));
        if starved {
            return Some(FailureKind::SynthesisStarved);
        }
        if failing.is_empty() {
            // Terminal-only failure with inputs present: treat like a
            // contract problem with the synthesis tool itself.
            return Some(FailureKind::ContractHeavy);
        }

        let mut counts: BTreeMap<FailureKind, usize> = BTreeMap::new();
        for step in &failing {
            let kind = match (step.status, step.error_class) {
                (StepStatus::TimedOut, _) | (_, Some(ErrorClass::Timeout)) => {
                    FailureKind::TimeoutHeavy
                }
                (_, Some(ErrorClass::ContractViolation)) => FailureKind::ContractHeavy,
                (_, Some(ErrorClass::MissingDependency)) => FailureKind::DependencyMissing,
                _ => FailureKind::ContractHeavy,
            };
            *counts.entry(kind).or_insert(0) += 1;
        }

        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(kind, _)| kind)
    }

    /// Emit a patch for `report`, or `None` when nothing failed or the
    /// iteration budget is exhausted (the caller keeps the last good
    /// spec/report pair in that case).
    pub async fn reflect(
        &self,
        report: &ExecutionReport,
        spec: &WorkflowSpec,
        iteration: u32,
    ) -> Result<Option<IrPatch>> {
        if report.terminal_succeeded() {
            return Ok(None);
        }
        if iteration >= self.max_reflections {
            info!(iteration, "reflection budget exhausted; keeping last good spec");
            return Ok(None);
        }

        let Some(kind) = self.classify(report) else {
            return Ok(None);
        };
        debug!(?kind, iteration, "classified dominant failure");

        let patch = match kind {
            FailureKind::TimeoutHeavy => self.widen_slowest(report, spec),
            FailureKind::ContractHeavy => self.replace_worst_tool(report, spec).await?,
            FailureKind::DependencyMissing => self
                .drop_unnecessary_edge(report, spec)
                .or(self.replace_worst_tool(report, spec).await?),
            FailureKind::SynthesisStarved => {
                // Repair the root-most failure so the terminal gets inputs.
                self.replace_worst_tool(report, spec).await?
            }
        };
        Ok(patch)
    }

    /// Apply `patch`, producing a new spec value.
    pub fn apply(spec: &WorkflowSpec, patch: &IrPatch) -> WorkflowSpec {
        let mut out = spec.clone();
        match patch {
            IrPatch::ReplaceTool { step_id, binding } => {
                if let Some(step) = out.steps.iter_mut().find(|s| &s.id == step_id) {
                    step.tool = Some(binding.clone());
                }
            }
            IrPatch::WidenPolicy {
                step_id,
                timeout_seconds,
                max_attempts,
            } => {
                if let Some(step) = out.steps.iter_mut().find(|s| &s.id == step_id) {
                    step.timeout_seconds = *timeout_seconds;
                    let mut policy = step.retry_policy();
                    policy.max_attempts = *max_attempts;
                    step.retry = Some(policy);
                }
            }
            IrPatch::DropEdge { from, to } => {
                out.edges.retain(|e| !(e.from == *from && e.to == *to));
            }
        }
        out
    }

    /// Widen the policy of the step that timed out.
    fn widen_slowest(&self, report: &ExecutionReport, spec: &WorkflowSpec) -> Option<IrPatch> {
        let timed_out = report
            .failing_steps()
            .into_iter()
            .find(|s| s.status == StepStatus::TimedOut || s.error_class == Some(ErrorClass::Timeout))?;
        let step = spec.step(&timed_out.step_id)?;
        Some(IrPatch::WidenPolicy {
            step_id: step.id.clone(),
            timeout_seconds: (step.timeout_seconds * 2).clamp(60, MAX_WIDENED_TIMEOUT_SECONDS),
            max_attempts: (step.retry_policy().max_attempts + 1).min(MAX_WIDENED_ATTEMPTS),
        })
    }

    /// Rebind the first failing step to the next-best verified candidate:
    /// a registry tool with different code if one exists, else the template
    /// fallback (which always satisfies the contract).
    async fn replace_worst_tool(
        &self,
        report: &ExecutionReport,
        spec: &WorkflowSpec,
    ) -> Result<Option<IrPatch>> {
        let target = match report.failing_steps().first() {
            Some(step) => step.step_id.clone(),
            // Starved terminal: repair the first failed or skipped upstream.
            None => report
                .steps
                .iter()
                .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::TimedOut))
                .map(|s| s.step_id.clone())
                .unwrap_or_else(|| report.workflow.clone()),
        };
        let Some(step) = spec.step(&target) else {
            return Ok(None);
        };
        let current_code = step.tool.as_ref().map(|t| t.code.clone()).unwrap_or_default();

        let rows = self.attempts.query_similar(&step.description, 10).await?;
        for row in rows {
            if row.success && !row.code.trim().is_empty() && row.code != current_code {
                return Ok(Some(IrPatch::ReplaceTool {
                    step_id: step.id.clone(),
                    binding: ToolBinding {
                        name: tool_name_for(&step.id),
                        code: row.code,
                        origin: CandidateOrigin::Registry,
                    },
                }));
            }
        }

        let fallback = self.catalog.fallback(step);
        if fallback.code == current_code {
            // Already on the fallback; rebinding it again cannot help.
            return Ok(None);
        }
        Ok(Some(IrPatch::ReplaceTool {
            step_id: step.id.clone(),
            binding: ToolBinding {
                name: fallback.name,
                code: fallback.code,
                origin: CandidateOrigin::Template,
            },
        }))
    }

    /// Drop an inferred edge into a failing step when the graph stays valid
    /// without it (target still reachable, terminal still reached).
    fn drop_unnecessary_edge(
        &self,
        report: &ExecutionReport,
        spec: &WorkflowSpec,
    ) -> Option<IrPatch> {
        for failing in report.failing_steps() {
            for edge in &spec.edges {
                if edge.explicit || edge.to != failing.step_id {
                    continue;
                }
                let mut trimmed = spec.clone();
                trimmed
                    .edges
                    .retain(|e| !(e.from == edge.from && e.to == edge.to));
                let still_reachable =
                    graph::reachable_from_roots(&trimmed).len() == trimmed.steps.len();
                let single_terminal = graph::sinks(&trimmed).len() == 1;
                if still_reachable && single_terminal {
                    return Some(IrPatch::DropEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                    });
                }
            }
        }
        None
    }
}
