//! Structural validation and normalization of workflow specs.
//!
//! `validate` runs its checks in a fixed order and fails fast with the first
//! violated invariant. Normalization fills default policy values when absent
//! — that is the only mutation the validator performs; structural errors are
//! never repaired.

use std::collections::BTreeSet;

use crate::domain::{FlowForgeError, Result, RetryPolicy, WorkflowSpec};
use crate::graph;

/// A workflow spec that passed structural validation.
///
/// The wrapper is the proof: later stages (build loop, optimizer, executor)
/// only accept a `ValidatedSpec`, so no unvalidated IR reaches them.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSpec(WorkflowSpec);

impl ValidatedSpec {
    pub fn spec(&self) -> &WorkflowSpec {
        &self.0
    }

    pub fn into_inner(self) -> WorkflowSpec {
        self.0
    }

    /// Id of the unique terminal (synthesis) step.
    pub fn terminal_id(&self) -> &str {
        // Validation guaranteed exactly one sink.
        self.0
            .terminal_step()
            .map(|s| s.id.as_str())
            .unwrap_or_default()
    }
}

/// Validate `spec`, normalizing absent policy fields.
///
/// Checks, in order:
/// (a) non-empty step set with unique, non-blank ids;
/// (b) every edge endpoint resolves to a known step;
/// (c) the edge relation is acyclic (the error names a step on the cycle);
/// (d) exactly one terminal step with out-degree zero;
/// (e) every step reachable from at least one root;
/// (f) `timeout_seconds > 0` and `max_attempts >= 1`.
///
/// Idempotent: validating a `ValidatedSpec`'s inner spec again yields an
/// equal result.
pub fn validate(mut spec: WorkflowSpec) -> Result<ValidatedSpec> {
    // (a) step ids
    if spec.steps.is_empty() {
        return Err(FlowForgeError::Structural(
            "workflow must include at least one step".to_string(),
        ));
    }
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for step in &spec.steps {
        let id = step.id.trim();
        if id.is_empty() {
            return Err(FlowForgeError::Structural(
                "step ids cannot be blank".to_string(),
            ));
        }
        if !seen.insert(id) {
            return Err(FlowForgeError::Structural(format!(
                "duplicate step id '{id}'"
            )));
        }
    }

    // (b) edge endpoints
    for edge in &spec.edges {
        if !seen.contains(edge.from.as_str()) {
            return Err(FlowForgeError::Structural(format!(
                "edge source does not exist: '{}'",
                edge.from
            )));
        }
        if !seen.contains(edge.to.as_str()) {
            return Err(FlowForgeError::Structural(format!(
                "edge target does not exist: '{}'",
                edge.to
            )));
        }
    }

    // (c) acyclicity
    if let Err(cycle) = graph::topological_order(&spec) {
        let member = cycle.first().cloned().unwrap_or_default();
        return Err(FlowForgeError::Structural(format!(
            "workflow graph contains a cycle through step '{member}'"
        )));
    }

    // (d) single terminal
    let sinks = graph::sinks(&spec);
    if sinks.len() != 1 {
        return Err(FlowForgeError::Structural(format!(
            "workflow must have exactly one terminal step, found {}: [{}]",
            sinks.len(),
            sinks.join(", ")
        )));
    }

    // (e) reachability
    let reachable = graph::reachable_from_roots(&spec);
    for step in &spec.steps {
        if !reachable.contains(&step.id) {
            return Err(FlowForgeError::Structural(format!(
                "step '{}' is not reachable from any root step",
                step.id
            )));
        }
    }

    // (f) policy bounds
    for step in &spec.steps {
        if step.timeout_seconds == 0 {
            return Err(FlowForgeError::Structural(format!(
                "step '{}' timeout_seconds must be positive",
                step.id
            )));
        }
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(FlowForgeError::Structural(format!(
                    "step '{}' retry max_attempts must be >= 1",
                    step.id
                )));
            }
        }
    }

    // Normalization: fill the default retry policy where absent.
    for step in &mut spec.steps {
        if step.retry.is_none() {
            step.retry = Some(RetryPolicy::default());
        }
    }

    Ok(ValidatedSpec(spec))
}
