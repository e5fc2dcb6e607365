//! Optimization pass pipeline.
//!
//! Pure IR -> IR transformations over a validated spec. Passes run in a
//! fixed order, each producing a new spec value, and the whole pipeline is
//! idempotent: optimizing an already-optimized spec yields an equal spec.

pub mod passes;

use tracing::debug;

use crate::domain::{Result, WorkflowSpec};
use crate::validate::{validate, ValidatedSpec};

pub use passes::{CriticalPathPass, DependencyInferencePass, ParallelGroupPass};

/// One pure spec transformation.
pub trait OptimizationPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, spec: &WorkflowSpec) -> Result<WorkflowSpec>;
}

/// A spec that passed the full pass pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedSpec(WorkflowSpec);

impl OptimizedSpec {
    pub fn spec(&self) -> &WorkflowSpec {
        &self.0
    }

    pub fn into_inner(self) -> WorkflowSpec {
        self.0
    }

    /// Id of the unique terminal (synthesis) step.
    pub fn terminal_id(&self) -> &str {
        self.0
            .terminal_step()
            .map(|s| s.id.as_str())
            .unwrap_or_default()
    }
}

/// Ordered pass pipeline.
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::standard()
    }
}

impl Optimizer {
    /// The standard pipeline: dependency inference, parallel grouping,
    /// critical-path estimation.
    pub fn standard() -> Self {
        Self {
            passes: vec![
                Box::new(DependencyInferencePass),
                Box::new(ParallelGroupPass),
                Box::new(CriticalPathPass),
            ],
        }
    }

    pub fn with_passes(passes: Vec<Box<dyn OptimizationPass>>) -> Self {
        Self { passes }
    }

    /// Run the pipeline over a validated spec.
    ///
    /// The result is revalidated, so a pass that breaks a structural
    /// invariant surfaces as a `Structural` error here rather than at
    /// execution time.
    pub fn optimize(&self, validated: ValidatedSpec) -> Result<OptimizedSpec> {
        let mut current = validated.into_inner();
        let mut trace: Vec<serde_json::Value> = Vec::with_capacity(self.passes.len());

        for pass in &self.passes {
            current = pass.apply(&current)?;
            debug!(pass = pass.name(), "optimization pass applied");
            trace.push(serde_json::Value::String(pass.name().to_string()));
        }

        current
            .metadata
            .insert("optimization_trace".to_string(), trace.into());

        let revalidated = validate(current)?;
        Ok(OptimizedSpec(revalidated.into_inner()))
    }
}
