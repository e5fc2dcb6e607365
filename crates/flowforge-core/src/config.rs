//! Compiler configuration surface.
//!
//! Heuristic constants (registry reuse confidence, stability thresholds) are
//! deliberately configuration rather than hard-coded values — their original
//! derivations are unspecified, so operators tune them here.

use std::time::Duration;

use crate::domain::{FlowForgeError, Result};
use crate::sandbox::SandboxConfig;

/// Top-level configuration recognized by the compile loop.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Bound on generated-candidate attempts per step (>= 0).
    pub max_build_retries: u32,

    /// Bound on reflection iterations per compile (>= 0).
    pub max_reflections: u32,

    /// Concurrent step executions during a runtime pass (>= 1).
    pub parallelism_limit: usize,

    /// Minimum recency-weighted success score for promotion (0.0–1.0).
    pub stability_threshold: f64,

    /// Minimum execution reports before promotion is considered (>= 1).
    pub min_stability_samples: usize,

    /// Extra confirmation executions after a successful pass, gathering the
    /// repeated-execution evidence promotion requires.
    pub confirmation_runs: u32,

    /// Minimum similarity for reusing a registry candidate (0.0–1.0).
    pub registry_confidence_threshold: f64,

    /// Caller-side bound on one candidate-generator call.
    pub generator_timeout: Duration,

    /// Sandbox settings shared by verification and step execution.
    pub sandbox: SandboxConfig,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_build_retries: 3,
            max_reflections: 2,
            parallelism_limit: 4,
            stability_threshold: 0.75,
            min_stability_samples: 3,
            confirmation_runs: 2,
            registry_confidence_threshold: 0.55,
            generator_timeout: Duration::from_secs(60),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl CompilerConfig {
    /// Reject out-of-bounds settings before any compile work begins.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism_limit < 1 {
            return Err(FlowForgeError::Config(
                "parallelism_limit must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.stability_threshold) {
            return Err(FlowForgeError::Config(
                "stability_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.min_stability_samples < 1 {
            return Err(FlowForgeError::Config(
                "min_stability_samples must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.registry_confidence_threshold) {
            return Err(FlowForgeError::Config(
                "registry_confidence_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.sandbox.runner.is_empty() {
            return Err(FlowForgeError::Config(
                "sandbox runner argv cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
