//! Workflow intermediate representation.
//!
//! A [`WorkflowSpec`] is pure data: steps, edges, and metadata. It carries no
//! behavior beyond accessors and digest computation, and is treated as
//! immutable once validated — optimization passes and reflection patches
//! construct new values rather than mutating a spec an execution may be
//! reading.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::candidate::CandidateOrigin;
use super::digest;

/// Default per-step wall-clock budget, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

/// Default backoff base, in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;

/// Per-step retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be >= 1.
    pub max_attempts: u32,

    /// Base delay for exponential backoff between attempts.
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retrying after `attempt` (1-based) failed.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        std::time::Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// A verified tool bound to a step by the build loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBinding {
    /// Tool name (derived from the step id).
    pub name: String,

    /// Opaque code handle: a script body executed by the sandbox runner.
    pub code: String,

    /// Where the bound candidate came from.
    pub origin: CandidateOrigin,
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique identifier within the spec.
    pub id: String,

    /// Human-readable description; drives candidate generation and
    /// similarity lookup.
    pub description: String,

    /// Bound tool, set by the build loop. Replaceable only by reflection.
    #[serde(default)]
    pub tool: Option<ToolBinding>,

    /// Wall-clock budget per attempt. Must be positive.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Retry policy; `None` until normalization fills the default.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Parallel-group tag, assigned by optimization only.
    #[serde(default)]
    pub parallel_group: Option<String>,

    /// Named inputs this step consumes (dependency inference source).
    #[serde(default)]
    pub reads: Vec<String>,

    /// Named outputs this step produces (dependency inference source).
    #[serde(default)]
    pub writes: Vec<String>,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl StepSpec {
    /// Minimal step with defaults for everything but id and description.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry: None,
            parallel_group: None,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Effective retry policy (default single attempt when unset).
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }

    /// Per-attempt timeout as a duration.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

/// A directed dependency edge between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,

    /// Authored edges are explicit; dependency inference adds non-explicit
    /// ones. Inference never removes an explicit edge; reflection may drop
    /// either.
    #[serde(default = "default_true")]
    pub explicit: bool,
}

fn default_true() -> bool {
    true
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            explicit: true,
        }
    }

    pub fn inferred(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            explicit: false,
        }
    }
}

/// Root IR artifact: a named DAG of steps with global metadata.
///
/// Invariants (enforced by `validate`): step ids unique; edges reference
/// existing steps; the edge relation is acyclic; exactly one terminal
/// (synthesis) step with out-degree zero, reachable from every other step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<StepSpec>,

    #[serde(default)]
    pub edges: Vec<EdgeSpec>,

    /// Requirements text, plan, intent, synthesis instructions, and
    /// pass-attached annotations.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl WorkflowSpec {
    /// Empty spec with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            edges: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }

    /// The unique out-degree-zero step, if exactly one exists.
    pub fn terminal_step(&self) -> Option<&StepSpec> {
        let mut sinks = self
            .steps
            .iter()
            .filter(|s| !self.edges.iter().any(|e| e.from == s.id));
        match (sinks.next(), sinks.next()) {
            (Some(step), None) => Some(step),
            _ => None,
        }
    }

    /// Canonical JSON serialization (object keys sorted).
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&serde_json::to_value(self)?)
    }

    /// SHA-256 hex digest of the canonical JSON representation.
    pub fn spec_digest(&self) -> String {
        match serde_json::to_value(self) {
            Ok(value) => digest::compute_digest(&value),
            // Serialization of a plain data struct cannot fail in practice.
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_spec() -> WorkflowSpec {
        let mut spec = WorkflowSpec::new("demo");
        spec.steps.push(StepSpec::new("fetch", "fetch the document"));
        spec.steps.push(StepSpec::new("parse", "parse the document"));
        spec.edges.push(EdgeSpec::new("fetch", "parse"));
        spec
    }

    #[test]
    fn test_spec_serde_roundtrip() {
        let spec = linear_spec();
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: WorkflowSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(spec, back);
    }

    #[test]
    fn test_spec_digest_stable() {
        let spec = linear_spec();
        assert_eq!(spec.spec_digest(), spec.spec_digest());
        assert_eq!(spec.spec_digest().len(), 64);
    }

    #[test]
    fn test_spec_digest_changes_on_mutation() {
        let spec = linear_spec();
        let mut other = spec.clone();
        other.steps[0].timeout_seconds = 300;
        assert_ne!(spec.spec_digest(), other.spec_digest());
    }

    #[test]
    fn test_terminal_step_unique_sink() {
        let spec = linear_spec();
        assert_eq!(spec.terminal_step().map(|s| s.id.as_str()), Some("parse"));
    }

    #[test]
    fn test_terminal_step_none_with_two_sinks() {
        let mut spec = linear_spec();
        spec.steps.push(StepSpec::new("orphan", "dangling step"));
        assert!(spec.terminal_step().is_none());
    }

    #[test]
    fn test_retry_policy_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_base_ms: 100,
        };
        assert_eq!(policy.backoff_delay(1).as_millis(), 100);
        assert_eq!(policy.backoff_delay(2).as_millis(), 200);
        assert_eq!(policy.backoff_delay(3).as_millis(), 400);
    }

    #[test]
    fn test_step_defaults_fill_on_deserialize() {
        let step: StepSpec =
            serde_json::from_str(r#"{"id": "s1", "description": "a step"}"#).expect("parse");
        assert_eq!(step.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert!(step.retry.is_none());
        assert_eq!(step.retry_policy().max_attempts, 1);
    }
}
