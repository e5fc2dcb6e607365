//! Tool candidates and sandbox verification results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::digest;

/// Where a candidate implementation came from.
///
/// The build loop tries origins in this order: builtin catalog, shared
/// registry reuse, fresh generation, deterministic template fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    Builtin,
    Registry,
    Generated,
    Template,
}

impl CandidateOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateOrigin::Builtin => "builtin",
            CandidateOrigin::Registry => "registry",
            CandidateOrigin::Generated => "generated",
            CandidateOrigin::Template => "template",
        }
    }
}

impl std::fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed implementation for a step, not yet verified.
///
/// Ephemeral: owned by the build loop for the duration of one step's build,
/// then either bound into the spec or discarded (with its attempt record
/// persisted either way).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCandidate {
    pub name: String,

    /// Script body executed by the sandbox runner. Opaque to the core.
    pub code: String,

    /// Declared sample input used for verification.
    pub sample_input: Value,

    pub origin: CandidateOrigin,
}

impl ToolCandidate {
    /// SHA-256 hex identity of the candidate code.
    pub fn code_hash(&self) -> String {
        digest::hash_bytes(self.code.as_bytes())
    }
}

/// Verdict of one sandbox verification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationVerdict {
    Passed,

    /// Output shape wrong (missing `status`/`result`, or non-success status).
    /// Distinct from a runtime failure for diagnostics.
    ContractViolation,

    /// The candidate process exited nonzero or could not be run.
    RuntimeError,

    /// The candidate exceeded its wall-clock bound and was killed.
    Timeout,
}

/// Result of running one candidate in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolVerificationResult {
    pub verdict: VerificationVerdict,

    /// Structured error lines; empty on success.
    pub errors: Vec<String>,

    /// Bounded preview of the candidate's `result` output.
    pub output_preview: Option<String>,

    pub duration_ms: u64,
}

impl ToolVerificationResult {
    pub fn success(&self) -> bool {
        self.verdict == VerificationVerdict::Passed
    }

    /// All error lines joined for telemetry snippets.
    pub fn error_text(&self) -> String {
        self.errors.join("\n")
    }
}
