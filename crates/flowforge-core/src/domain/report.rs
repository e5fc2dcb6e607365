//! Execution reports and failure classification.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-step runtime state.
///
/// `Pending -> Running -> {Succeeded, Failed, TimedOut}`; steps whose
/// dependencies terminally failed are `Skipped` without ever running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a final state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Coarse error classes used for diagnostics and reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Syntax,
    MissingDependency,
    Timeout,
    ContractViolation,
    Runtime,
    Logical,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Syntax => "syntax",
            ErrorClass::MissingDependency => "missing_dependency",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ContractViolation => "contract_violation",
            ErrorClass::Runtime => "runtime",
            ErrorClass::Logical => "logical",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn missing_dependency_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(command not found|no such file or directory|no module named|[\w./-]+: not found)")
            .expect("static pattern compiles")
    })
}

/// Classify an error blob into a coarse category by keyword.
pub fn classify_error_text(text: &str) -> ErrorClass {
    let lower = text.to_lowercase();
    if lower.is_empty() {
        return ErrorClass::Unknown;
    }
    if lower.contains("syntax error") || lower.contains("unexpected token") {
        return ErrorClass::Syntax;
    }
    if missing_dependency_pattern().is_match(text) {
        return ErrorClass::MissingDependency;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorClass::Timeout;
    }
    if lower.contains("contract") || lower.contains("missing 'status'") || lower.contains("missing 'result'") {
        return ErrorClass::ContractViolation;
    }
    if lower.contains("assertion") || lower.contains("mismatch") {
        return ErrorClass::Logical;
    }
    ErrorClass::Runtime
}

/// Final state of one step within an execution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub status: StepStatus,

    /// Attempts actually made (0 for skipped steps).
    pub attempts: u32,

    pub duration_ms: u64,

    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,

    /// The step's `result` payload when it succeeded.
    pub output: Option<Value>,
}

impl StepReport {
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            attempts: 0,
            duration_ms: 0,
            error: None,
            error_class: None,
            output: None,
        }
    }
}

/// Overall outcome of one runtime pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// One full runtime pass over an optimized spec.
///
/// Produced by the graph executor; consumed by the reflection controller and
/// the stability evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub spec_digest: String,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,

    /// The terminal step's output when the run succeeded.
    pub final_output: Option<Value>,

    /// Cause of failure when the run did not succeed.
    pub failure_summary: Option<String>,

    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Reflection iteration this report belongs to.
    pub iteration: u32,
}

impl ExecutionReport {
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    /// Whether the terminal synthesis step fully succeeded.
    pub fn terminal_succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Steps that failed or timed out (skipped steps are not failures).
    pub fn failing_steps(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::TimedOut))
            .collect()
    }

    /// Steps that were skipped because of upstream failures or cancellation.
    pub fn skipped_steps(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .collect()
    }
}
