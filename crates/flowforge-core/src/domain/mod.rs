//! Domain models for FlowForge.
//!
//! Canonical definitions for the core entities:
//! - `WorkflowSpec`: Immutable workflow IR (steps, edges, policies)
//! - `ToolCandidate`: One proposed step implementation, pre-verification
//! - `ExecutionReport`: One runtime pass over an optimized spec
//! - `FlowForgeError`: Domain error taxonomy

pub mod candidate;
pub mod digest;
pub mod error;
pub mod report;
pub mod spec;

// Re-export main types and errors
pub use candidate::{CandidateOrigin, ToolCandidate, ToolVerificationResult, VerificationVerdict};
pub use error::{FlowForgeError, Result};
pub use report::{
    classify_error_text, ErrorClass, ExecutionReport, RunStatus, StepReport, StepStatus,
};
pub use spec::{
    EdgeSpec, RetryPolicy, StepSpec, ToolBinding, WorkflowSpec, DEFAULT_BACKOFF_BASE_MS,
    DEFAULT_TIMEOUT_SECONDS,
};
