//! Domain-level error taxonomy for FlowForge.
//!
//! Only `Structural` aborts a compile. Every other class is absorbed locally
//! up to its configured bound and surfaced through reports and telemetry.

use flowforge_state::StorageError;

/// FlowForge domain errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowForgeError {
    /// An IR invariant was violated. Fatal; raised before any build or
    /// execute work begins.
    #[error("structural error: {0}")]
    Structural(String),

    /// A candidate failed verification. Recoverable via retry/fallback.
    #[error("build failure for step '{step_id}': {detail}")]
    Build { step_id: String, detail: String },

    /// A sandboxed process exceeded its wall-clock bound.
    #[error("sandbox timed out after {timeout_ms} ms")]
    SandboxTimeout { timeout_ms: u64 },

    /// A candidate's output did not satisfy the declared contract.
    #[error("output contract violated: {0}")]
    ContractViolation(String),

    /// A runtime step exhausted its retries.
    #[error("execution failure for step '{step_id}': {detail}")]
    Execution { step_id: String, detail: String },

    /// Invalid compiler configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The external candidate generator failed or timed out.
    #[error("candidate generator error: {0}")]
    Generator(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for FlowForge domain operations.
pub type Result<T> = std::result::Result<T, FlowForgeError>;
