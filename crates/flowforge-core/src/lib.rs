//! FlowForge Core Library
//!
//! Compiles a declarative workflow IR into a verified, versioned executable
//! artifact through a closed loop: generate candidate implementations for
//! each step, verify them in isolation, optimize the validated graph,
//! execute it, and — on instability — patch the IR and retry.

pub mod builder;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod domain;
pub mod executor;
pub mod graph;
pub mod optimize;
pub mod reflect;
pub mod sandbox;
pub mod stability;
pub mod telemetry;
pub mod validate;

pub use domain::{
    classify_error_text, CandidateOrigin, EdgeSpec, ErrorClass, ExecutionReport, FlowForgeError,
    Result, RetryPolicy, RunStatus, StepReport, StepSpec, StepStatus, ToolBinding, ToolCandidate,
    ToolVerificationResult, VerificationVerdict, WorkflowSpec,
};

pub use flowforge_state::{
    ArtifactSink, AttemptRecord, AttemptStore, ExecutionArtifact, FsVersionRegistry,
    JsonlAttemptStore, MemoryAttemptStore, MemoryVersionRegistry, StableVersion, VersionRegistry,
};

pub use builder::{BuiltStep, CandidateGenerator, StepBuilder};
pub use catalog::{tool_name_for, BuiltinCatalog};
pub use compiler::{CompileOutcome, WorkflowCompiler};
pub use config::CompilerConfig;
pub use executor::{CancelHandle, GraphExecutor};
pub use optimize::{OptimizationPass, OptimizedSpec, Optimizer};
pub use reflect::{FailureKind, IrPatch, ReflectionController};
pub use sandbox::{SandboxConfig, SandboxEngine};
pub use stability::{StabilityEvaluator, StabilityVerdict};
pub use telemetry::init_tracing;
pub use validate::{validate, ValidatedSpec};

/// FlowForge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
