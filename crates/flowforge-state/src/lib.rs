//! FlowForge-State: Storage Boundary for FlowForge
//!
//! This crate provides the persistence layer for the workflow compiler.
//! All state the compile loop shares across runs goes through the two traits
//! defined here, never through ambient global mutation.
//!
//! ## Key Components
//!
//! - `AttemptStore`: append-only build-attempt and execution-report telemetry
//! - `VersionRegistry`: append-only stable artifact version management
//! - `ArtifactSink`: per-version artifact directory writer
//! - In-memory fakes for tests (`fakes`), JSONL/JSON file backends for
//!   production (`jsonl`, `registry_fs`)

mod error;
pub mod fakes;
pub mod jsonl;
pub mod registry_fs;
mod similarity;
pub mod storage_traits;

pub use error::{StorageError, StorageResult};
pub use fakes::{MemoryAttemptStore, MemoryVersionRegistry};
pub use jsonl::JsonlAttemptStore;
pub use registry_fs::{ArtifactSink, ExecutionArtifact, FsVersionRegistry};
pub use storage_traits::{
    normalize_workflow_name, AttemptRecord, AttemptStore, StableVersion, VersionRegistry,
};
