//! Sandboxed execution of untrusted candidate code.
//!
//! - `engine`: one-shot child-process execution with timeout enforcement
//! - `contract`: structural output contract (`status` + `result` fields)

pub mod contract;
pub mod engine;

pub use contract::check_output_contract;
pub use engine::{SandboxConfig, SandboxEngine};
