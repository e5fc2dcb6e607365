//! Process-isolated candidate execution.
//!
//! One sandbox session serves one verification call: a fresh temporary
//! working directory, the candidate script written to disk, and a child
//! process spawned from the configured runner argv. Sessions are never
//! reused across candidates, so no state leaks between verifications.
//!
//! Isolation is process-level only: the child inherits no elevated
//! privileges, but network and filesystem access are not restricted. That is
//! a documented limitation, not a guarantee.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::contract;
use crate::domain::{ToolCandidate, ToolVerificationResult, VerificationVerdict};

/// Upper bound on captured stderr text in verdicts.
const STDERR_SNIPPET_LIMIT: usize = 500;

/// Sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Where session directories are created. `None` uses the system temp dir.
    pub root_dir: Option<PathBuf>,

    /// Runner argv; the session's script path is appended as the final
    /// argument. The default runs candidates as POSIX shell scripts.
    pub runner: Vec<String>,

    /// Default wall-clock budget per run.
    pub timeout: Duration,

    /// Upper bound on `output_preview` length.
    pub preview_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            runner: vec!["sh".to_string()],
            timeout: Duration::from_secs(60),
            preview_limit: 400,
        }
    }
}

/// Runs one candidate per call in an isolated child process.
pub struct SandboxEngine {
    config: SandboxConfig,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `candidate` with the engine's default timeout.
    pub async fn run(&self, candidate: &ToolCandidate, input: &Value) -> ToolVerificationResult {
        self.run_with_timeout(candidate, input, self.config.timeout)
            .await
    }

    /// Run `candidate` against `input` with an explicit wall-clock budget.
    ///
    /// Never hangs the caller: exceeding the budget kills the child and
    /// returns a `Timeout` verdict. Never panics: spawn and IO failures
    /// become `RuntimeError` verdicts.
    pub async fn run_with_timeout(
        &self,
        candidate: &ToolCandidate,
        input: &Value,
        timeout: Duration,
    ) -> ToolVerificationResult {
        let start = Instant::now();
        match self.run_inner(candidate, input, timeout).await {
            Ok(result) => result,
            Err(detail) => {
                warn!(tool = %candidate.name, error = %detail, "sandbox run failed to launch");
                ToolVerificationResult {
                    verdict: VerificationVerdict::RuntimeError,
                    errors: vec![detail],
                    output_preview: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }

    async fn run_inner(
        &self,
        candidate: &ToolCandidate,
        input: &Value,
        timeout: Duration,
    ) -> std::result::Result<ToolVerificationResult, String> {
        let start = Instant::now();

        // Fresh session directory per call; removed on drop.
        let mut builder = tempfile::Builder::new();
        builder.prefix("flowforge-sandbox-");
        let session = match &self.config.root_dir {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| e.to_string())?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| format!("failed to create sandbox session: {e}"))?;

        let script_path = session.path().join("tool.sh");
        std::fs::write(&script_path, &candidate.code)
            .map_err(|e| format!("failed to write candidate script: {e}"))?;

        let (runner_bin, runner_args) = self
            .config
            .runner
            .split_first()
            .ok_or_else(|| "sandbox runner argv is empty".to_string())?;

        debug!(tool = %candidate.name, runner = %runner_bin, "spawning sandbox process");

        let mut child = Command::new(runner_bin)
            .args(runner_args)
            .arg(&script_path)
            .current_dir(session.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn sandbox process: {e}"))?;

        // Input payload arrives on stdin as one JSON line.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input).map_err(|e| e.to_string())?;
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.write_all(b"\n").await;
            // Dropping stdin closes the pipe so `cat`-style readers finish.
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| format!("sandbox process failed: {e}"))?,
            Err(_) => {
                // Dropping the timed-out future killed the child
                // (kill_on_drop); report the bound that was exceeded.
                return Ok(ToolVerificationResult {
                    verdict: VerificationVerdict::Timeout,
                    errors: vec![format!(
                        "candidate exceeded wall-clock timeout of {} ms",
                        timeout.as_millis()
                    )],
                    output_preview: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let mut errors = vec![format!("candidate exited with code {code}")];
            let snippet: String = stderr.chars().take(STDERR_SNIPPET_LIMIT).collect();
            if !snippet.trim().is_empty() {
                errors.push(snippet);
            }
            return Ok(ToolVerificationResult {
                verdict: VerificationVerdict::RuntimeError,
                errors,
                output_preview: None,
                duration_ms,
            });
        }

        Ok(match contract::check_output_contract(&stdout) {
            Ok(parsed) => ToolVerificationResult {
                verdict: VerificationVerdict::Passed,
                errors: vec![],
                output_preview: Some(contract::result_preview(
                    &parsed,
                    self.config.preview_limit,
                )),
                duration_ms,
            },
            Err(violation) => ToolVerificationResult {
                verdict: VerificationVerdict::ContractViolation,
                errors: vec![format!("output contract violated: {violation}")],
                output_preview: None,
                duration_ms,
            },
        })
    }
}
