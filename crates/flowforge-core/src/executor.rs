//! Runtime graph executor.
//!
//! Executes an optimized spec: steps become ready when every dependency has
//! succeeded, ready steps run concurrently on tokio tasks bounded by a
//! semaphore, and completions flow back to the scheduling loop over a
//! channel — no busy polling. A step that exhausts its retry policy is
//! terminally failed and its transitive dependents are marked skipped
//! rather than attempted.
//!
//! The terminal synthesis step is special: it receives the aggregated
//! results of every step that succeeded, including partial results when some
//! upstream steps were skipped, and produces a best-effort answer. Only when
//! it has no usable input at all (or fails itself) is the whole run reported
//! as failed.
//!
//! The executor never mutates the spec it runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    classify_error_text, ErrorClass, ExecutionReport, RunStatus, StepReport, StepSpec, StepStatus,
    ToolCandidate,
};
use crate::graph;
use crate::optimize::OptimizedSpec;
use crate::sandbox::SandboxEngine;

/// Handle for cancelling an in-flight execution.
///
/// Cancellation force-terminates in-flight sandbox processes and marks
/// not-yet-started steps skipped.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Create a (handle, receiver) pair for `execute_cancellable`.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Final outcome of one step's attempt loop.
#[derive(Debug)]
struct StepOutcome {
    step_id: String,
    status: StepStatus,
    attempts: u32,
    duration_ms: u64,
    error: Option<String>,
    error_class: Option<ErrorClass>,
    output: Option<Value>,
}

impl StepOutcome {
    fn into_report(self) -> StepReport {
        StepReport {
            step_id: self.step_id,
            status: self.status,
            attempts: self.attempts,
            duration_ms: self.duration_ms,
            error: self.error,
            error_class: self.error_class,
            output: self.output,
        }
    }
}

/// Executes optimized specs against the sandbox engine.
pub struct GraphExecutor {
    sandbox: Arc<SandboxEngine>,
    parallelism_limit: usize,
}

impl GraphExecutor {
    pub fn new(sandbox: Arc<SandboxEngine>, parallelism_limit: usize) -> Self {
        Self {
            sandbox,
            parallelism_limit: parallelism_limit.max(1),
        }
    }

    /// Execute without external cancellation.
    pub async fn execute(
        &self,
        optimized: &OptimizedSpec,
        input: &Value,
        iteration: u32,
    ) -> ExecutionReport {
        let (_handle, rx) = CancelHandle::new();
        self.execute_cancellable(optimized, input, iteration, rx)
            .await
    }

    /// Execute with a cancellation token.
    pub async fn execute_cancellable(
        &self,
        optimized: &OptimizedSpec,
        input: &Value,
        iteration: u32,
        mut cancel: watch::Receiver<bool>,
    ) -> ExecutionReport {
        let spec = optimized.spec();
        let terminal_id = optimized.terminal_id().to_string();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(run_id = %run_id, workflow = %spec.name, iteration, "execution started");

        let adjacency = graph::adjacency(spec);
        let reverse = graph::reverse_adjacency(spec);

        let mut status: BTreeMap<String, StepStatus> = spec
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let mut remaining: BTreeMap<String, usize> = reverse
            .iter()
            .map(|(id, preds)| (id.clone(), preds.len()))
            .collect();
        let mut reports: BTreeMap<String, StepReport> = BTreeMap::new();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();

        let total_non_terminal = spec.steps.len().saturating_sub(1);
        let mut finished = 0usize;
        let mut cancelled = *cancel.borrow();
        let mut cancel_live = true;

        let sem = Arc::new(Semaphore::new(self.parallelism_limit));
        let (tx, mut rx) = mpsc::channel::<StepOutcome>(spec.steps.len().max(1));

        // Dispatch everything that is ready at the start.
        self.dispatch_ready(
            spec,
            &terminal_id,
            &mut status,
            &remaining,
            &outputs,
            input,
            &sem,
            &tx,
            &cancel,
        );

        while finished < total_non_terminal && !cancelled {
            tokio::select! {
                changed = cancel.changed(), if cancel_live => {
                    match changed {
                        Ok(()) => cancelled = *cancel.borrow(),
                        // Sender dropped: cancellation can no longer happen.
                        Err(_) => cancel_live = false,
                    }
                }
                received = rx.recv() => {
                    let Some(outcome) = received else { break };
                    finished += 1;
                    let step_id = outcome.step_id.clone();
                    let step_status = outcome.status;
                    status.insert(step_id.clone(), step_status);

                    if step_status == StepStatus::Succeeded {
                        if let Some(output) = outcome.output.clone() {
                            outputs.insert(step_id.clone(), output);
                        }
                        reports.insert(step_id.clone(), outcome.into_report());
                        if let Some(successors) = adjacency.get(&step_id) {
                            for succ in successors {
                                if let Some(count) = remaining.get_mut(succ) {
                                    *count = count.saturating_sub(1);
                                }
                            }
                        }
                        self.dispatch_ready(
                            spec,
                            &terminal_id,
                            &mut status,
                            &remaining,
                            &outputs,
                            input,
                            &sem,
                            &tx,
                            &cancel,
                        );
                    } else {
                        warn!(step = %step_id, status = ?step_status, "step terminally failed");
                        reports.insert(step_id.clone(), outcome.into_report());
                        // Transitive dependents are skipped, never attempted.
                        for descendant in graph::descendants(spec, &step_id) {
                            if descendant == terminal_id {
                                continue;
                            }
                            if status.get(&descendant) == Some(&StepStatus::Pending) {
                                status.insert(descendant.clone(), StepStatus::Skipped);
                                reports.insert(
                                    descendant.clone(),
                                    StepReport::skipped(descendant.clone()),
                                );
                                finished += 1;
                            }
                        }
                    }
                }
            }
        }

        if cancelled {
            warn!(run_id = %run_id, "execution cancelled");
            for (id, state) in status.iter_mut() {
                if *id == terminal_id {
                    continue;
                }
                match state {
                    StepStatus::Pending => {
                        *state = StepStatus::Skipped;
                        reports.insert(id.clone(), StepReport::skipped(id.clone()));
                    }
                    StepStatus::Running => {
                        // In-flight sandbox processes are killed by their
                        // tasks observing the token.
                        *state = StepStatus::Failed;
                        reports.insert(
                            id.clone(),
                            StepReport {
                                step_id: id.clone(),
                                status: StepStatus::Failed,
                                attempts: 0,
                                duration_ms: 0,
                                error: Some("workflow cancelled".to_string()),
                                error_class: None,
                                output: None,
                            },
                        );
                    }
                    _ => {}
                }
            }
        }

        // Terminal synthesis phase.
        let (overall, final_output, failure_summary) = if cancelled {
            reports.insert(terminal_id.clone(), StepReport::skipped(terminal_id.clone()));
            (
                RunStatus::Cancelled,
                None,
                Some("workflow cancelled".to_string()),
            )
        } else if outputs.is_empty() && total_non_terminal > 0 {
            reports.insert(terminal_id.clone(), StepReport::skipped(terminal_id.clone()));
            (
                RunStatus::Failed,
                None,
                Some(format!(
                    "terminal step '{terminal_id}' had no usable inputs; \
                     all upstream steps failed or were skipped"
                )),
            )
        } else if let Some(terminal) = spec.step(&terminal_id) {
            let payload = json!({ "input": input, "results": outputs });
            let outcome =
                run_step_attempts(&self.sandbox, terminal, &payload, &mut cancel).await;
            let succeeded = outcome.status == StepStatus::Succeeded;
            let output = outcome.output.clone();
            let error = outcome.error.clone();
            reports.insert(terminal_id.clone(), outcome.into_report());
            if succeeded {
                (RunStatus::Succeeded, output, None)
            } else {
                (
                    RunStatus::Failed,
                    None,
                    Some(format!(
                        "terminal step '{terminal_id}' failed: {}",
                        error.unwrap_or_else(|| "unknown error".to_string())
                    )),
                )
            }
        } else {
            (
                RunStatus::Failed,
                None,
                Some(format!("terminal step '{terminal_id}' missing from spec")),
            )
        };

        let steps: Vec<StepReport> = spec
            .steps
            .iter()
            .filter_map(|s| reports.remove(&s.id))
            .collect();

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            status = ?overall,
            duration_ms,
            "execution finished"
        );

        ExecutionReport {
            run_id,
            workflow: spec.name.clone(),
            spec_digest: spec.spec_digest(),
            status: overall,
            steps,
            final_output,
            failure_summary,
            started_at,
            duration_ms,
            iteration,
        }
    }

    /// Spawn every pending non-terminal step whose dependencies all
    /// succeeded. Marks spawned steps `Running`.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        &self,
        spec: &crate::domain::WorkflowSpec,
        terminal_id: &str,
        status: &mut BTreeMap<String, StepStatus>,
        remaining: &BTreeMap<String, usize>,
        outputs: &BTreeMap<String, Value>,
        input: &Value,
        sem: &Arc<Semaphore>,
        tx: &mpsc::Sender<StepOutcome>,
        cancel: &watch::Receiver<bool>,
    ) {
        let ready: Vec<String> = spec
            .steps
            .iter()
            .filter(|s| {
                s.id != terminal_id
                    && status.get(&s.id) == Some(&StepStatus::Pending)
                    && remaining.get(&s.id).copied().unwrap_or(0) == 0
            })
            .map(|s| s.id.clone())
            .collect();

        let reverse = graph::reverse_adjacency(spec);
        for step_id in ready {
            let Some(step) = spec.step(&step_id).cloned() else {
                continue;
            };
            status.insert(step_id.clone(), StepStatus::Running);

            // Direct dependency results travel with the task; tasks never
            // share mutable state.
            let dep_results: BTreeMap<String, Value> = reverse
                .get(&step_id)
                .map(|preds| {
                    preds
                        .iter()
                        .filter_map(|p| outputs.get(p).map(|v| (p.clone(), v.clone())))
                        .collect()
                })
                .unwrap_or_default();
            let payload = json!({ "input": input, "results": dep_results });

            let sandbox = Arc::clone(&self.sandbox);
            let sem = Arc::clone(sem);
            let tx = tx.clone();
            let mut cancel = cancel.clone();

            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                debug!(step = %step.id, "step running");
                let outcome = run_step_attempts(&sandbox, &step, &payload, &mut cancel).await;
                let _ = tx.send(outcome).await;
            });
        }
    }
}

/// Run one step's bounded attempt loop against the sandbox.
///
/// Retries up to the step's `max_attempts` with exponential backoff from its
/// `backoff_base_ms`; the final verdict decides between `Failed` and
/// `TimedOut`. Returns a cancelled failure outcome when the token fires.
async fn run_step_attempts(
    sandbox: &SandboxEngine,
    step: &StepSpec,
    payload: &Value,
    cancel: &mut watch::Receiver<bool>,
) -> StepOutcome {
    let start = Instant::now();
    let policy = step.retry_policy();

    let Some(binding) = &step.tool else {
        return StepOutcome {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            attempts: 0,
            duration_ms: 0,
            error: Some("step has no bound tool".to_string()),
            error_class: Some(ErrorClass::Unknown),
            output: None,
        };
    };

    let candidate = ToolCandidate {
        name: binding.name.clone(),
        code: binding.code.clone(),
        sample_input: Value::Null,
        origin: binding.origin,
    };

    let mut last_error: Option<String> = None;
    let mut last_class: Option<ErrorClass> = None;
    let mut last_status = StepStatus::Failed;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let sleep = tokio::time::sleep(policy.backoff_delay(attempt - 1));
            tokio::pin!(sleep);
            let mut cancel_live = true;
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = cancel.changed(), if cancel_live => match changed {
                        Ok(()) if *cancel.borrow() => {
                            return cancelled_outcome(step, attempt - 1, start);
                        }
                        Ok(()) => {}
                        // Sender gone; cancellation can no longer happen.
                        Err(_) => cancel_live = false,
                    },
                }
            }
        }

        let run = sandbox.run_with_timeout(&candidate, payload, step.timeout());
        tokio::pin!(run);
        let mut cancel_live = true;
        let result = loop {
            tokio::select! {
                result = &mut run => break Some(result),
                changed = cancel.changed(), if cancel_live => match changed {
                    Ok(()) if *cancel.borrow() => break None,
                    Ok(()) => {}
                    Err(_) => cancel_live = false,
                },
            }
        };

        let Some(verification) = result else {
            // Dropping the run future killed the sandbox child.
            return cancelled_outcome(step, attempt, start);
        };

        if verification.success() {
            return StepOutcome {
                step_id: step.id.clone(),
                status: StepStatus::Succeeded,
                attempts: attempt,
                duration_ms: start.elapsed().as_millis() as u64,
                error: None,
                error_class: None,
                output: verification
                    .output_preview
                    .clone()
                    .map(Value::String)
                    .or(Some(Value::Null)),
            };
        }

        let error_text = verification.error_text();
        last_class = Some(classify_error_text(&error_text));
        last_status = match verification.verdict {
            crate::domain::VerificationVerdict::Timeout => StepStatus::TimedOut,
            _ => StepStatus::Failed,
        };
        last_error = Some(error_text);
        debug!(step = %step.id, attempt, "step attempt failed");
    }

    StepOutcome {
        step_id: step.id.clone(),
        status: last_status,
        attempts: policy.max_attempts,
        duration_ms: start.elapsed().as_millis() as u64,
        error: last_error,
        error_class: last_class,
        output: None,
    }
}

fn cancelled_outcome(step: &StepSpec, attempts: u32, start: Instant) -> StepOutcome {
    StepOutcome {
        step_id: step.id.clone(),
        status: StepStatus::Failed,
        attempts,
        duration_ms: start.elapsed().as_millis() as u64,
        error: Some("workflow cancelled".to_string()),
        error_class: None,
        output: None,
    }
}
