//! The standard optimization passes.

use std::collections::BTreeMap;

use serde_json::json;

use super::OptimizationPass;
use crate::domain::{EdgeSpec, Result, WorkflowSpec};
use crate::graph;

/// Infer missing edges from declared step I/O names.
///
/// When step B `reads` a name that step A `writes` and no `A -> B` edge
/// exists, an inferred (non-explicit) edge is added. Explicit edges are
/// never removed, and an inference that would introduce a cycle or give the
/// terminal step successors is skipped.
pub struct DependencyInferencePass;

impl OptimizationPass for DependencyInferencePass {
    fn name(&self) -> &'static str {
        "dependency_inference"
    }

    fn apply(&self, spec: &WorkflowSpec) -> Result<WorkflowSpec> {
        let mut out = spec.clone();
        let terminal_id = spec.terminal_step().map(|s| s.id.clone()).unwrap_or_default();

        // writer name -> step ids, deterministic order.
        let mut writers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in &spec.steps {
            for name in &step.writes {
                writers.entry(name.as_str()).or_default().push(step.id.as_str());
            }
        }

        for reader in &spec.steps {
            for name in &reader.reads {
                let Some(sources) = writers.get(name.as_str()) else {
                    continue;
                };
                for source in sources {
                    if *source == reader.id || *source == terminal_id {
                        continue;
                    }
                    if out.has_edge(source, &reader.id) {
                        continue;
                    }
                    // A reverse path means the inferred edge would close a
                    // cycle; leave the authored structure alone.
                    if graph::has_path(&out, &reader.id, source) {
                        continue;
                    }
                    out.edges.push(EdgeSpec::inferred(*source, reader.id.clone()));
                }
            }
        }
        Ok(out)
    }
}

/// Annotate independent sibling steps with shared parallel-group tags.
///
/// Group identifiers are assigned over groups sorted by member ids, so the
/// annotation is deterministic and idempotent. Steps outside any group get
/// their tag cleared — the tag belongs to this pass alone.
pub struct ParallelGroupPass;

impl OptimizationPass for ParallelGroupPass {
    fn name(&self) -> &'static str {
        "parallel_group"
    }

    fn apply(&self, spec: &WorkflowSpec) -> Result<WorkflowSpec> {
        let mut out = spec.clone();
        let groups = graph::parallel_groups(spec);

        let mut assignment: BTreeMap<&str, String> = BTreeMap::new();
        for (index, group) in groups.iter().enumerate() {
            for member in group {
                assignment.insert(member.as_str(), format!("group_{index}"));
            }
        }

        for step in &mut out.steps {
            step.parallel_group = assignment.remove(step.id.as_str());
        }
        out.metadata
            .insert("parallel_groups".to_string(), json!(groups));
        Ok(out)
    }
}

/// Estimate workflow latency from the critical path.
///
/// The critical path is the longest chain by declared per-step timeout
/// weight. The estimate is attached as metadata only and never used to
/// reject a spec.
pub struct CriticalPathPass;

impl OptimizationPass for CriticalPathPass {
    fn name(&self) -> &'static str {
        "critical_path"
    }

    fn apply(&self, spec: &WorkflowSpec) -> Result<WorkflowSpec> {
        let mut out = spec.clone();

        let order = match graph::topological_order(spec) {
            Ok(order) => order,
            // Only validated specs reach the pipeline; an unexpected cycle
            // just skips the annotation.
            Err(_) => return Ok(out),
        };
        let reverse = graph::reverse_adjacency(spec);

        let weight = |id: &str| -> u64 {
            spec.step(id).map(|s| s.timeout_seconds).unwrap_or_default()
        };

        // Longest-chain DP over the topological order.
        let mut dist: BTreeMap<&str, u64> = BTreeMap::new();
        let mut prev: BTreeMap<&str, Option<String>> = BTreeMap::new();
        for id in &order {
            let (best_pred, best_dist) = reverse
                .get(id)
                .map(|preds| {
                    preds
                        .iter()
                        .map(|p| (Some(p.clone()), dist.get(p.as_str()).copied().unwrap_or(0)))
                        .max_by_key(|(_, d)| *d)
                        .unwrap_or((None, 0))
                })
                .unwrap_or((None, 0));
            dist.insert(id.as_str(), best_dist + weight(id));
            prev.insert(id.as_str(), best_pred);
        }

        let Some((tail, total)) = dist.iter().max_by_key(|(_, d)| **d) else {
            return Ok(out);
        };

        let mut path: Vec<String> = Vec::new();
        let mut cursor = Some(tail.to_string());
        while let Some(id) = cursor {
            path.push(id.clone());
            cursor = prev.get(id.as_str()).cloned().flatten();
        }
        path.reverse();

        out.metadata.insert(
            "cost_estimate".to_string(),
            json!({
                "critical_path": path,
                "critical_path_len": path.len(),
                "estimated_latency_ms": total * 1000,
            }),
        );
        Ok(out)
    }
}
