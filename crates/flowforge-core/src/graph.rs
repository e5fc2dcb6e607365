//! DAG analysis over workflow specs.
//!
//! Shared by the validator, the optimization passes, and the runtime
//! executor. All iteration orders are deterministic (`BTreeMap`/`BTreeSet`
//! plus sorted queues) so repeated analysis of the same spec yields the same
//! answer.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::domain::WorkflowSpec;

/// Forward adjacency: step id -> set of successor ids.
pub fn adjacency(spec: &WorkflowSpec) -> BTreeMap<String, BTreeSet<String>> {
    let mut graph: BTreeMap<String, BTreeSet<String>> = spec
        .steps
        .iter()
        .map(|s| (s.id.clone(), BTreeSet::new()))
        .collect();
    for edge in &spec.edges {
        graph.entry(edge.from.clone()).or_default().insert(edge.to.clone());
        graph.entry(edge.to.clone()).or_default();
    }
    graph
}

/// Reverse adjacency: step id -> set of predecessor ids.
pub fn reverse_adjacency(spec: &WorkflowSpec) -> BTreeMap<String, BTreeSet<String>> {
    let mut graph: BTreeMap<String, BTreeSet<String>> = spec
        .steps
        .iter()
        .map(|s| (s.id.clone(), BTreeSet::new()))
        .collect();
    for edge in &spec.edges {
        graph.entry(edge.to.clone()).or_default().insert(edge.from.clone());
        graph.entry(edge.from.clone()).or_default();
    }
    graph
}

/// Kahn topological order over a sorted ready queue.
///
/// On a cycle, returns `Err` with the sorted ids of the steps left on the
/// cycle (every unordered step participates in or depends on one).
pub fn topological_order(spec: &WorkflowSpec) -> Result<Vec<String>, Vec<String>> {
    let graph = adjacency(spec);
    let mut in_degree: BTreeMap<&str, usize> = graph.keys().map(|k| (k.as_str(), 0)).collect();
    for targets in graph.values() {
        for target in targets {
            *in_degree.entry(target.as_str()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(graph.len());

    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        if let Some(targets) = graph.get(node) {
            for target in targets {
                if let Some(degree) = in_degree.get_mut(target.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target.as_str());
                    }
                }
            }
        }
    }

    if order.len() != graph.len() {
        let ordered: BTreeSet<&str> = order.iter().map(|s| s.as_str()).collect();
        let cycle: Vec<String> = graph
            .keys()
            .filter(|k| !ordered.contains(k.as_str()))
            .cloned()
            .collect();
        return Err(cycle);
    }
    Ok(order)
}

/// Steps with in-degree zero, sorted.
pub fn roots(spec: &WorkflowSpec) -> Vec<String> {
    let reverse = reverse_adjacency(spec);
    reverse
        .into_iter()
        .filter(|(_, preds)| preds.is_empty())
        .map(|(id, _)| id)
        .collect()
}

/// Steps with out-degree zero, sorted.
pub fn sinks(spec: &WorkflowSpec) -> Vec<String> {
    let graph = adjacency(spec);
    graph
        .into_iter()
        .filter(|(_, succs)| succs.is_empty())
        .map(|(id, _)| id)
        .collect()
}

/// Whether a directed path exists from `source` to `target`.
pub fn has_path(spec: &WorkflowSpec, source: &str, target: &str) -> bool {
    let graph = adjacency(spec);
    if !graph.contains_key(source) || !graph.contains_key(target) {
        return false;
    }
    let mut queue = VecDeque::from([source]);
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    while let Some(current) = queue.pop_front() {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = graph.get(current) {
            for succ in next {
                if !visited.contains(succ.as_str()) {
                    queue.push_back(succ);
                }
            }
        }
    }
    false
}

/// All transitive successors of `id` (excluding `id` itself).
pub fn descendants(spec: &WorkflowSpec, id: &str) -> BTreeSet<String> {
    let graph = adjacency(spec);
    let mut out = BTreeSet::new();
    let mut queue: VecDeque<String> = graph.get(id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
    while let Some(current) = queue.pop_front() {
        if out.insert(current.clone()) {
            if let Some(next) = graph.get(&current) {
                queue.extend(next.iter().cloned());
            }
        }
    }
    out
}

/// Set of step ids reachable from any root.
pub fn reachable_from_roots(spec: &WorkflowSpec) -> BTreeSet<String> {
    let graph = adjacency(spec);
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = roots(spec).into();
    while let Some(current) = queue.pop_front() {
        if visited.insert(current.clone()) {
            if let Some(next) = graph.get(&current) {
                queue.extend(next.iter().cloned());
            }
        }
    }
    visited
}

/// Conservative parallel grouping: sibling successors of a shared parent are
/// grouped together only when no path exists between any pair. Groups and
/// members come out sorted by step id.
pub fn parallel_groups(spec: &WorkflowSpec) -> Vec<Vec<String>> {
    let graph = adjacency(spec);
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut grouped: BTreeSet<String> = BTreeSet::new();

    for children in graph.values() {
        if children.len() < 2 {
            continue;
        }
        let mut independent: Vec<String> = Vec::new();
        for child in children {
            if grouped.contains(child) {
                continue;
            }
            let isolated = independent.iter().all(|other| {
                !has_path(spec, child, other) && !has_path(spec, other, child)
            });
            if isolated {
                independent.push(child.clone());
            }
        }
        if independent.len() > 1 {
            grouped.extend(independent.iter().cloned());
            groups.push(independent);
        }
    }

    groups.sort();
    groups
}
