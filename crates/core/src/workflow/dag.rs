use crate::error::{Error, Result};
use crate::types::{DagEdge, Step, WorkflowDag};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Validate a definition's steps and compute the DAG metadata persisted
/// alongside it.
///
/// Rejected: empty or duplicate step ids, `dependsOn` references to
/// unknown ids, cycles (with one witness path), and fan-out templates
/// that declare their own dependents.
pub fn build_dag(steps: &[Step]) -> Result<WorkflowDag> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        let id = step.id();
        if id.is_empty() {
            return Err(Error::validation("step id must not be empty"));
        }
        if !seen.insert(id) {
            return Err(Error::validation(format!("duplicate step id '{id}'")));
        }
        if let Step::Fanout(fanout) = step {
            if fanout.template.id().is_empty() {
                return Err(Error::validation(format!(
                    "fan-out step '{id}' has a template without an id"
                )));
            }
            if !fanout.template.dependents().is_empty() {
                return Err(Error::validation(format!(
                    "fan-out template '{}' must not declare dependents",
                    fanout.template.id()
                )));
            }
            if fanout.max_items == 0 {
                return Err(Error::validation(format!(
                    "fan-out step '{id}' must allow at least one item"
                )));
            }
        }
    }

    for step in steps {
        for dependency in step.depends_on() {
            if !seen.contains(dependency.as_str()) {
                return Err(Error::MissingDependency {
                    step_id: step.id().to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    // petgraph for cycle detection and the witness path.
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for step in steps {
        let node = graph.add_node(step.id());
        nodes.insert(step.id(), node);
    }
    for step in steps {
        for dependency in step.depends_on() {
            graph.add_edge(nodes[dependency.as_str()], nodes[step.id()], ());
        }
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        let cycle = witness_cycle(&graph);
        return Err(Error::CycleDetected { cycle });
    }

    // Kahn's algorithm, ties broken by declaration order so the
    // persisted topological order is deterministic.
    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id(), i))
        .collect();
    let mut in_degree: BTreeMap<&str, usize> =
        steps.iter().map(|s| (s.id(), s.depends_on().len())).collect();
    let mut adjacency: BTreeMap<String, Vec<String>> = steps
        .iter()
        .map(|s| (s.id().to_string(), Vec::new()))
        .collect();
    for step in steps {
        for dependency in step.depends_on() {
            adjacency
                .get_mut(dependency.as_str())
                .expect("validated dependency")
                .push(step.id().to_string());
        }
    }
    for successors in adjacency.values_mut() {
        successors.sort_by_key(|id| index_of[id.as_str()]);
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| index_of[id]);
    let roots: Vec<String> = ready.iter().map(|id| id.to_string()).collect();

    let mut topological_order = Vec::with_capacity(steps.len());
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        topological_order.push(id.to_string());
        for successor in &adjacency[id] {
            let degree = in_degree.get_mut(successor.as_str()).expect("known step");
            *degree -= 1;
            if *degree == 0 {
                let position = ready
                    .iter()
                    .position(|r| index_of[r] > index_of[successor.as_str()])
                    .unwrap_or(ready.len());
                ready.insert(position, successor.as_str());
            }
        }
    }

    let edges: Vec<DagEdge> = steps
        .iter()
        .flat_map(|step| {
            step.depends_on().iter().map(|dependency| DagEdge {
                from: dependency.clone(),
                to: step.id().to_string(),
            })
        })
        .collect();

    Ok(WorkflowDag {
        adjacency,
        roots,
        topological_order,
        edges,
    })
}

/// One cycle path for the validation error, found over the strongly
/// connected components.
fn witness_cycle(graph: &DiGraph<&str, ()>) -> String {
    for scc in petgraph::algo::tarjan_scc(graph) {
        let is_cycle = scc.len() > 1
            || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
        if is_cycle {
            let mut ids: Vec<&str> = scc.iter().rev().map(|n| graph[*n]).collect();
            if let Some(first) = ids.first().copied() {
                ids.push(first);
            }
            return ids.join(" -> ");
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(value: serde_json::Value) -> Vec<Step> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let dag = build_dag(&steps(json!([
            {"type": "job", "id": "c", "jobSlug": "j", "dependsOn": ["b"]},
            {"type": "job", "id": "a", "jobSlug": "j"},
            {"type": "job", "id": "b", "jobSlug": "j", "dependsOn": ["a"]}
        ])))
        .unwrap();

        assert_eq!(dag.topological_order, vec!["a", "b", "c"]);
        assert_eq!(dag.roots, vec!["a"]);
        assert_eq!(dag.adjacency["a"], vec!["b"]);
        assert_eq!(dag.edges.len(), 2);
    }

    #[test]
    fn diamond_respects_declaration_order_on_ties() {
        let dag = build_dag(&steps(json!([
            {"type": "job", "id": "root", "jobSlug": "j"},
            {"type": "job", "id": "left", "jobSlug": "j", "dependsOn": ["root"]},
            {"type": "job", "id": "right", "jobSlug": "j", "dependsOn": ["root"]},
            {"type": "job", "id": "join", "jobSlug": "j", "dependsOn": ["left", "right"]}
        ])))
        .unwrap();

        assert_eq!(dag.topological_order, vec!["root", "left", "right", "join"]);
        // Every dependency precedes its dependent.
        for step_id in &dag.topological_order {
            let position = |id: &str| {
                dag.topological_order
                    .iter()
                    .position(|s| s == id)
                    .unwrap()
            };
            for edge in dag.edges.iter().filter(|e| &e.to == step_id) {
                assert!(position(&edge.from) < position(step_id));
            }
        }
    }

    #[test]
    fn rejects_missing_dependency() {
        let err = build_dag(&steps(json!([
            {"type": "job", "id": "a", "jobSlug": "j", "dependsOn": ["ghost"]}
        ])))
        .unwrap_err();

        match err {
            Error::MissingDependency { step_id, dependency } => {
                assert_eq!(step_id, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn rejects_cycles_with_a_witness() {
        let err = build_dag(&steps(json!([
            {"type": "job", "id": "a", "jobSlug": "j", "dependsOn": ["c"]},
            {"type": "job", "id": "b", "jobSlug": "j", "dependsOn": ["a"]},
            {"type": "job", "id": "c", "jobSlug": "j", "dependsOn": ["b"]}
        ])))
        .unwrap_err();

        match err {
            Error::CycleDetected { cycle } => {
                assert!(cycle.contains("a"), "witness should name the cycle: {cycle}");
                assert!(cycle.contains("->"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_and_empty_ids() {
        assert!(build_dag(&steps(json!([
            {"type": "job", "id": "a", "jobSlug": "j"},
            {"type": "job", "id": "a", "jobSlug": "j"}
        ])))
        .is_err());

        assert!(build_dag(&steps(json!([
            {"type": "job", "id": "", "jobSlug": "j"}
        ])))
        .is_err());
    }

    #[test]
    fn rejects_fanout_template_with_dependents() {
        let err = build_dag(&steps(json!([
            {
                "type": "fanout",
                "id": "expand",
                "collection": [],
                "maxItems": 5,
                "maxConcurrency": 2,
                "template": {
                    "type": "job",
                    "id": "child",
                    "jobSlug": "j",
                    "dependents": ["somewhere"]
                }
            }
        ])))
        .unwrap_err();

        assert!(err.to_string().contains("must not declare dependents"));
    }
}
