//! Step Graph - layered DAG of workflow steps
//!
//! Steps live in an arena addressed by [`StepIndex`]; edges run from a
//! predecessor to each step that depends on it. Building the graph runs
//! Kahn's algorithm and yields topological layers:
//!
//! ```text
//!   layer 0      layer 1      layer 2
//!     a ──┬──►     b ──┬──►     d
//!         └──►     c ──┘
//! ```
//!
//! Every edge `u → v` satisfies `layer(u) < layer(v)`. Steps inside a layer
//! are mutually independent.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::error::{Result, SurgeError};
use crate::types::StepIndex;

/// Name and dependencies of one step, as declared
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepNode {
    pub name: String,
    pub predecessors: Vec<String>,
}

impl StepNode {
    pub fn new(name: impl Into<String>, predecessors: &[&str]) -> Self {
        Self {
            name: name.into(),
            predecessors: predecessors.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Validated, layered step DAG
#[derive(Clone, Debug)]
pub struct StepGraph {
    names: Vec<String>,
    by_name: HashMap<String, StepIndex>,
    dag: DiGraph<StepIndex, ()>,
    parents: Vec<Vec<StepIndex>>,
    layers: Vec<Vec<StepIndex>>,
    layer_of: Vec<usize>,
}

impl StepGraph {
    /// Validate and layer a set of steps.
    ///
    /// Fails with an invalid-workflow error on duplicate names, unknown
    /// predecessors or cycles (self-edges included).
    pub fn build(steps: &[StepNode]) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(steps.len());
        let mut dag = DiGraph::with_capacity(steps.len(), steps.len());
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(steps.len());

        for (i, step) in steps.iter().enumerate() {
            if by_name.insert(step.name.clone(), StepIndex(i)).is_some() {
                return Err(SurgeError::DuplicateStep(step.name.clone()));
            }
            nodes.push(dag.add_node(StepIndex(i)));
        }

        let mut parents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for pred in &step.predecessors {
                let p = *by_name
                    .get(pred)
                    .ok_or_else(|| SurgeError::MissingPredecessor {
                        step: step.name.clone(),
                        predecessor: pred.clone(),
                    })?;
                if parents[i].contains(&p) {
                    continue;
                }
                parents[i].push(p);
                dag.add_edge(nodes[p.0], nodes[i], ());
            }
        }

        // Kahn's algorithm, one layer per round
        let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
        let mut frontier: Vec<StepIndex> = (0..steps.len())
            .filter(|&i| in_degree[i] == 0)
            .map(StepIndex)
            .collect();
        let mut layers = Vec::new();
        let mut layer_of = vec![usize::MAX; steps.len()];
        let mut placed = 0;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &step in &frontier {
                layer_of[step.0] = layers.len();
                for child in dag.neighbors_directed(nodes[step.0], Direction::Outgoing) {
                    let c = dag[child];
                    in_degree[c.0] -= 1;
                    if in_degree[c.0] == 0 {
                        next.push(c);
                    }
                }
            }
            placed += frontier.len();
            frontier.sort();
            layers.push(std::mem::replace(&mut frontier, next));
        }

        if placed != steps.len() {
            let stuck = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| steps[i].name.clone())
                .collect();
            return Err(SurgeError::Cycle(stuck));
        }

        Ok(Self {
            names: steps.iter().map(|s| s.name.clone()).collect(),
            by_name,
            dag,
            parents,
            layers,
            layer_of,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Topological batches; every predecessor sits in an earlier batch
    pub fn layers(&self) -> &[Vec<StepIndex>] {
        &self.layers
    }

    pub fn layer_of(&self, step: StepIndex) -> usize {
        self.layer_of[step.0]
    }

    /// Direct predecessors of a step
    pub fn parents(&self, step: StepIndex) -> &[StepIndex] {
        &self.parents[step.0]
    }

    /// Direct successors of a step
    pub fn children(&self, step: StepIndex) -> Vec<StepIndex> {
        let mut out: Vec<StepIndex> = self
            .dag
            .neighbors_directed(NodeIndex::new(step.0), Direction::Outgoing)
            .map(|n| self.dag[n])
            .collect();
        out.sort();
        out
    }

    pub fn name(&self, step: StepIndex) -> &str {
        &self.names[step.0]
    }

    pub fn index_of(&self, name: &str) -> Option<StepIndex> {
        self.by_name.get(name).copied()
    }

    /// Parent map keyed by step name
    pub fn parent_map(&self) -> HashMap<String, Vec<String>> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let preds = self.parents[i]
                    .iter()
                    .map(|p| self.names[p.0].clone())
                    .collect();
                (name.clone(), preds)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn diamond() -> Vec<StepNode> {
        vec![
            StepNode::new("a", &[]),
            StepNode::new("b", &["a"]),
            StepNode::new("c", &["a"]),
            StepNode::new("d", &["b", "c"]),
        ]
    }

    #[test]
    fn test_diamond_layers() {
        let graph = StepGraph::build(&diamond()).unwrap();
        assert_eq!(
            graph.layers(),
            &[
                vec![StepIndex(0)],
                vec![StepIndex(1), StepIndex(2)],
                vec![StepIndex(3)],
            ]
        );
        assert_eq!(graph.parents(StepIndex(3)), &[StepIndex(1), StepIndex(2)]);
        assert_eq!(graph.children(StepIndex(0)), vec![StepIndex(1), StepIndex(2)]);
        assert_eq!(graph.parent_map()["d"], vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = StepGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.layers().is_empty());
    }

    #[test]
    fn test_missing_predecessor() {
        let err = StepGraph::build(&[StepNode::new("b", &["a"])]).unwrap_err();
        assert!(matches!(err, SurgeError::MissingPredecessor { .. }));
    }

    #[test]
    fn test_duplicate_name() {
        let err =
            StepGraph::build(&[StepNode::new("a", &[]), StepNode::new("a", &[])]).unwrap_err();
        assert!(matches!(err, SurgeError::DuplicateStep(_)));
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![
            StepNode::new("root", &[]),
            StepNode::new("x", &["root", "z"]),
            StepNode::new("y", &["x"]),
            StepNode::new("z", &["y"]),
        ];
        match StepGraph::build(&steps).unwrap_err() {
            SurgeError::Cycle(names) => {
                assert_eq!(names, vec!["x".to_string(), "y".into(), "z".into()])
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_edge_is_cycle() {
        let err = StepGraph::build(&[StepNode::new("a", &["a"])]).unwrap_err();
        assert!(matches!(err, SurgeError::Cycle(_)));
    }

    proptest! {
        /// Random DAGs (edges only from lower to higher index) always layer
        /// with every edge crossing strictly forward.
        #[test]
        fn prop_edges_cross_layers_forward(
            n in 1usize..24,
            edges in proptest::collection::vec((0usize..24, 0usize..24), 0..64),
        ) {
            let mut steps: Vec<StepNode> =
                (0..n).map(|i| StepNode::new(format!("s{i}"), &[])).collect();
            for (a, b) in edges {
                let (a, b) = (a % n, b % n);
                if a < b {
                    steps[b].predecessors.push(format!("s{a}"));
                }
            }
            let graph = StepGraph::build(&steps).unwrap();
            let placed: usize = graph.layers().iter().map(Vec::len).sum();
            prop_assert_eq!(placed, n);
            for i in 0..n {
                for p in graph.parents(StepIndex(i)) {
                    prop_assert!(graph.layer_of(*p) < graph.layer_of(StepIndex(i)));
                }
            }
        }
    }
}
