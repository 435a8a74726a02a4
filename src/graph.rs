//! The task dependency graph.
//!
//! Nodes are task names. An edge runs from a producing task to each task that
//! consumes one of its outputs, and is labelled with the artifacts flowing
//! along it. The graph is mutated only while tasks register; execution works
//! on a [`Subgraph`] extracted for the requested targets.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{Dfs, Reversed};
use serde::Serialize;

use crate::core::ArcStr;
use crate::error::{ExecuteError, LookupError};

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    graph: StableDiGraph<ArcStr, Vec<ArcStr>>,
    index: HashMap<ArcStr, NodeIndex>,
}

impl DependencyGraph {
    /// Replaces the node for `name` with a fresh one, dropping every edge the
    /// previous registration left.
    pub(crate) fn upsert_node(&mut self, name: &ArcStr) -> NodeIndex {
        if let Some(old) = self.index.remove(name) {
            self.graph.remove_node(old);
        }

        let index = self.graph.add_node(name.clone());
        self.index.insert(name.clone(), index);
        index
    }

    /// Adds `producer -> consumer` carrying `artifact`. Adding the same edge
    /// twice is a no-op. Unknown nodes are ignored and reported as `false`.
    pub(crate) fn add_edge(&mut self, producer: &str, consumer: &str, artifact: &ArcStr) -> bool {
        let (Some(&a), Some(&b)) = (self.index.get(producer), self.index.get(consumer)) else {
            return false;
        };

        match self.graph.find_edge(a, b) {
            Some(edge) => {
                let label = &mut self.graph[edge];
                if !label.contains(artifact) {
                    label.push(artifact.clone());
                }
            }
            None => {
                self.graph.add_edge(a, b, vec![artifact.clone()]);
            }
        }

        true
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names of the tasks with an edge into `name`.
    pub(crate) fn producers_of(&self, name: &str) -> Vec<ArcStr> {
        let Some(&index) = self.index.get(name) else {
            return Vec::new();
        };

        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// The subgraph induced by the requested tasks together with all of their
    /// transitive producers.
    pub(crate) fn ancestors_of<I, S>(&self, names: I) -> Result<Subgraph, LookupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut missing = Vec::new();
        let mut closure = BTreeSet::new();
        let reversed = Reversed(&self.graph);

        for name in names {
            let name = name.as_ref();
            let Some(&start) = self.index.get(name) else {
                missing.push(name.to_string());
                continue;
            };

            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                closure.insert(node);
            }
        }

        if !missing.is_empty() {
            return Err(LookupError::MissingTasks(missing));
        }

        Ok(self.induced(&closure))
    }

    /// Builds a standalone graph over `nodes`, inserted in name order so that
    /// the ordering of independent tasks doesn't depend on registration
    /// history.
    fn induced(&self, nodes: &BTreeSet<NodeIndex>) -> Subgraph {
        let mut sorted: Vec<NodeIndex> = nodes.iter().copied().collect();
        sorted.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        let mut graph = DiGraph::with_capacity(sorted.len(), 0);
        let mut mapping = HashMap::with_capacity(sorted.len());

        for &old in &sorted {
            mapping.insert(old, graph.add_node(self.graph[old].clone()));
        }

        for &old in &sorted {
            let mut targets: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(old, Direction::Outgoing)
                .filter(|n| nodes.contains(n))
                .collect();
            targets.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            targets.dedup();

            for target in targets {
                graph.add_edge(mapping[&old], mapping[&target], ());
            }
        }

        Subgraph { graph }
    }

    pub(crate) fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<String> = self.index.keys().map(|n| n.to_string()).collect();
        nodes.sort();

        let mut edges: Vec<EdgeSnapshot> = self
            .graph
            .edge_indices()
            .filter_map(|edge| {
                let (source, target) = self.graph.edge_endpoints(edge)?;
                Some(EdgeSnapshot {
                    producer: self.graph[source].to_string(),
                    consumer: self.graph[target].to_string(),
                    artifacts: self.graph[edge].iter().map(|a| a.to_string()).collect(),
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.producer, &a.consumer).cmp(&(&b.producer, &b.consumer)));

        GraphSnapshot { nodes, edges }
    }
}

/// The ancestor closure of an execution request.
#[derive(Debug)]
pub(crate) struct Subgraph {
    graph: DiGraph<ArcStr, ()>,
}

impl Subgraph {
    /// Task names with every producer before each of its consumers.
    pub(crate) fn topological_order(&self) -> Result<Vec<ArcStr>, ExecuteError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n].clone()).collect())
            .map_err(|cycle| ExecuteError::Cycle(self.graph[cycle.node_id()].to_string()))
    }

    /// For each task, how many of its producers are inside the closure.
    #[cfg(any(test, feature = "parallel"))]
    pub(crate) fn in_degrees(&self) -> HashMap<ArcStr, usize> {
        self.graph
            .node_indices()
            .map(|n| {
                let count = self
                    .graph
                    .neighbors_directed(n, Direction::Incoming)
                    .count();
                (self.graph[n].clone(), count)
            })
            .collect()
    }

    /// For each task, its consumers inside the closure.
    #[cfg(any(test, feature = "parallel"))]
    pub(crate) fn dependents(&self) -> HashMap<ArcStr, Vec<ArcStr>> {
        self.graph
            .node_indices()
            .map(|n| {
                let consumers = self
                    .graph
                    .neighbors_directed(n, Direction::Outgoing)
                    .map(|c| self.graph[c].clone())
                    .collect();
                (self.graph[n].clone(), consumers)
            })
            .collect()
    }
}

/// A read-only copy of the dependency graph for external rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    /// Task names, sorted.
    pub nodes: Vec<String>,
    pub edges: Vec<EdgeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeSnapshot {
    pub producer: String,
    pub consumer: String,
    /// Artifacts written by the producer and read by the consumer.
    pub artifacts: Vec<String>,
}

impl GraphSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the graph as a Mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        self.render_mermaid(|_| None)
    }

    /// Shared by [`GraphSnapshot::to_mermaid`] and the diagnostics renderer:
    /// `decorate` may return a label suffix and a fill colour for a node.
    pub(crate) fn render_mermaid<F>(&self, decorate: F) -> String
    where
        F: Fn(&str) -> Option<(String, String)>,
    {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let ids: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for (i, name) in self.nodes.iter().enumerate() {
            let name_escaped = name.replace('"', "\\\"");
            match decorate(name) {
                Some((extra, colour)) => {
                    let _ = writeln!(f, "    {i}[\"{name_escaped}\\n{extra}\"]");
                    let _ = writeln!(f, "    style {i} fill:{colour}");
                }
                None => {
                    let _ = writeln!(f, "    {i}[\"{name_escaped}\"]");
                }
            }
        }

        for edge in &self.edges {
            // edges to nodes outside the snapshot have nowhere to point
            let (Some(producer), Some(consumer)) = (
                ids.get(edge.producer.as_str()),
                ids.get(edge.consumer.as_str()),
            ) else {
                continue;
            };

            let label = edge.artifacts.join(", ").replace('"', "\\\"");
            let _ = writeln!(f, "    {producer} -- \"{label}\" --> {consumer}");
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(s: &str) -> ArcStr {
        s.into()
    }

    /// Builds a graph from `(producer, consumer)` pairs.
    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::default();
        for node in nodes {
            g.upsert_node(&arc(node));
        }
        for (p, c) in edges {
            assert!(g.add_edge(p, c, &arc(&format!("{p}.dat"))));
        }
        g
    }

    fn position(order: &[ArcStr], name: &str) -> usize {
        order.iter().position(|n| n.as_ref() == name).unwrap()
    }

    #[test]
    fn test_diamond_ordering() {
        //     a
        //    / \
        //   b   c
        //    \ /
        //     d
        let g = graph(
            &["d", "c", "b", "a"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );

        let order = g.ancestors_of(["d"]).unwrap().topological_order().unwrap();

        assert_eq!(order.len(), 4);
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "a") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "d"));
        assert!(position(&order, "c") < position(&order, "d"));
    }

    #[test]
    fn test_ancestors_exclude_unrelated() {
        let g = graph(
            &["a", "b", "x", "y"],
            &[("a", "b"), ("x", "y")],
        );

        let order = g.ancestors_of(["b"]).unwrap().topological_order().unwrap();
        let names: Vec<&str> = order.iter().map(|n| n.as_ref()).collect();

        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_ancestors_union_of_targets() {
        let g = graph(
            &["a", "b", "x", "y", "z"],
            &[("a", "b"), ("x", "y")],
        );

        let order = g.ancestors_of(["b", "y"]).unwrap().topological_order().unwrap();
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_ancestors_missing_target() {
        let g = graph(&["a"], &[]);
        assert_eq!(
            g.ancestors_of(["a", "nope", "gone"]).unwrap_err(),
            LookupError::MissingTasks(vec!["nope".into(), "gone".into()])
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let sub = g.ancestors_of(["a"]).unwrap();

        assert!(matches!(sub.topological_order(), Err(ExecuteError::Cycle(_))));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let g = graph(&["a"], &[("a", "a")]);
        let sub = g.ancestors_of(["a"]).unwrap();

        assert!(matches!(sub.topological_order(), Err(ExecuteError::Cycle(name)) if name == "a"));
    }

    #[test]
    fn test_add_edge_is_idempotent() {
        let mut g = graph(&["a", "b"], &[("a", "b")]);
        g.add_edge("a", "b", &arc("a.dat"));
        g.add_edge("a", "b", &arc("extra.dat"));

        let snapshot = g.snapshot();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].artifacts, ["a.dat", "extra.dat"]);
        assert!(!g.add_edge("a", "ghost", &arc("a.dat")));
    }

    #[test]
    fn test_upsert_drops_old_edges() {
        let mut g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        g.upsert_node(&arc("b"));

        assert!(g.contains("b"));
        assert!(g.producers_of("b").is_empty());
        assert!(g.snapshot().edges.is_empty());
    }

    #[test]
    fn test_degrees_within_closure() {
        let g = graph(
            &["a", "b", "c", "outside"],
            &[("a", "c"), ("b", "c"), ("c", "outside")],
        );
        let sub = g.ancestors_of(["c"]).unwrap();

        let degrees = sub.in_degrees();
        assert_eq!(degrees[&arc("c")], 2);
        assert_eq!(degrees[&arc("a")], 0);
        assert!(!degrees.contains_key(&arc("outside")));

        let dependents = sub.dependents();
        assert_eq!(dependents[&arc("a")], vec![arc("c")]);
        assert!(dependents[&arc("c")].is_empty());
    }

    #[test]
    fn test_mermaid_and_json() {
        let g = graph(&["p", "c"], &[("p", "c")]);
        let snapshot = g.snapshot();

        let mermaid = snapshot.to_mermaid();
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("[\"p\"]"));
        assert!(mermaid.contains("-- \"p.dat\" -->"));

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["nodes"], serde_json::json!(["c", "p"]));
        assert_eq!(json["edges"][0]["producer"], "p");
    }

    #[test]
    fn test_mermaid_skips_dangling_edges() {
        let snapshot = GraphSnapshot {
            nodes: vec!["p".into()],
            edges: vec![EdgeSnapshot {
                producer: "p".into(),
                consumer: "gone".into(),
                artifacts: vec!["p.dat".into()],
            }],
        };

        let mermaid = snapshot.to_mermaid();
        assert!(mermaid.contains("[\"p\"]"));
        assert!(!mermaid.contains("-->"));
    }
}
