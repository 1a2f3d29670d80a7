//! The package dependency graph.
//!
//! Nodes are package names held in a petgraph arena (indices, no owning
//! pointers between nodes); an edge A -> B means B depends on A at build,
//! host, run, or test time. Cycles are real in this ecosystem and every
//! operation tolerates them: the topological sort contracts strongly
//! connected components with Tarjan's algorithm, orders the condensation,
//! and emits each component contiguously.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::types::PackageRecord;

/// Store key of the persisted graph document.
pub const GRAPH_KEY: &str = "graph";

/// Serialized form: sorted node list plus sorted edge list, so the stored
/// JSON diffs cleanly between refreshes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDoc {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct PackageGraph {
    graph: DiGraph<String, ()>,
    index: BTreeMap<String, NodeIndex>,
}

impl PackageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from package records: one node per record, one edge R -> N for
    /// every requirement R of N that is itself a known node. Self-loops are
    /// removed on ingest; edges to unknown names are silently dropped.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a PackageRecord>,
        I::IntoIter: Clone,
    {
        let records = records.into_iter();
        let mut graph = Self::new();
        for record in records.clone() {
            graph.add_node(&record.name);
        }
        for record in records {
            for requirement in record.requirements.edge_names() {
                graph.add_edge(&requirement, &record.name);
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Add a dependency edge. No-op for self-loops and unknown endpoints.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if !self.graph.contains_edge(a, b) {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All node names, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn neighbors_sorted(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Packages that depend on `name`, sorted.
    pub fn successors(&self, name: &str) -> Vec<String> {
        self.neighbors_sorted(name, Direction::Outgoing)
    }

    /// Packages `name` depends on, sorted.
    pub fn predecessors(&self, name: &str) -> Vec<String> {
        self.neighbors_sorted(name, Direction::Incoming)
    }

    /// Transitive downstream closure of `name`, excluding `name` itself
    /// unless it sits on a cycle through itself.
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(name) else {
            return BTreeSet::new();
        };
        let mut seen: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(start);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// The induced subgraph of nodes satisfying `predicate`.
    pub fn prune<F: Fn(&str) -> bool>(&self, predicate: F) -> PackageGraph {
        let mut pruned = PackageGraph::new();
        for name in self.index.keys() {
            if predicate(name) {
                pruned.add_node(name);
            }
        }
        for edge in self.graph.edge_indices() {
            let (a, b) = self.graph.edge_endpoints(edge).expect("edge endpoints");
            let from = &self.graph[a];
            let to = &self.graph[b];
            pruned.add_edge(from, to);
        }
        pruned
    }

    /// A total order over `nodes` such that for every edge u -> v not inside
    /// a cycle containing both, u precedes v. Strongly connected components
    /// are emitted contiguously, members sorted by name; incomparable
    /// components tie-break by their lexicographically smallest member.
    pub fn cyclic_topological_sort(&self, nodes: &BTreeSet<String>) -> Vec<String> {
        // Induced subgraph on the requested nodes.
        let mut sub: DiGraph<String, ()> = DiGraph::new();
        let mut sub_index: BTreeMap<&str, NodeIndex> = BTreeMap::new();
        for name in nodes {
            if self.index.contains_key(name) {
                let idx = sub.add_node(name.clone());
                sub_index.insert(name.as_str(), idx);
            }
        }
        for edge in self.graph.edge_indices() {
            let (a, b) = self.graph.edge_endpoints(edge).expect("edge endpoints");
            let (from, to) = (&self.graph[a], &self.graph[b]);
            if let (Some(&fa), Some(&fb)) = (sub_index.get(from.as_str()), sub_index.get(to.as_str())) {
                sub.add_edge(fa, fb, ());
            }
        }

        // Contract components, then Kahn over the condensation with a
        // name-ordered ready set for deterministic tie-breaking.
        let components = tarjan_scc(&sub);
        let mut component_of: HashMap<NodeIndex, usize> = HashMap::new();
        for (comp_id, members) in components.iter().enumerate() {
            for &idx in members {
                component_of.insert(idx, comp_id);
            }
        }

        let mut comp_edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        let mut indegree: Vec<usize> = vec![0; components.len()];
        for edge in sub.edge_indices() {
            let (a, b) = sub.edge_endpoints(edge).expect("edge endpoints");
            let (ca, cb) = (component_of[&a], component_of[&b]);
            if ca != cb && comp_edges[ca].insert(cb) {
                indegree[cb] += 1;
            }
        }

        let comp_key = |comp_id: usize| -> String {
            components[comp_id]
                .iter()
                .map(|&idx| sub[idx].clone())
                .min()
                .expect("component is non-empty")
        };

        let mut ready: BTreeSet<(String, usize)> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(comp_id, _)| (comp_key(comp_id), comp_id))
            .collect();

        let mut out: Vec<String> = Vec::with_capacity(sub.node_count());
        while let Some(entry) = ready.iter().next().cloned() {
            ready.remove(&entry);
            let (_, comp_id) = entry;

            let mut members: Vec<String> =
                components[comp_id].iter().map(|&idx| sub[idx].clone()).collect();
            members.sort();
            out.extend(members);

            for &next in &comp_edges[comp_id] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert((comp_key(next), next));
                }
            }
        }
        out
    }

    /// Convert to the stable serialized form.
    pub fn to_doc(&self) -> GraphDoc {
        let nodes = self.node_names();
        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .map(|edge| {
                let (a, b) = self.graph.edge_endpoints(edge).expect("edge endpoints");
                (self.graph[a].clone(), self.graph[b].clone())
            })
            .collect();
        edges.sort();
        edges.dedup();
        GraphDoc { nodes, edges }
    }

    pub fn from_doc(doc: &GraphDoc) -> Self {
        let mut graph = Self::new();
        for node in &doc.nodes {
            graph.add_node(node);
        }
        for (from, to) in &doc.edges {
            graph.add_edge(from, to);
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::Requirements;

    fn record(name: &str, host: &[&str], run: &[&str]) -> PackageRecord {
        let mut r = PackageRecord::new(name);
        r.requirements = Requirements {
            host: host.iter().map(|s| s.to_string()).collect(),
            run: run.iter().map(|s| s.to_string()).collect(),
            ..Requirements::default()
        };
        r
    }

    fn chain_graph() -> PackageGraph {
        // zlib -> libpng -> pillow, plus independent xz.
        let records = vec![
            record("zlib", &[], &[]),
            record("libpng", &["zlib"], &[]),
            record("pillow", &["libpng"], &["zlib"]),
            record("xz", &[], &[]),
        ];
        PackageGraph::from_records(records.iter())
    }

    #[test]
    fn edges_point_from_dependency_to_dependent() {
        let graph = chain_graph();
        assert_eq!(graph.successors("zlib"), vec!["libpng", "pillow"]);
        assert_eq!(graph.predecessors("pillow"), vec!["libpng", "zlib"]);
        assert_eq!(graph.predecessors("zlib"), Vec::<String>::new());
    }

    #[test]
    fn unknown_requirements_are_dropped() {
        let records = vec![record("a", &["not-a-package"], &[])];
        let graph = PackageGraph::from_records(records.iter());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn self_loops_are_removed_on_ingest() {
        let records = vec![record("bootstrap", &["bootstrap"], &[])];
        let graph = PackageGraph::from_records(records.iter());
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.descendants("bootstrap").is_empty());
    }

    #[test]
    fn descendants_are_transitive() {
        let graph = chain_graph();
        let downstream = graph.descendants("zlib");
        assert!(downstream.contains("libpng"));
        assert!(downstream.contains("pillow"));
        assert!(!downstream.contains("xz"));
        assert!(!downstream.contains("zlib"));
    }

    #[test]
    fn prune_keeps_induced_edges() {
        let graph = chain_graph();
        let pruned = graph.prune(|name| name != "libpng");
        assert_eq!(pruned.node_count(), 3);
        // The zlib -> pillow run edge survives; the path through libpng dies.
        assert_eq!(pruned.successors("zlib"), vec!["pillow"]);
    }

    #[test]
    fn topological_sort_respects_edges() {
        let graph = chain_graph();
        let nodes: BTreeSet<String> = graph.node_names().into_iter().collect();
        let order = graph.cyclic_topological_sort(&nodes);

        let position = |name: &str| order.iter().position(|n| n == name).expect("present");
        assert!(position("zlib") < position("libpng"));
        assert!(position("libpng") < position("pillow"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn independent_nodes_tie_break_lexicographically() {
        let records = vec![
            record("zeta", &[], &[]),
            record("alpha", &[], &[]),
            record("mid", &[], &[]),
        ];
        let graph = PackageGraph::from_records(records.iter());
        let nodes: BTreeSet<String> = graph.node_names().into_iter().collect();
        assert_eq!(graph.cyclic_topological_sort(&nodes), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn cycle_members_are_emitted_contiguously_and_sorted() {
        // c -> a -> b -> c cycle feeding into d; e upstream of the cycle.
        let records = vec![
            record("a", &["c", "e"], &[]),
            record("b", &["a"], &[]),
            record("c", &["b"], &[]),
            record("d", &["c"], &[]),
            record("e", &[], &[]),
        ];
        let graph = PackageGraph::from_records(records.iter());
        let nodes: BTreeSet<String> = graph.node_names().into_iter().collect();
        let order = graph.cyclic_topological_sort(&nodes);

        assert_eq!(order[0], "e");
        assert_eq!(&order[1..4], ["a", "b", "c"]);
        assert_eq!(order[4], "d");
    }

    #[test]
    fn three_cycle_alone_sorts_lexicographically() {
        let records = vec![
            record("a", &["c"], &[]),
            record("b", &["a"], &[]),
            record("c", &["b"], &[]),
        ];
        let graph = PackageGraph::from_records(records.iter());
        let nodes: BTreeSet<String> = graph.node_names().into_iter().collect();
        assert_eq!(graph.cyclic_topological_sort(&nodes), vec!["a", "b", "c"]);
    }

    #[test]
    fn sort_of_subset_ignores_outside_nodes() {
        let graph = chain_graph();
        let nodes: BTreeSet<String> =
            ["pillow".to_string(), "zlib".to_string()].into_iter().collect();
        let order = graph.cyclic_topological_sort(&nodes);
        assert_eq!(order, vec!["zlib", "pillow"]);
    }

    #[test]
    fn empty_graph_sorts_to_nothing() {
        let graph = PackageGraph::new();
        assert!(graph.cyclic_topological_sort(&BTreeSet::new()).is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn doc_round_trip_preserves_structure() {
        let graph = chain_graph();
        let doc = graph.to_doc();
        let back = PackageGraph::from_doc(&doc);
        assert_eq!(back.to_doc(), doc);
        assert_eq!(back.node_count(), graph.node_count());
        assert_eq!(back.edge_count(), graph.edge_count());
    }

    #[test]
    fn doc_is_sorted_for_stable_diffs() {
        let graph = chain_graph();
        let doc = graph.to_doc();
        let mut nodes = doc.nodes.clone();
        nodes.sort();
        assert_eq!(doc.nodes, nodes);
        let mut edges = doc.edges.clone();
        edges.sort();
        assert_eq!(doc.edges, edges);
    }

    proptest! {
        #[test]
        fn sort_emits_every_requested_node_exactly_once(
            edges in prop::collection::vec((0u8..12, 0u8..12), 0..40)
        ) {
            let mut graph = PackageGraph::new();
            for i in 0..12u8 {
                graph.add_node(&format!("pkg{i:02}"));
            }
            for (a, b) in &edges {
                graph.add_edge(&format!("pkg{a:02}"), &format!("pkg{b:02}"));
            }

            let nodes: BTreeSet<String> = graph.node_names().into_iter().collect();
            let order = graph.cyclic_topological_sort(&nodes);
            prop_assert_eq!(order.len(), 12);
            let unique: BTreeSet<&String> = order.iter().collect();
            prop_assert_eq!(unique.len(), 12);
        }

        #[test]
        fn acyclic_edges_are_respected(
            edges in prop::collection::vec((0u8..10, 0u8..10), 0..30)
        ) {
            // Force acyclicity by orienting all edges small -> large.
            let mut graph = PackageGraph::new();
            for i in 0..10u8 {
                graph.add_node(&format!("n{i}"));
            }
            for (a, b) in &edges {
                let (lo, hi) = (a.min(b), a.max(b));
                graph.add_edge(&format!("n{lo}"), &format!("n{hi}"));
            }

            let nodes: BTreeSet<String> = graph.node_names().into_iter().collect();
            let order = graph.cyclic_topological_sort(&nodes);
            for (a, b) in &edges {
                prop_assume!(a != b);
                let (lo, hi) = (a.min(b), a.max(b));
                let pos_lo = order.iter().position(|n| n == &format!("n{lo}")).unwrap();
                let pos_hi = order.iter().position(|n| n == &format!("n{hi}")).unwrap();
                prop_assert!(pos_lo < pos_hi);
            }
        }
    }
}
