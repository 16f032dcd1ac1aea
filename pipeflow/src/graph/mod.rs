//! Generic directed-graph container.
//!
//! Nodes are arbitrary hashable identities, edges are directed. The graph
//! keeps an explicit node table plus insertion order; traversal marks
//! (`discovered`/`examined`) live in a per-traversal side table so nodes are
//! never mutated by a walk and concurrent traversals cannot alias. Each node
//! carries an open annotation table (`xtra`) that callers may use for
//! metadata; core algorithms never read it.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// A directed graph over node identities of type `N`.
#[derive(Debug, Clone)]
pub struct Graph<N: Clone + Eq + Hash> {
    nodes: HashMap<N, NodeEntry<N>>,
    order: Vec<N>,
}

impl<N: Clone + Eq + Hash> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct NodeEntry<N> {
    out: Vec<N>,
    xtra: HashMap<String, Value>,
}

impl<N> Default for NodeEntry<N> {
    fn default() -> Self {
        Self {
            out: Vec::new(),
            xtra: HashMap::new(),
        }
    }
}

/// Per-traversal marks, held outside the node table.
struct Marks<N> {
    discovered: HashSet<N>,
    examined: HashSet<N>,
}

impl<N: Clone + Eq + Hash> Marks<N> {
    fn new() -> Self {
        Self {
            discovered: HashSet::new(),
            examined: HashSet::new(),
        }
    }
}

impl<N: Clone + Eq + Hash> Graph<N> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if the node is present.
    #[must_use]
    pub fn contains(&self, node: &N) -> bool {
        self.nodes.contains_key(node)
    }

    /// Adds a node. Returns false if it was already present.
    pub fn add_node(&mut self, node: N) -> bool {
        if self.nodes.contains_key(&node) {
            return false;
        }
        self.order.push(node.clone());
        self.nodes.insert(node, NodeEntry::default());
        true
    }

    /// Removes a node and every edge touching it. Returns false if absent.
    pub fn del_node(&mut self, node: &N) -> bool {
        if self.nodes.remove(node).is_none() {
            return false;
        }
        self.order.retain(|n| n != node);
        for entry in self.nodes.values_mut() {
            entry.out.retain(|n| n != node);
        }
        true
    }

    /// Adds a directed edge, inserting missing endpoints.
    ///
    /// Returns false if the edge was already present.
    pub fn add_edge(&mut self, from: N, to: N) -> bool {
        self.add_node(from.clone());
        self.add_node(to.clone());
        match self.nodes.get_mut(&from) {
            Some(entry) if !entry.out.contains(&to) => {
                entry.out.push(to);
                true
            }
            _ => false,
        }
    }

    /// Removes a directed edge. Returns false if absent.
    pub fn del_edge(&mut self, from: &N, to: &N) -> bool {
        match self.nodes.get_mut(from) {
            Some(entry) => {
                let before = entry.out.len();
                entry.out.retain(|n| n != to);
                entry.out.len() != before
            }
            None => false,
        }
    }

    /// Returns the nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> Vec<N> {
        self.order.clone()
    }

    /// Returns every edge as a `(from, to)` pair, in insertion order.
    #[must_use]
    pub fn edges(&self) -> Vec<(N, N)> {
        let mut out = Vec::new();
        for from in &self.order {
            if let Some(entry) = self.nodes.get(from) {
                for to in &entry.out {
                    out.push((from.clone(), to.clone()));
                }
            }
        }
        out
    }

    /// Returns the direct successors of a node, in edge insertion order.
    #[must_use]
    pub fn outgoing(&self, node: &N) -> Vec<N> {
        self.nodes
            .get(node)
            .map(|e| e.out.clone())
            .unwrap_or_default()
    }

    /// Returns the direct predecessors of a node, in insertion order.
    #[must_use]
    pub fn incoming(&self, node: &N) -> Vec<N> {
        let mut out = Vec::new();
        for from in &self.order {
            if let Some(entry) = self.nodes.get(from) {
                if entry.out.contains(node) {
                    out.push(from.clone());
                }
            }
        }
        out
    }

    /// Borrows a node's annotation table.
    #[must_use]
    pub fn xtra(&self, node: &N) -> Option<&HashMap<String, Value>> {
        self.nodes.get(node).map(|e| &e.xtra)
    }

    /// Mutably borrows a node's annotation table.
    pub fn xtra_mut(&mut self, node: &N) -> Option<&mut HashMap<String, Value>> {
        self.nodes.get_mut(node).map(|e| &mut e.xtra)
    }

    /// Returns true if a directed path exists from `from` to `to`.
    #[must_use]
    pub fn has_path(&self, from: &N, to: &N) -> bool {
        self.find_path(from, to).is_some()
    }

    /// Returns a directed path from `from` to `to`, if one exists.
    #[must_use]
    pub fn find_path(&self, from: &N, to: &N) -> Option<Vec<N>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        let mut marks = Marks::new();
        let mut path = vec![from.clone()];
        if self.path_visit(from, to, &mut marks, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn path_visit(&self, node: &N, to: &N, marks: &mut Marks<N>, path: &mut Vec<N>) -> bool {
        if node == to {
            return true;
        }
        marks.discovered.insert(node.clone());
        for next in self.outgoing(node) {
            if marks.discovered.contains(&next) {
                continue;
            }
            path.push(next.clone());
            if self.path_visit(&next, to, marks, path) {
                return true;
            }
            path.pop();
        }
        marks.examined.insert(node.clone());
        false
    }

    /// Depth-first traversal from `root`, in discovery order.
    #[must_use]
    pub fn dfs_from(&self, root: &N) -> Vec<N> {
        let mut marks = Marks::new();
        let mut out = Vec::new();
        if self.contains(root) {
            self.dfs_visit(root, &mut marks, &mut out, &mut Vec::new());
        }
        out
    }

    /// Postorder over the whole graph: every node appears after all of its
    /// successors. Roots are visited in insertion order for determinism.
    #[must_use]
    pub fn postorder(&self) -> Vec<N> {
        let mut marks = Marks::new();
        let mut post = Vec::new();
        for node in &self.order {
            if !marks.discovered.contains(node) {
                self.dfs_visit(node, &mut marks, &mut Vec::new(), &mut post);
            }
        }
        post
    }

    /// Preorder: the reverse of [`Graph::postorder`].
    #[must_use]
    pub fn preorder(&self) -> Vec<N> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Topological order for an acyclic graph: every node appears before
    /// all of its successors (producers before consumers).
    #[must_use]
    pub fn topological(&self) -> Vec<N> {
        self.preorder()
    }

    fn dfs_visit(&self, node: &N, marks: &mut Marks<N>, pre: &mut Vec<N>, post: &mut Vec<N>) {
        marks.discovered.insert(node.clone());
        pre.push(node.clone());
        for next in self.outgoing(node) {
            if !marks.discovered.contains(&next) {
                self.dfs_visit(&next, marks, pre, post);
            }
        }
        marks.examined.insert(node.clone());
        post.push(node.clone());
    }

    /// Rank of each node: the length of the longest path reaching it from
    /// any node without predecessors. Meaningful for acyclic graphs.
    #[must_use]
    pub fn node_ranks(&self) -> HashMap<N, usize> {
        let mut ranks: HashMap<N, usize> = HashMap::new();
        for node in self.topological() {
            let rank = self
                .incoming(&node)
                .iter()
                .filter_map(|p| ranks.get(p).map(|r| r + 1))
                .max()
                .unwrap_or(0);
            ranks.insert(node, rank);
        }
        ranks
    }

    /// Rank of a single node, if present.
    #[must_use]
    pub fn node_rank(&self, node: &N) -> Option<usize> {
        self.node_ranks().remove(node)
    }

    /// Number of nodes at the given rank.
    #[must_use]
    pub fn node_width(&self, rank: usize) -> usize {
        self.node_ranks().values().filter(|&&r| r == rank).count()
    }

    /// The widest rank's node count; 0 for an empty graph.
    #[must_use]
    pub fn graph_width(&self) -> usize {
        let ranks = self.node_ranks();
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for rank in ranks.values() {
            *counts.entry(*rank).or_insert(0) += 1;
        }
        counts.values().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diamond() -> Graph<&'static str> {
        // a -> b -> d, a -> c -> d
        let mut g = Graph::new();
        g.add_edge("a", "b");
        g.add_edge("a", "c");
        g.add_edge("b", "d");
        g.add_edge("c", "d");
        g
    }

    #[test]
    fn test_default_graph_over_non_default_nodes() {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        struct Id(u64);

        let mut g: Graph<Id> = Graph::default();
        g.add_edge(Id(1), Id(2));
        assert_eq!(g.len(), 2);
        assert!(g.has_path(&Id(1), &Id(2)));
    }

    #[test]
    fn test_add_and_remove() {
        let mut g = diamond();
        assert_eq!(g.len(), 4);
        assert!(!g.add_node("a"));
        assert!(g.del_node(&"d"));
        assert_eq!(g.len(), 3);
        assert!(g.outgoing(&"b").is_empty());
        assert!(!g.del_edge(&"a", &"d"));
    }

    #[test]
    fn test_incoming_outgoing() {
        let g = diamond();
        assert_eq!(g.outgoing(&"a"), vec!["b", "c"]);
        assert_eq!(g.incoming(&"d"), vec!["b", "c"]);
        assert!(g.incoming(&"a").is_empty());
    }

    #[test]
    fn test_has_path_and_find_path() {
        let g = diamond();
        assert!(g.has_path(&"a", &"d"));
        assert!(!g.has_path(&"d", &"a"));
        let path = g.find_path(&"a", &"d").unwrap();
        assert_eq!(path.first(), Some(&"a"));
        assert_eq!(path.last(), Some(&"d"));
    }

    #[test]
    fn test_topological_order() {
        let g = diamond();
        let order = g.topological();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_postorder_has_successors_first() {
        let g = diamond();
        let order = g.postorder();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("d") < pos("b"));
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn test_ranks_and_width() {
        let g = diamond();
        let ranks = g.node_ranks();
        assert_eq!(ranks[&"a"], 0);
        assert_eq!(ranks[&"b"], 1);
        assert_eq!(ranks[&"c"], 1);
        assert_eq!(ranks[&"d"], 2);
        assert_eq!(g.node_width(1), 2);
        assert_eq!(g.graph_width(), 2);
    }

    #[test]
    fn test_xtra_annotations() {
        let mut g = diamond();
        g.xtra_mut(&"a").unwrap().insert("color".into(), json!("red"));
        assert_eq!(g.xtra(&"a").unwrap().get("color"), Some(&json!("red")));
        assert!(g.xtra(&"missing").is_none());
    }

    #[test]
    fn test_dfs_from() {
        let g = diamond();
        let visited = g.dfs_from(&"a");
        assert_eq!(visited.len(), 4);
        assert_eq!(visited[0], "a");
    }
}
