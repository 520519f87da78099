//! Derived adjacency over the edge list: children, parents, blockers, cycles.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::core::graph::Graph;
use crate::core::types::EdgeKind;
use crate::error::DagError;

/// Read-only adjacency built from a [`Graph`] snapshot.
///
/// Child lists are ordered by creation order so traversals are deterministic.
/// Rebuild after any edge mutation; status changes do not invalidate it.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    children: BTreeMap<String, Vec<String>>,
    parents: BTreeMap<String, Vec<String>>,
    blockers: BTreeMap<String, Vec<String>>,
}

impl DependencyIndex {
    pub fn build(graph: &Graph) -> Self {
        let mut index = Self::default();
        for edge in &graph.edges {
            match edge.kind {
                EdgeKind::Parent => {
                    index
                        .children
                        .entry(edge.dst.clone())
                        .or_default()
                        .push(edge.src.clone());
                    index
                        .parents
                        .entry(edge.src.clone())
                        .or_default()
                        .push(edge.dst.clone());
                }
                EdgeKind::Blocks => index
                    .blockers
                    .entry(edge.dst.clone())
                    .or_default()
                    .push(edge.src.clone()),
                EdgeKind::Related => {}
            }
        }
        let order = |id: &String| {
            graph
                .get(id)
                .map_or((u64::MAX, id.clone()), |node| (node.seq, id.clone()))
        };
        for kids in index.children.values_mut() {
            kids.sort_by_key(order);
            kids.dedup();
        }
        index
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map_or(&[], Vec::as_slice)
    }

    /// First parent; well-formed graphs have at most one.
    pub fn parent(&self, id: &str) -> Option<&str> {
        self.parents(id).first().map(String::as_str)
    }

    /// Sources of `blocks` edges pointing at `id`.
    pub fn blockers(&self, id: &str) -> &[String] {
        self.blockers.get(id).map_or(&[], Vec::as_slice)
    }

    /// Blockers whose source has not settled into `success` or `skipped`.
    ///
    /// A blocker whose source is missing from the graph is treated as unresolved.
    pub fn unresolved_blockers<'a>(&'a self, graph: &Graph, id: &str) -> Vec<&'a str> {
        self.blockers(id)
            .iter()
            .filter(|src| {
                graph.get(src).is_none_or(|node| {
                    !(node.status.is_terminal() && node.outcome.resolves_blocker())
                })
            })
            .map(String::as_str)
            .collect()
    }

    /// Ancestors of `id`, nearest first. Stops on a repeated id.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id.to_string()]);
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if !seen.insert(parent.to_string()) {
                break;
            }
            out.push(parent.to_string());
            current = parent;
        }
        out
    }

    /// True if `ancestor` is reachable from `id` by following parent edges.
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.parents(id).iter().map(String::as_str).collect();
        while let Some(current) = queue.pop_front() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                queue.extend(self.parents(current).iter().map(String::as_str));
            }
        }
        false
    }

    /// Breadth-first subtree of `root`, including `root` itself.
    pub fn subtree(&self, root: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            queue.extend(self.children(&id).iter().cloned());
            out.push(id);
        }
        out
    }

    pub fn subtree_set(&self, root: &str) -> BTreeSet<String> {
        self.subtree(root).into_iter().collect()
    }

    /// Post-order (children before parents) over the subtree of `root`.
    pub fn post_order(&self, root: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(root.to_string(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            stack.push((id.clone(), true));
            for child in self.children(&id).iter().rev() {
                stack.push((child.clone(), false));
            }
        }
        out
    }

    /// Every distinct cycle in the parent relation reachable from `root`.
    ///
    /// White/gray/black DFS over child links. Each cycle is reported once,
    /// rotated so its smallest id comes first, and closed by repeating it.
    pub fn parent_cycles(&self, root: &str) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Gray,
            Black,
        }

        let mut marks: BTreeMap<String, Mark> = BTreeMap::new();
        let mut found: BTreeSet<Vec<String>> = BTreeSet::new();
        // Iterative DFS: (node, next child index), plus the gray path.
        let mut stack: Vec<(String, usize)> = vec![(root.to_string(), 0)];
        let mut path: Vec<String> = vec![root.to_string()];
        marks.insert(root.to_string(), Mark::Gray);

        while let Some((id, next)) = stack.last().cloned() {
            let kids = self.children(&id);
            if next >= kids.len() {
                marks.insert(id, Mark::Black);
                stack.pop();
                path.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let child = &kids[next];
            match marks.get(child) {
                None => {
                    marks.insert(child.clone(), Mark::Gray);
                    stack.push((child.clone(), 0));
                    path.push(child.clone());
                }
                Some(Mark::Gray) => {
                    if let Some(start) = path.iter().position(|p| p == child) {
                        found.insert(normalize_cycle(&path[start..]));
                    }
                }
                Some(Mark::Black) => {}
            }
        }

        found.into_iter().collect()
    }

    /// `Ok` when the parent relation under `root` is acyclic.
    pub fn cycle_check(&self, root: &str) -> Result<(), DagError> {
        match self.parent_cycles(root).into_iter().next() {
            Some(ids) => Err(DagError::Cycle { ids }),
            None => Ok(()),
        }
    }
}

/// Rotate so the smallest id leads, then close the loop.
fn normalize_cycle(members: &[String]) -> Vec<String> {
    let start = members
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map_or(0, |(idx, _)| idx);
    let mut cycle: Vec<String> = members[start..]
        .iter()
        .chain(&members[..start])
        .cloned()
        .collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Edge, Outcome, Status};
    use crate::test_support::{NOW, graph_with, link};

    fn sample() -> Graph {
        let mut graph = graph_with(&["root", "a", "b", "a1"]);
        link(&mut graph, "a", "root");
        link(&mut graph, "b", "root");
        link(&mut graph, "a1", "a");
        graph
            .add_edge(Edge::new("a", EdgeKind::Blocks, "b"), NOW)
            .expect("blocks");
        graph
    }

    #[test]
    fn children_follow_creation_order() {
        let graph = sample();
        let index = DependencyIndex::build(&graph);
        assert_eq!(index.children("root"), ["a".to_string(), "b".to_string()]);
        assert_eq!(index.parent("a1"), Some("a"));
        assert!(index.children("b").is_empty());
    }

    #[test]
    fn ancestry_queries() {
        let graph = sample();
        let index = DependencyIndex::build(&graph);
        assert_eq!(index.ancestors("a1"), vec!["a".to_string(), "root".to_string()]);
        assert!(index.is_ancestor("root", "a1"));
        assert!(!index.is_ancestor("b", "a1"));
        assert_eq!(index.subtree("a"), vec!["a".to_string(), "a1".to_string()]);
        assert_eq!(
            index.post_order("root"),
            vec![
                "a1".to_string(),
                "a".to_string(),
                "b".to_string(),
                "root".to_string()
            ]
        );
    }

    #[test]
    fn blockers_resolve_only_on_success_family_without_expanded() {
        let mut graph = sample();
        let index = DependencyIndex::build(&graph);
        assert_eq!(index.unresolved_blockers(&graph, "b"), vec!["a"]);

        let a = graph.node_mut("a").expect("a");
        a.status = Status::Closed;
        a.outcome = Outcome::Expanded;
        assert_eq!(index.unresolved_blockers(&graph, "b"), vec!["a"]);

        graph.node_mut("a").expect("a").outcome = Outcome::Success;
        assert!(index.unresolved_blockers(&graph, "b").is_empty());
    }

    #[test]
    fn detects_cycles_written_around_the_edge_checks() {
        let mut graph = graph_with(&["root", "x", "y"]);
        link(&mut graph, "x", "root");
        link(&mut graph, "y", "x");
        // Simulate an external edit that bypassed `add_edge`.
        graph.edges.push(Edge::new("x", EdgeKind::Parent, "y"));

        let index = DependencyIndex::build(&graph);
        let cycles = index.parent_cycles("root");
        assert_eq!(
            cycles,
            vec![vec!["x".to_string(), "y".to_string(), "x".to_string()]]
        );
        assert!(matches!(
            index.cycle_check("root"),
            Err(DagError::Cycle { .. })
        ));
        assert!(index.cycle_check("y").is_err());
    }

    #[test]
    fn acyclic_graph_passes_cycle_check() {
        let graph = sample();
        let index = DependencyIndex::build(&graph);
        assert!(index.parent_cycles("root").is_empty());
        assert_eq!(index.cycle_check("root"), Ok(()));
    }
}
