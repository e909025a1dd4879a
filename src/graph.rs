//! Graph positions, edges, and the read-only graph oracle.
//!
//! The mapper never mutates the base graph. Everything it needs is expressed
//! through the [`GraphIndex`] trait: node lengths and sequences, edge fans,
//! successor positions, an approximate linear position along a canonical
//! layout, bounded path distances, and path projections. [`MemoryGraph`] is a
//! complete in-memory implementation used by the test suite and suitable as a
//! lightweight backend for small graphs.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// An oriented base position in the graph: `(node, strand, offset)`.
///
/// `offset` counts bases from the start of the node in the given orientation
/// and satisfies `offset <= node_length(node)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphPos {
    pub node: u64,
    pub is_reverse: bool,
    pub offset: u32,
}

impl GraphPos {
    pub fn new(node: u64, is_reverse: bool, offset: u32) -> Self {
        GraphPos {
            node,
            is_reverse,
            offset,
        }
    }

    /// The same physical position expressed on the other strand.
    pub fn reverse(&self, node_length: u32) -> GraphPos {
        GraphPos {
            node: self.node,
            is_reverse: !self.is_reverse,
            offset: node_length - self.offset,
        }
    }

    /// Node handle for this position: the node with strand, offset dropped.
    pub fn handle(&self) -> (u64, bool) {
        (self.node, self.is_reverse)
    }
}

impl std::fmt::Display for GraphPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}:{}",
            self.node,
            if self.is_reverse { '-' } else { '+' },
            self.offset
        )
    }
}

/// A bidirected edge between node sides.
///
/// The edge attaches to the end of `from` unless `from_start`, and to the
/// start of `to` unless `to_end`. A plain `from.end -> to.start` edge has
/// both flags false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub from: u64,
    pub from_start: bool,
    pub to: u64,
    pub to_end: bool,
}

impl Edge {
    pub fn forward(from: u64, to: u64) -> Self {
        Edge {
            from,
            from_start: false,
            to,
            to_end: false,
        }
    }
}

/// Successor handles of an oriented node under a set of edges.
///
/// Exiting handle `(n, rev)` leaves through the start side when reversed and
/// the end side otherwise; each matching edge side yields the handle entered
/// through the opposite side.
pub fn edge_successors(edges: &[Edge], node: u64, is_reverse: bool) -> Vec<(u64, bool)> {
    let mut out = Vec::new();
    for e in edges {
        if e.from == node && e.from_start == is_reverse {
            out.push((e.to, e.to_end));
        }
        if e.to == node && e.to_end == !is_reverse {
            out.push((e.from, !e.from_start));
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Read-only oracle over the base graph.
pub trait GraphIndex: Send + Sync {
    fn has_node(&self, id: u64) -> bool;
    fn node_length(&self, id: u64) -> u32;
    /// Node sequence in forward orientation; empty when the node is absent.
    fn node_sequence(&self, id: u64) -> Vec<u8>;
    /// All edges incident to a node, on either side.
    fn edges_of(&self, id: u64) -> Vec<Edge>;
    /// Positions one base forward of `pos`, crossing edges at node ends.
    /// With `walk_whole_node` the step jumps directly to successor nodes.
    fn next_positions(&self, pos: GraphPos, walk_whole_node: bool) -> Vec<GraphPos>;
    /// Offset of `pos` along a canonical linear layout of the graph.
    fn approx_position(&self, pos: GraphPos) -> i64;
    /// Node whose layout interval contains the given approximate position.
    fn node_at_approx_position(&self, pos: i64) -> Option<u64>;
    /// Minimum distance between two positions measured along embedded paths,
    /// falling back to the layout difference; callers bound it with `cap`.
    fn min_path_distance(&self, a: GraphPos, b: GraphPos, cap: i64) -> i64;
    /// Projection of a node position onto every embedded path.
    fn position_in_paths(&self, node: u64, is_reverse: bool, offset: u32)
        -> BTreeMap<String, Vec<i64>>;
    /// Whether the graph carries any embedded paths.
    fn path_count(&self) -> usize;
    fn node_count(&self) -> u64;
    fn total_sequence_length(&self) -> u64;
    /// All node ids, ascending.
    fn node_ids(&self) -> Vec<u64>;

    /// Mean node length, used to size context expansions.
    fn average_node_length(&self) -> f64 {
        if self.node_count() == 0 {
            return 0.0;
        }
        self.total_sequence_length() as f64 / self.node_count() as f64
    }

    /// Base character at a position, on the strand of the position.
    fn position_char(&self, pos: GraphPos) -> Option<u8> {
        let seq = self.node_sequence(pos.node);
        if seq.is_empty() || pos.offset as usize >= seq.len() {
            return None;
        }
        if pos.is_reverse {
            let b = seq[seq.len() - 1 - pos.offset as usize];
            Some(crate::utils::revcomp(&[b])[0])
        } else {
            Some(seq[pos.offset as usize])
        }
    }
}

/// Exact forward distance in bases from cut `a` to cut `b`, bounded by
/// `cap`.
///
/// Positions are treated as cuts between bases, so a position at the end of
/// one node and a position at offset 0 of its successor are zero bases
/// apart. Returns `cap` when `b` is not reachable within the bound.
pub fn graph_distance(graph: &dyn GraphIndex, a: GraphPos, b: GraphPos, cap: i64) -> i64 {
    // closure over the zero-length hop from a node end onto successor starts
    let closure = |pos: GraphPos, out: &mut Vec<GraphPos>| {
        out.push(pos);
        let mut stack = vec![pos];
        while let Some(p) = stack.pop() {
            if p.offset == graph.node_length(p.node) {
                let edges = graph.edges_of(p.node);
                for (succ, succ_rev) in edge_successors(&edges, p.node, p.is_reverse) {
                    if !graph.has_node(succ) {
                        continue;
                    }
                    let q = GraphPos::new(succ, succ_rev, 0);
                    if !out.contains(&q) {
                        out.push(q);
                        stack.push(q);
                    }
                }
            }
        }
    };

    let mut frontier: Vec<GraphPos> = Vec::new();
    closure(a, &mut frontier);
    if frontier.contains(&b) {
        return 0;
    }
    let mut seen: HashSet<GraphPos> = frontier.iter().copied().collect();
    let mut dist: i64 = 0;
    while !frontier.is_empty() && dist < cap {
        dist += 1;
        let mut next = Vec::new();
        for pos in frontier {
            if pos.offset >= graph.node_length(pos.node) {
                continue;
            }
            let stepped = GraphPos::new(pos.node, pos.is_reverse, pos.offset + 1);
            let mut reached = Vec::new();
            closure(stepped, &mut reached);
            for q in reached {
                if q == b {
                    return dist;
                }
                if seen.insert(q) {
                    next.push(q);
                }
            }
        }
        frontier = next;
    }
    cap
}

/// A small mutable graph extracted around a candidate mapping location.
///
/// Used as the target of local and pinned alignment, and as the scratch
/// space for patching, where node sequences may be trimmed at cut points.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    nodes: BTreeMap<u64, Vec<u8>>,
    edges: BTreeSet<Edge>,
}

impl Subgraph {
    pub fn new() -> Self {
        Subgraph::default()
    }

    pub fn add_node(&mut self, id: u64, seq: Vec<u8>) {
        self.nodes.entry(id).or_insert(seq);
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.insert(edge);
    }

    pub fn has_node(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_seq(&self, id: u64) -> Option<&[u8]> {
        self.nodes.get(&id).map(|s| s.as_slice())
    }

    pub fn node_len(&self, id: u64) -> u32 {
        self.nodes.get(&id).map(|s| s.len() as u32).unwrap_or(0)
    }

    pub fn set_node_seq(&mut self, id: u64, seq: Vec<u8>) {
        self.nodes.insert(id, seq);
    }

    pub fn remove_node(&mut self, id: u64) {
        self.nodes.remove(&id);
        self.edges
            .retain(|e| e.from != id && e.to != id);
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total sequence length across all nodes.
    pub fn total_len(&self) -> usize {
        self.nodes.values().map(|s| s.len()).sum()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter()
    }

    /// Drop edges whose endpoints are not both present.
    pub fn remove_orphan_edges(&mut self) {
        let nodes = &self.nodes;
        self.edges
            .retain(|e| nodes.contains_key(&e.from) && nodes.contains_key(&e.to));
    }

    pub fn successors(&self, node: u64, is_reverse: bool) -> Vec<(u64, bool)> {
        let incident: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.from == node || e.to == node)
            .copied()
            .collect();
        edge_successors(&incident, node, is_reverse)
    }

    pub fn predecessors(&self, node: u64, is_reverse: bool) -> Vec<(u64, bool)> {
        self.successors(node, !is_reverse)
            .into_iter()
            .map(|(n, r)| (n, !r))
            .collect()
    }

    /// Forward-strand topological order of the nodes.
    ///
    /// Cycles introduced by context expansion are broken at their lowest
    /// remaining in-degree node so that local alignment still sees every
    /// node exactly once.
    pub fn topological_order(&self) -> Vec<u64> {
        let mut indegree: BTreeMap<u64, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        for e in &self.edges {
            if !e.from_start && !e.to_end && self.has_node(e.from) && self.has_node(e.to) {
                *indegree.entry(e.to).or_insert(0) += 1;
            }
        }
        let mut ready: VecDeque<u64> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut remaining: BTreeSet<u64> = self.nodes.keys().copied().collect();
        while order.len() < self.nodes.len() {
            let id = match ready.pop_front() {
                Some(id) if remaining.contains(&id) => id,
                Some(_) => continue,
                None => {
                    // cycle: pick the lowest remaining node and cut it loose
                    match remaining.iter().next() {
                        Some(&id) => id,
                        None => break,
                    }
                }
            };
            remaining.remove(&id);
            order.push(id);
            for e in &self.edges {
                if e.from == id && !e.from_start && !e.to_end && remaining.contains(&e.to) {
                    let d = indegree.get_mut(&e.to).unwrap();
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        ready.push_back(e.to);
                    }
                }
            }
        }
        order
    }

    /// Nodes with no incoming forward edge.
    pub fn source_nodes(&self) -> Vec<u64> {
        self.nodes
            .keys()
            .filter(|&&id| {
                !self
                    .edges
                    .iter()
                    .any(|e| e.to == id && !e.from_start && !e.to_end && self.has_node(e.from))
            })
            .copied()
            .collect()
    }
}

/// Pull a single node into a subgraph.
pub fn extract_node(graph: &dyn GraphIndex, id: u64, sub: &mut Subgraph) {
    if graph.has_node(id) {
        sub.add_node(id, graph.node_sequence(id));
        for e in graph.edges_of(id) {
            sub.add_edge(e);
        }
    }
}

/// Grow a subgraph outward by up to `length` bases of context.
///
/// Walks node-by-node from the current boundary, forward and/or backward,
/// accumulating the shortest node length per ring the way the original
/// context collector does.
pub fn expand_context(
    graph: &dyn GraphIndex,
    sub: &mut Subgraph,
    length: i64,
    forward: bool,
    backward: bool,
) {
    let mut seen: HashSet<(u64, bool)> = HashSet::new();
    let mut frontier: Vec<(u64, bool)> = Vec::new();
    for id in sub.node_ids().collect::<Vec<_>>() {
        if forward {
            frontier.push((id, false));
        }
        if backward {
            frontier.push((id, true));
        }
    }
    let mut walked: i64 = 0;
    while !frontier.is_empty() && walked < length {
        let mut next = Vec::new();
        let mut ring_min: i64 = 0;
        for (node, rev) in frontier {
            if !seen.insert((node, rev)) {
                continue;
            }
            let edges = graph.edges_of(node);
            for e in &edges {
                sub.add_edge(*e);
            }
            for (succ, succ_rev) in edge_successors(&edges, node, rev) {
                if !graph.has_node(succ) {
                    continue;
                }
                if !sub.has_node(succ) {
                    let seq = graph.node_sequence(succ);
                    let len = seq.len() as i64;
                    ring_min = if ring_min == 0 { len } else { ring_min.min(len) };
                    sub.add_node(succ, seq);
                }
                next.push((succ, succ_rev));
            }
        }
        walked += ring_min.max(1);
        frontier = next;
    }
    sub.remove_orphan_edges();
}

/// In-memory [`GraphIndex`] implementation.
///
/// Nodes are laid out along the first embedded path when one exists and in
/// ascending id order otherwise; approximate positions are offsets into that
/// layout.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    nodes: BTreeMap<u64, Vec<u8>>,
    edges: BTreeMap<u64, Vec<Edge>>,
    paths: BTreeMap<String, Vec<(u64, bool)>>,
    node_starts: BTreeMap<u64, i64>,
    layout: Vec<(i64, u64)>,
    path_offsets: BTreeMap<String, BTreeMap<u64, Vec<i64>>>,
    total_len: u64,
}

impl MemoryGraph {
    pub fn new() -> Self {
        MemoryGraph::default()
    }

    pub fn add_node(&mut self, id: u64, seq: &[u8]) -> &mut Self {
        self.total_len += seq.len() as u64;
        self.nodes.insert(id, seq.to_vec());
        self.rebuild_layout();
        self
    }

    pub fn add_edge(&mut self, from: u64, to: u64) -> &mut Self {
        self.add_full_edge(Edge::forward(from, to))
    }

    pub fn add_full_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.entry(edge.from).or_default().push(edge);
        if edge.from != edge.to {
            self.edges.entry(edge.to).or_default().push(edge);
        }
        self
    }

    /// Register an embedded path as an oriented node walk.
    pub fn add_path(&mut self, name: &str, walk: &[(u64, bool)]) -> &mut Self {
        self.paths.insert(name.to_string(), walk.to_vec());
        let mut offsets: BTreeMap<u64, Vec<i64>> = BTreeMap::new();
        let mut at: i64 = 0;
        for &(node, _) in walk {
            offsets.entry(node).or_default().push(at);
            at += self.nodes.get(&node).map(|s| s.len() as i64).unwrap_or(0);
        }
        self.path_offsets.insert(name.to_string(), offsets);
        self.rebuild_layout();
        self
    }

    fn rebuild_layout(&mut self) {
        self.node_starts.clear();
        self.layout.clear();
        let mut at: i64 = 0;
        if let Some(walk) = self.paths.values().next() {
            for &(node, _) in walk {
                if !self.node_starts.contains_key(&node) {
                    self.node_starts.insert(node, at);
                    self.layout.push((at, node));
                }
                at += self.nodes.get(&node).map(|s| s.len() as i64).unwrap_or(0);
            }
        }
        for (&id, seq) in &self.nodes {
            if !self.node_starts.contains_key(&id) {
                self.node_starts.insert(id, at);
                self.layout.push((at, id));
                at += seq.len() as i64;
            }
        }
        self.layout.sort_unstable();
    }
}

impl GraphIndex for MemoryGraph {
    fn has_node(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    fn node_length(&self, id: u64) -> u32 {
        self.nodes.get(&id).map(|s| s.len() as u32).unwrap_or(0)
    }

    fn node_sequence(&self, id: u64) -> Vec<u8> {
        self.nodes.get(&id).cloned().unwrap_or_default()
    }

    fn edges_of(&self, id: u64) -> Vec<Edge> {
        self.edges.get(&id).cloned().unwrap_or_default()
    }

    fn next_positions(&self, pos: GraphPos, walk_whole_node: bool) -> Vec<GraphPos> {
        let len = self.node_length(pos.node);
        if len == 0 {
            return Vec::new();
        }
        if !walk_whole_node && pos.offset + 1 < len {
            return vec![GraphPos::new(pos.node, pos.is_reverse, pos.offset + 1)];
        }
        let edges = self.edges_of(pos.node);
        edge_successors(&edges, pos.node, pos.is_reverse)
            .into_iter()
            .filter(|(n, _)| self.has_node(*n))
            .map(|(n, r)| GraphPos::new(n, r, 0))
            .collect()
    }

    fn approx_position(&self, pos: GraphPos) -> i64 {
        let start = self.node_starts.get(&pos.node).copied().unwrap_or(0);
        if pos.is_reverse {
            start + self.node_length(pos.node) as i64 - pos.offset as i64
        } else {
            start + pos.offset as i64
        }
    }

    fn node_at_approx_position(&self, pos: i64) -> Option<u64> {
        if self.layout.is_empty() {
            return None;
        }
        let idx = match self.layout.binary_search_by_key(&pos, |&(start, _)| start) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        // clamps to the nearest node when the position falls off the layout
        Some(self.layout[idx].1)
    }

    fn min_path_distance(&self, a: GraphPos, b: GraphPos, cap: i64) -> i64 {
        let mut best: Option<i64> = None;
        let pa = self.position_in_paths(a.node, a.is_reverse, a.offset);
        let pb = self.position_in_paths(b.node, b.is_reverse, b.offset);
        for (name, offs_a) in &pa {
            if let Some(offs_b) = pb.get(name) {
                for &x in offs_a {
                    for &y in offs_b {
                        let d = (y - x).abs();
                        best = Some(best.map_or(d, |b: i64| b.min(d)));
                    }
                }
            }
        }
        let d = best.unwrap_or_else(|| (self.approx_position(b) - self.approx_position(a)).abs());
        d.min(cap)
    }

    fn position_in_paths(
        &self,
        node: u64,
        _is_reverse: bool,
        offset: u32,
    ) -> BTreeMap<String, Vec<i64>> {
        let mut out = BTreeMap::new();
        for (name, offsets) in &self.path_offsets {
            if let Some(starts) = offsets.get(&node) {
                out.insert(
                    name.clone(),
                    starts.iter().map(|&s| s + offset as i64).collect(),
                );
            }
        }
        out
    }

    fn path_count(&self) -> usize {
        self.paths.len()
    }

    fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }

    fn total_sequence_length(&self) -> u64 {
        self.total_len
    }

    fn node_ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> MemoryGraph {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGT").add_node(2, b"TTGA").add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        g
    }

    #[test]
    fn position_reversal_is_involutive() {
        let pos = GraphPos::new(7, false, 3);
        assert_eq!(pos.reverse(10).reverse(10), pos);
        assert_eq!(pos.reverse(10).offset, 7);
    }

    #[test]
    fn next_positions_cross_edges() {
        let g = two_node_graph();
        let inside = g.next_positions(GraphPos::new(1, false, 1), false);
        assert_eq!(inside, vec![GraphPos::new(1, false, 2)]);
        let at_end = g.next_positions(GraphPos::new(1, false, 3), false);
        assert_eq!(at_end, vec![GraphPos::new(2, false, 0)]);
    }

    #[test]
    fn approx_positions_follow_the_path_layout() {
        let g = two_node_graph();
        assert_eq!(g.approx_position(GraphPos::new(1, false, 0)), 0);
        assert_eq!(g.approx_position(GraphPos::new(2, false, 1)), 5);
        assert_eq!(g.node_at_approx_position(5), Some(2));
    }

    #[test]
    fn graph_distance_is_bounded() {
        let g = two_node_graph();
        let a = GraphPos::new(1, false, 0);
        let b = GraphPos::new(2, false, 0);
        assert_eq!(graph_distance(&g, a, b, 100), 4);
        assert_eq!(graph_distance(&g, b, a, 10), 10); // unreachable forward
        // a cut flush against a node end touches the successor's start
        assert_eq!(
            graph_distance(&g, GraphPos::new(1, false, 4), b, 100),
            0
        );
    }

    #[test]
    fn subgraph_topological_order_and_orphans() {
        let mut sub = Subgraph::new();
        sub.add_node(1, b"AC".to_vec());
        sub.add_node(2, b"GT".to_vec());
        sub.add_edge(Edge::forward(1, 2));
        sub.add_edge(Edge::forward(2, 9)); // 9 is absent
        sub.remove_orphan_edges();
        assert_eq!(sub.edges().count(), 1);
        assert_eq!(sub.topological_order(), vec![1, 2]);
        assert_eq!(sub.source_nodes(), vec![1]);
    }

    #[test]
    fn position_char_respects_strand() {
        let g = two_node_graph();
        assert_eq!(g.position_char(GraphPos::new(1, false, 0)), Some(b'A'));
        // reverse strand of ACGT is ACGT; offset 0 reads the complement of T
        assert_eq!(g.position_char(GraphPos::new(1, true, 0)), Some(b'A'));
        assert_eq!(g.position_char(GraphPos::new(2, true, 0)), Some(b'T'));
    }

    #[test]
    fn min_path_distance_uses_paths() {
        let g = two_node_graph();
        let d = g.min_path_distance(
            GraphPos::new(1, false, 0),
            GraphPos::new(2, false, 2),
            1000,
        );
        assert_eq!(d, 6);
    }
}
