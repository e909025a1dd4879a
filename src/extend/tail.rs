//! Tail alignment: pinned DP of the read ends left over by gapless
//! extension against a forest of subgraph trees.
//!
//! From each extension boundary a depth-bounded DFS unrolls the graph into
//! rooted trees. The missing tail sequence is aligned left-pinned against
//! each tree (reverse-complemented first when the right edge of the
//! sequence is the pinned one), and the best tail paths are concatenated
//! with the extension's own path.

use crate::align::aligners::AlignerCaps;
use crate::align::alignment::{
    append_path, reverse_complement_alignment, Alignment, Edit, Mapping,
};
use crate::extend::gapless::GaplessExtension;
use crate::graph::{GraphIndex, GraphPos, Subgraph};
use crate::multimap::process_until_threshold;
use crate::utils::revcomp;

/// Bound on unrolled tree size; keeps pathological branching in check.
const MAX_TREE_NODES: usize = 128;

/// A rooted tree unrolled from the graph.
///
/// Tree nodes get fresh ids; each remembers the graph handle it came from.
/// The root may be trimmed so that its first base is the DFS origin.
#[derive(Debug)]
pub struct TreeSubgraph {
    /// `(parent index or -1, graph handle)` in DFS order.
    nodes: Vec<(i64, (u64, bool))>,
    root_trim: u32,
}

impl TreeSubgraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Materialize as a [`Subgraph`] with fresh ids `1..=n`.
    pub fn to_subgraph(&self, graph: &dyn GraphIndex) -> Subgraph {
        let mut sub = Subgraph::new();
        for (i, &(parent, (node, rev))) in self.nodes.iter().enumerate() {
            let seq = graph.node_sequence(node);
            let mut oriented = if rev { revcomp(&seq) } else { seq };
            if parent < 0 {
                oriented = oriented[self.root_trim as usize..].to_vec();
            }
            let id = i as u64 + 1;
            sub.add_node(id, oriented);
            if parent >= 0 {
                sub.add_edge(crate::graph::Edge::forward(parent as u64 + 1, id));
            }
        }
        sub
    }

    /// Translate a path on the materialized subgraph back onto the graph.
    pub fn translate_down(&self, path: &[Mapping]) -> Vec<Mapping> {
        path.iter()
            .map(|mapping| {
                let idx = (mapping.pos.node - 1) as usize;
                let (parent, (node, rev)) = self.nodes[idx];
                let shift = if parent < 0 { self.root_trim } else { 0 };
                let pos = if mapping.pos.is_reverse {
                    GraphPos::new(node, !rev, mapping.pos.offset)
                } else {
                    GraphPos::new(node, rev, mapping.pos.offset + shift)
                };
                Mapping {
                    pos,
                    edits: mapping.edits.clone(),
                }
            })
            .collect()
    }
}

/// Unroll the graph into trees from `from`, walking up to `limit` bases.
///
/// When `from.offset` equals the node length the origin node carries no
/// bases and each successor roots its own tree.
pub fn tail_forest(graph: &dyn GraphIndex, from: GraphPos, limit: usize) -> Vec<TreeSubgraph> {
    let node_len = graph.node_length(from.node);
    let start_included = from.offset < node_len;
    let mut forest = Vec::new();
    if start_included {
        let mut tree = TreeSubgraph {
            nodes: Vec::new(),
            root_trim: from.offset,
        };
        grow_tree(
            graph,
            &mut tree,
            -1,
            from.handle(),
            (node_len - from.offset) as usize,
            limit,
        );
        if !tree.nodes.is_empty() {
            forest.push(tree);
        }
    } else {
        for (succ, succ_rev) in successors(graph, from.node, from.is_reverse) {
            let mut tree = TreeSubgraph {
                nodes: Vec::new(),
                root_trim: 0,
            };
            let len = graph.node_length(succ) as usize;
            grow_tree(graph, &mut tree, -1, (succ, succ_rev), len, limit);
            if !tree.nodes.is_empty() {
                forest.push(tree);
            }
        }
    }
    forest
}

fn successors(graph: &dyn GraphIndex, node: u64, is_reverse: bool) -> Vec<(u64, bool)> {
    let edges = graph.edges_of(node);
    crate::graph::edge_successors(&edges, node, is_reverse)
        .into_iter()
        .filter(|&(n, _)| graph.has_node(n))
        .collect()
}

fn grow_tree(
    graph: &dyn GraphIndex,
    tree: &mut TreeSubgraph,
    parent: i64,
    handle: (u64, bool),
    used: usize,
    limit: usize,
) {
    if tree.nodes.len() >= MAX_TREE_NODES {
        return;
    }
    tree.nodes.push((parent, handle));
    let here = tree.nodes.len() as i64 - 1;
    if used >= limit {
        return;
    }
    for (succ, succ_rev) in successors(graph, handle.0, handle.1) {
        let len = graph.node_length(succ) as usize;
        grow_tree(graph, tree, here, (succ, succ_rev), used + len, limit);
    }
}

/// Best pinned alignment of a tail sequence against any tree of a forest.
///
/// Starts from the pure-softclip fallback placed at `default_position`;
/// `pin_left` selects which sequence end touches the boundary.
fn best_against_forest(
    trees: &[TreeSubgraph],
    sequence: &[u8],
    quality: &[u8],
    default_position: GraphPos,
    pin_left: bool,
    graph: &dyn GraphIndex,
    caps: &dyn AlignerCaps,
) -> (Vec<Mapping>, i64) {
    let mut best_path = Vec::new();
    if !sequence.is_empty() {
        let mut mapping = Mapping::new(default_position);
        mapping.edits.push(Edit::insertion(sequence.to_vec()));
        best_path.push(mapping);
    }
    let mut best_score: i64 = 0;

    for tree in trees {
        if tree.node_count() == 0 {
            continue;
        }
        let sub = tree.to_subgraph(graph);
        let (seq_oriented, qual_oriented): (Vec<u8>, Vec<u8>) = if pin_left {
            (sequence.to_vec(), quality.to_vec())
        } else {
            (
                revcomp(sequence),
                quality.iter().rev().copied().collect(),
            )
        };
        let aligned = caps.align_pinned_left(&seq_oriented, &qual_oriented, &sub);
        if (aligned.score as i64) > best_score && !aligned.path.is_empty() {
            let mut path = aligned.path.clone();
            if !pin_left {
                let node_len = |id: u64| sub.node_len(id);
                let mut rc_aln = aligned.clone();
                rc_aln.sequence = seq_oriented.clone();
                path = reverse_complement_alignment(&rc_aln, &node_len).path;
            }
            best_path = tree.translate_down(&path);
            best_score = aligned.score as i64;
        }
    }
    (best_path, best_score)
}

/// Tail-align an extension set into a full alignment of the read.
///
/// Picks extensions by their own scores, aligns whatever the extension does
/// not cover on each side, and keeps the best left + middle + right total.
pub fn align_tails(
    seq: &[u8],
    qual: &[u8],
    extensions: &[GaplessExtension],
    graph: &dyn GraphIndex,
    caps: &dyn AlignerCaps,
    extension_score_threshold: Option<f64>,
    max_local_extensions: usize,
) -> Alignment {
    let mut out = Alignment::new("", seq, qual);
    if extensions.is_empty() || seq.is_empty() {
        return out;
    }

    let mut winning: Option<(Vec<Mapping>, Vec<Mapping>, Vec<Mapping>, i64)> = None;

    process_until_threshold(
        extensions.len(),
        |i| extensions[i].score as f64,
        extension_score_threshold,
        1,
        max_local_extensions,
        |i| {
            let ext = &extensions[i];
            let middle = ext.to_alignment(seq, qual);
            // strip the soft clips; the tails replace them
            let middle_path: Vec<Mapping> = middle
                .path
                .iter()
                .map(|m| Mapping {
                    pos: m.pos,
                    edits: m
                        .edits
                        .iter()
                        .filter(|e| !e.is_insertion())
                        .cloned()
                        .collect(),
                })
                .collect();
            let middle_score = ext.score as i64;

            let (start, end) = ext.read_interval;
            let mut left = (Vec::new(), 0i64);
            if start > 0 {
                let tail_len = start as usize;
                let limit =
                    tail_len + caps.longest_detectable_gap(tail_len, seq.len());
                let boundary = ext.starting_position();
                let node_len = graph.node_length(boundary.node);
                let looking_left = boundary.reverse(node_len);
                let forest = tail_forest(graph, looking_left, limit);
                left = best_against_forest(
                    &forest,
                    &seq[..start as usize],
                    &qual[..(start as usize).min(qual.len())],
                    boundary,
                    false,
                    graph,
                    caps,
                );
            }

            let mut right = (Vec::new(), 0i64);
            if (end as usize) < seq.len() {
                let tail_len = seq.len() - end as usize;
                let limit =
                    tail_len + caps.longest_detectable_gap(tail_len, seq.len());
                let forest = tail_forest(graph, ext.tail_position(), limit);
                right = best_against_forest(
                    &forest,
                    &seq[end as usize..],
                    &qual[(end as usize).min(qual.len())..],
                    ext.tail_position(),
                    true,
                    graph,
                    caps,
                );
            }

            let total = middle_score + left.1 + right.1;
            let better = winning
                .as_ref()
                .map(|(_, _, _, s)| total > *s)
                .unwrap_or(true);
            if better {
                winning = Some((left.0, middle_path, right.0, total));
            }
            true
        },
        |_| {},
        |_| {},
    );

    if let Some((left, middle, right, score)) = winning {
        let mut path = left;
        append_path(&mut path, middle);
        append_path(&mut path, right);
        out.path = path;
        out.score = score.clamp(0, i32::MAX as i64) as i32;
        out.identity = out.compute_identity();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::aligners::{Aligner, Scoring};
    use crate::extend::gapless::GaplessExtender;
    use crate::graph::MemoryGraph;

    fn graph() -> MemoryGraph {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTACGTAC");
        g.add_path("ref", &[(1, false)]);
        g
    }

    #[test]
    fn forest_respects_the_walk_limit() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"AAAA").add_node(2, b"CCCC").add_node(3, b"GGGG");
        g.add_edge(1, 2).add_edge(2, 3);
        g.add_path("ref", &[(1, false), (2, false), (3, false)]);
        let shallow = tail_forest(&g, GraphPos::new(1, false, 2), 3);
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].node_count(), 2); // rest of 1, then 2
        let deep = tail_forest(&g, GraphPos::new(1, false, 2), 10);
        assert_eq!(deep[0].node_count(), 3);
    }

    #[test]
    fn forest_from_node_end_roots_at_successors() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"AAAA").add_node(2, b"CCCC").add_node(3, b"GGGG");
        g.add_edge(1, 2).add_edge(1, 3);
        g.add_path("ref", &[(1, false), (2, false)]);
        let forest = tail_forest(&g, GraphPos::new(1, false, 4), 8);
        assert_eq!(forest.len(), 2);
    }

    #[test]
    fn tree_subgraph_translates_back() {
        let g = graph();
        let forest = tail_forest(&g, GraphPos::new(1, false, 4), 6);
        let tree = &forest[0];
        let sub = tree.to_subgraph(&g);
        assert_eq!(sub.node_seq(1).unwrap(), b"ACGTAC");
        let mut mapping = Mapping::new(GraphPos::new(1, false, 0));
        mapping.edits.push(Edit::matching(3));
        let down = tree.translate_down(&[mapping]);
        assert_eq!(down[0].pos, GraphPos::new(1, false, 4));
    }

    #[test]
    fn full_extension_needs_no_tails() {
        let g = graph();
        let extender = GaplessExtender {
            graph: &g,
            scoring: Scoring::default(),
            mismatch_limit: 0,
        };
        let seq = b"ACGTACGTAC";
        let exts = extender.extend(&[(GraphPos::new(1, false, 0), 0)], seq);
        let caps = Aligner::new(Scoring::default());
        let aln = align_tails(seq, b"", &exts, &g, &caps, Some(1.0), 4);
        assert!(aln.is_mapped());
        assert_eq!(aln.to_length(), seq.len() as u32);
        assert_eq!(aln.score, exts[0].score);
    }

    #[test]
    fn right_tail_is_aligned_after_the_extension() {
        let g = graph();
        let seq = b"ACGTACGTAC";
        // a partial extension covering only the first six bases
        let ext = GaplessExtension {
            path: vec![((1, false), 0..6)],
            read_interval: (0, 6),
            mismatch_positions: Vec::new(),
            score: 6 + 5,
        };
        let caps = Aligner::new(Scoring::default());
        let aln = align_tails(seq, b"", &[ext], &g, &caps, Some(1.0), 4);
        assert!(aln.is_mapped());
        assert_eq!(aln.to_length(), seq.len() as u32);
        assert_eq!(aln.softclip_start(), 0);
        assert_eq!(aln.softclip_end(), 0);
        // the tail continues on the same node and merges into one mapping
        assert_eq!(aln.path.len(), 1);
        assert_eq!(aln.from_length(), 10);
    }

    #[test]
    fn left_tail_uses_right_pinned_alignment() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"TTTTT").add_node(2, b"ACGTACGTAC");
        g.add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        // the extension anchors on node 2 only; the left tail TTT must land
        // on node 1 through right-pinned alignment
        let seq = b"TTTACGTACGTAC";
        let ext = GaplessExtension {
            path: vec![((2, false), 0..10)],
            read_interval: (3, 13),
            mismatch_positions: Vec::new(),
            score: 10 + 5,
        };
        let caps = Aligner::new(Scoring::default());
        let aln = align_tails(seq, b"", &[ext], &g, &caps, Some(1.0), 4);
        assert!(aln.is_mapped());
        assert_eq!(aln.path[0].pos.node, 1);
        assert_eq!(aln.path[0].pos.offset, 2);
        assert_eq!(aln.softclip_start(), 0);
        assert_eq!(aln.to_length(), seq.len() as u32);
    }
}
