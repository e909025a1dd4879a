//! Aligning a MEM cluster: local subgraph extraction, strand polling, and
//! soft-clip resolution.

use log::debug;

use crate::align::aligners::AlignerCaps;
use crate::align::alignment::{reverse_complement_alignment, Alignment};
use crate::cache::WorkerCaches;
use crate::graph::{GraphIndex, GraphPos, Subgraph};
use crate::seed::mem::Mem;
use crate::utils::revcomp;

/// Golden-ratio expansion applied to inter-MEM spans when sizing the
/// cluster subgraph.
pub const SUBGRAPH_EXPANSION: f64 = 1.61803;

/// Walk the graph forward from `pos`, pulling nodes and their edges into
/// `sub` until roughly `length` bases have been covered.
///
/// The walk advances a whole node per ring and counts the shortest node of
/// each ring toward the distance, so tangled regions are not undercounted.
pub fn cached_graph_context(
    graph: &dyn GraphIndex,
    caches: &mut WorkerCaches,
    sub: &mut Subgraph,
    pos: GraphPos,
    length: i64,
) {
    let mut seen: std::collections::HashSet<GraphPos> = Default::default();
    let mut nexts: Vec<GraphPos> = vec![pos];
    let mut distance: i64 = -(pos.offset as i64);
    while !nexts.is_empty() {
        let mut todo: Vec<GraphPos> = Vec::new();
        let mut ring_step: i64 = 0;
        for next in std::mem::take(&mut nexts) {
            if !seen.insert(next) {
                continue;
            }
            let seq = caches.node_sequence(graph, next.node);
            if seq.is_empty() {
                continue;
            }
            ring_step = if ring_step == 0 {
                seq.len() as i64
            } else {
                ring_step.min(seq.len() as i64)
            };
            sub.add_node(next.node, seq);
            for edge in caches.edges_of(graph, next.node) {
                sub.add_edge(edge);
            }
            for succ in graph.next_positions(next, true) {
                todo.push(succ);
            }
        }
        distance += ring_step;
        if distance > length {
            break;
        }
        nexts = todo;
    }
}

/// Extract the subgraph around a cluster of single-hit MEMs.
///
/// Context reaches backward from the first MEM far enough to cover the read
/// prefix and forward from every MEM to cover the span to its successor,
/// each scaled by the golden-ratio expansion.
pub fn cluster_subgraph(
    graph: &dyn GraphIndex,
    caches: &mut WorkerCaches,
    read_len: usize,
    mems: &[Mem],
) -> Subgraph {
    debug_assert!(!mems.is_empty());
    let mut sub = Subgraph::new();
    let start_mem = &mems[0];
    let start_pos = match start_mem.nodes.first() {
        Some(&p) => p,
        None => return sub,
    };
    let node_len = caches.node_length(graph, start_pos.node);
    let rev_start = start_pos.reverse(node_len);
    let get_before = (SUBGRAPH_EXPANSION * start_mem.begin as f64) as i64;
    if get_before > 0 {
        cached_graph_context(graph, caches, &mut sub, rev_start, get_before);
    }
    for (i, mem) in mems.iter().enumerate() {
        let pos = match mem.nodes.first() {
            Some(&p) => p,
            None => continue,
        };
        let span = if i + 1 == mems.len() {
            read_len.saturating_sub(mem.begin)
        } else {
            mem.len().max(mems[i + 1].begin.saturating_sub(mem.begin))
        };
        let get_after = (SUBGRAPH_EXPANSION * span as f64) as i64;
        cached_graph_context(graph, caches, &mut sub, pos, get_after);
    }
    sub.remove_orphan_edges();
    sub
}

/// Align a read locally against a subgraph, optionally on the other strand.
///
/// Flipped alignment reverse-complements the read, aligns, and flips the
/// result back so callers always see read-forward alignments.
pub fn align_maybe_flip(
    graph: &dyn GraphIndex,
    caps: &dyn AlignerCaps,
    seq: &[u8],
    qual: &[u8],
    sub: &Subgraph,
    flip: bool,
) -> Alignment {
    if !flip {
        return caps.align_local(seq, qual, sub);
    }
    let rc = revcomp(seq);
    let rq: Vec<u8> = qual.iter().rev().copied().collect();
    let aln = caps.align_local(&rc, &rq, sub);
    if aln.path.is_empty() {
        let mut out = aln;
        out.sequence = seq.to_vec();
        out.quality = qual.to_vec();
        return out;
    }
    let node_len = |id: u64| graph.node_length(id);
    reverse_complement_alignment(&aln, &node_len)
}

/// Align a read to a cluster's subgraph, polling the MEM hits for strand.
///
/// Returns the chosen alignment together with the subgraph it was aligned
/// against, so callers can widen it for soft-clip resolution.
pub fn align_cluster(
    graph: &dyn GraphIndex,
    caches: &mut WorkerCaches,
    caps: &dyn AlignerCaps,
    seq: &[u8],
    qual: &[u8],
    mems: &[Mem],
    max_target_factor: f64,
) -> (Alignment, Subgraph) {
    let mut count_fwd = 0u32;
    let mut count_rev = 0u32;
    for mem in mems {
        if let Some(node) = mem.nodes.first() {
            if node.is_reverse {
                count_rev += 1;
            } else {
                count_fwd += 1;
            }
        }
    }
    let sub = cluster_subgraph(graph, caches, seq.len(), mems);
    if sub.node_count() == 0 {
        return (Alignment::unmapped("", seq, qual), sub);
    }
    if max_target_factor > 0.0
        && sub.total_len() as f64 > max_target_factor * seq.len().max(1) as f64
    {
        debug!(
            "cluster subgraph of {} bp exceeds the target cap for a {} bp read",
            sub.total_len(),
            seq.len()
        );
        return (Alignment::unmapped("", seq, qual), sub);
    }
    let mut aln_fwd = Alignment::unmapped("", seq, qual);
    let mut aln_rev = Alignment::unmapped("", seq, qual);
    if count_fwd > 0 {
        aln_fwd = align_maybe_flip(graph, caps, seq, qual, &sub, false);
    }
    if count_rev > 0 {
        aln_rev = align_maybe_flip(graph, caps, seq, qual, &sub, true);
    }
    if aln_fwd.score + aln_rev.score == 0 {
        return (Alignment::unmapped("", seq, qual), sub);
    }
    let winner = if aln_rev.score > aln_fwd.score {
        aln_rev
    } else {
        aln_fwd
    };
    (winner, sub)
}

/// Re-align with a widened subgraph while long soft clips keep paying off.
///
/// Each round widens the subgraph in proportion to the longest clip and
/// re-runs the alignment; the loop stops when the score stops improving or
/// the iteration cap is hit.
pub fn resolve_softclips(
    graph: &dyn GraphIndex,
    caps: &dyn AlignerCaps,
    aln: &mut Alignment,
    sub: &mut Subgraph,
    softclip_threshold: u32,
    max_iterations: usize,
    context_depth: i64,
) {
    if softclip_threshold == 0 {
        return;
    }
    let avg_node = graph.average_node_length().max(1.0);
    let was_reverse = aln
        .first_position()
        .map(|p| p.is_reverse)
        .unwrap_or(false);
    let mut iterations = 0;
    while iterations < max_iterations {
        let clip_start = aln.softclip_start();
        let clip_end = aln.softclip_end();
        let clip = clip_start.max(clip_end);
        if clip < softclip_threshold {
            break;
        }
        let widen = (context_depth as f64).max(clip as f64 / avg_node) as i64 * avg_node as i64;
        crate::graph::expand_context(graph, sub, widen.max(1), clip_end > 0, clip_start > 0);
        let better = align_maybe_flip(graph, caps, &aln.sequence, &aln.quality, sub, was_reverse);
        if better.score <= aln.score {
            break;
        }
        *aln = better;
        iterations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::aligners::{Aligner, Scoring};
    use crate::graph::MemoryGraph;
    use crate::index::fm::FmRange;

    fn graph() -> MemoryGraph {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTACGTAC").add_node(2, b"GGATCCATGG").add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        g
    }

    fn mem_with_hit(begin: usize, end: usize, pos: GraphPos) -> Mem {
        let mut mem = Mem::new(begin, end, FmRange::empty());
        mem.match_count = 1;
        mem.nodes = vec![pos];
        mem
    }

    #[test]
    fn context_walk_collects_downstream_nodes() {
        let g = graph();
        let mut caches = WorkerCaches::default();
        let mut sub = Subgraph::new();
        cached_graph_context(
            &g,
            &mut caches,
            &mut sub,
            GraphPos::new(1, false, 5),
            12,
        );
        assert!(sub.has_node(1));
        assert!(sub.has_node(2));
    }

    #[test]
    fn cluster_subgraph_spans_the_cluster() {
        let g = graph();
        let mut caches = WorkerCaches::default();
        let mems = vec![
            mem_with_hit(0, 8, GraphPos::new(1, false, 0)),
            mem_with_hit(10, 18, GraphPos::new(2, false, 0)),
        ];
        let sub = cluster_subgraph(&g, &mut caches, 20, &mems);
        assert!(sub.has_node(1));
        assert!(sub.has_node(2));
    }

    #[test]
    fn cluster_alignment_picks_the_winning_strand() {
        let g = graph();
        let mut caches = WorkerCaches::default();
        let caps = Aligner::new(Scoring::default());
        let seq = b"ACGTACGTAC";
        let fwd_mems = vec![mem_with_hit(0, 10, GraphPos::new(1, false, 0))];
        let (aln, _) = align_cluster(&g, &mut caches, &caps, seq, b"", &fwd_mems, 0.0);
        assert!(aln.is_mapped());
        assert!(!aln.path[0].pos.is_reverse);

        // the same read anchored by a reverse-strand hit aligns flipped
        let rc = revcomp(seq);
        let rev_mems = vec![mem_with_hit(0, 10, GraphPos::new(1, true, 0))];
        let (rev_aln, _) = align_cluster(&g, &mut caches, &caps, &rc, b"", &rev_mems, 0.0);
        assert!(rev_aln.is_mapped());
        assert!(rev_aln.path[0].pos.is_reverse);
        assert_eq!(rev_aln.score, aln.score);
    }

    #[test]
    fn oversized_targets_are_refused() {
        let g = graph();
        let mut caches = WorkerCaches::default();
        let caps = Aligner::new(Scoring::default());
        let mems = vec![mem_with_hit(0, 4, GraphPos::new(1, false, 0))];
        let (aln, _) = align_cluster(&g, &mut caches, &caps, b"ACGT", b"", &mems, 1.0);
        assert!(!aln.is_mapped());
        assert_eq!(aln.sequence, b"ACGT");
    }
}
