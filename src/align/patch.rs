//! Perfect-match walks, MEM-chain skeleton alignments, gap patching, and
//! the alignment scoring policy.
//!
//! A cluster of single-hit MEMs first becomes a skeleton alignment: exact
//! walks for the MEMs with the in-between read stretches recorded as
//! insertions. Patching then realigns each insertion against a small
//! subgraph spanning its anchors (pinned at the read ends, banded-global in
//! between) and splices the result back into the path.

use log::debug;

use crate::align::aligners::{AlignerCaps, AlignmentShape};
use crate::align::alignment::{
    append_path, Alignment, Edit, Mapping,
};
use crate::cache::WorkerCaches;
use crate::extend::tail::tail_forest;
use crate::graph::{graph_distance, GraphIndex, GraphPos, Subgraph};
use crate::seed::mem::Mem;
use crate::utils::revcomp;

/// Patch subgraphs reach three times the unaligned length around the gap.
const PATCH_CONTEXT_FACTOR: i64 = 3;

/// Walk an exact match of `seq` through the graph starting at `pos`.
///
/// Returns the mappings of the first walk that spells the sequence, or
/// `None` when no walk does.
pub fn walk_match(graph: &dyn GraphIndex, seq: &[u8], pos: GraphPos) -> Option<Vec<Mapping>> {
    fn go(graph: &dyn GraphIndex, seq: &[u8], at: usize, pos: GraphPos) -> Option<Vec<Mapping>> {
        let here = graph.position_char(pos)?;
        if !here.eq_ignore_ascii_case(&seq[at]) {
            return None;
        }
        // consume as much of the current node as possible
        let node_len = graph.node_length(pos.node);
        let mut matched = 1u32;
        let mut cursor = at + 1;
        while cursor < seq.len() && pos.offset + matched < node_len {
            let next = GraphPos::new(pos.node, pos.is_reverse, pos.offset + matched);
            match graph.position_char(next) {
                Some(c) if c.eq_ignore_ascii_case(&seq[cursor]) => {
                    matched += 1;
                    cursor += 1;
                }
                _ => return None,
            }
        }
        let mut mapping = Mapping::new(pos);
        mapping.edits.push(Edit::matching(matched));
        if cursor == seq.len() {
            return Some(vec![mapping]);
        }
        // cross an edge and keep walking
        let boundary = GraphPos::new(pos.node, pos.is_reverse, node_len - 1);
        for succ in graph.next_positions(boundary, false) {
            if succ.node == pos.node && succ.is_reverse == pos.is_reverse && succ.offset != 0 {
                continue;
            }
            if let Some(mut rest) = go(graph, seq, cursor, succ) {
                let mut path = vec![mapping.clone()];
                path.append(&mut rest);
                return Some(path);
            }
        }
        None
    }
    if seq.is_empty() {
        return None;
    }
    go(graph, seq, 0, pos)
}

/// Turn one single-hit MEM into an exact-match alignment piece.
pub fn mem_to_alignment(graph: &dyn GraphIndex, seq: &[u8], mem: &Mem) -> Alignment {
    let piece_seq = &seq[mem.begin..mem.end];
    let mut aln = Alignment::new("", piece_seq, b"");
    if mem.nodes.len() > 1 {
        debug!("building a first alignment from a MEM with multiple recorded hits");
    }
    if let Some(&pos) = mem.nodes.first() {
        if let Some(path) = walk_match(graph, piece_seq, pos) {
            aln.path = path;
            aln.identity = 1.0;
        }
    }
    aln
}

/// Build the skeleton alignment of a MEM chain: exact walks for the MEMs,
/// insertions for everything the chain does not cover.
pub fn mems_to_alignment(graph: &dyn GraphIndex, seq: &[u8], qual: &[u8], mems: &[Mem]) -> Alignment {
    if mems.is_empty() {
        return Alignment::unmapped("", seq, qual);
    }
    let mut pieces: Vec<Alignment> = Vec::new();
    let mut last_end: usize = 0;
    for (i, mem) in mems.iter().enumerate() {
        if mem.end <= last_end {
            continue; // contained in what we already walked
        }
        if mem.begin > last_end {
            pieces.push(Alignment::new("", &seq[last_end..mem.begin], b""));
        }
        let mut piece = mem_to_alignment(graph, seq, mem);
        if i > 0 && last_end > mem.begin {
            let overlap = (last_end - mem.begin) as u32;
            piece = crate::align::alignment::strip_from_start(&piece, overlap);
        }
        pieces.push(piece);
        last_end = mem.end;
    }
    if last_end < seq.len() {
        pieces.push(Alignment::new("", &seq[last_end..], b""));
    }
    let mut merged = crate::align::alignment::merge_alignments(&pieces, "", seq, qual);
    merged.identity = merged.compute_identity();
    merged
}

/// Replace unaligned insertions in an alignment by locally re-aligning them
/// against subgraphs spanning their anchors.
pub fn patch_alignment(
    graph: &dyn GraphIndex,
    caches: &mut WorkerCaches,
    caps: &dyn AlignerCaps,
    aln: &Alignment,
) -> Alignment {
    let mut patched = Alignment::new(&aln.name, &aln.sequence, &aln.quality);
    let seq = &aln.sequence;
    let mut read_at: usize = 0;
    let n_mappings = aln.path.len();

    for (i, mapping) in aln.path.iter().enumerate() {
        let mut ref_pos = mapping.pos;
        let mut new_mapping = Mapping::new(mapping.pos);
        let n_edits = mapping.edits.len();
        for (j, edit) in mapping.edits.iter().enumerate() {
            if !edit.is_insertion() {
                new_mapping.edits.push(edit.clone());
                ref_pos.offset += edit.from_len;
                read_at += edit.to_len as usize;
                continue;
            }
            let insert = &seq[read_at..read_at + edit.to_len as usize];
            let leading_clip = i == 0 && j == 0;
            let trailing_clip = i + 1 == n_mappings && j + 1 == n_edits;

            let replacement = if leading_clip {
                patch_leading_clip(graph, caps, insert, &aln.quality, ref_pos)
            } else if trailing_clip {
                patch_trailing_clip(graph, caps, insert, &aln.quality, ref_pos)
            } else {
                let next_anchor = if j + 1 < n_edits {
                    Some(ref_pos)
                } else if i + 1 < n_mappings {
                    Some(aln.path[i + 1].pos)
                } else {
                    None
                };
                next_anchor.and_then(|second_cut| {
                    patch_between(graph, caches, caps, insert, &aln.quality, ref_pos, second_cut)
                })
            };

            match replacement {
                Some(path) if !path.is_empty() => {
                    // flush the mapping built so far, splice the patch in
                    if !new_mapping.edits.is_empty() {
                        patched.path.push(new_mapping);
                    }
                    append_path(&mut patched.path, path);
                    new_mapping = Mapping::new(ref_pos);
                }
                _ => {
                    new_mapping.edits.push(edit.clone());
                }
            }
            read_at += edit.to_len as usize;
        }
        if !new_mapping.edits.is_empty() {
            patched.path.push(new_mapping);
        }
    }

    // merge mappings that now continue across old boundaries
    let raw_path = std::mem::take(&mut patched.path);
    for mapping in raw_path {
        append_path(&mut patched.path, vec![mapping]);
    }
    patched.score = score_alignment(graph, caps, &patched);
    patched.identity = patched.compute_identity();
    patched
}

fn patch_leading_clip(
    graph: &dyn GraphIndex,
    caps: &dyn AlignerCaps,
    insert: &[u8],
    qual: &[u8],
    anchor: GraphPos,
) -> Option<Vec<Mapping>> {
    let node_len = graph.node_length(anchor.node);
    let looking_left = anchor.reverse(node_len);
    let limit = insert.len() as i64 * PATCH_CONTEXT_FACTOR;
    let forest = tail_forest(graph, looking_left, limit.max(1) as usize);
    let mut best: Option<(Vec<Mapping>, i32)> = None;
    for tree in &forest {
        let sub = tree.to_subgraph(graph);
        let rc = revcomp(insert);
        let rq: Vec<u8> = qual.iter().rev().copied().collect();
        let aligned = caps.align_pinned_left(&rc, &rq, &sub);
        if aligned.path.is_empty() || aligned.score <= 0 {
            continue;
        }
        let node_len = |id: u64| sub.node_len(id);
        let flipped = crate::align::alignment::reverse_complement_alignment(&aligned, &node_len);
        let down = tree.translate_down(&flipped.path);
        if best.as_ref().map(|(_, s)| aligned.score > *s).unwrap_or(true) {
            best = Some((down, aligned.score));
        }
    }
    best.map(|(path, _)| path)
}

fn patch_trailing_clip(
    graph: &dyn GraphIndex,
    caps: &dyn AlignerCaps,
    insert: &[u8],
    qual: &[u8],
    after: GraphPos,
) -> Option<Vec<Mapping>> {
    let limit = insert.len() as i64 * PATCH_CONTEXT_FACTOR;
    let forest = tail_forest(graph, after, limit.max(1) as usize);
    let mut best: Option<(Vec<Mapping>, i32)> = None;
    for tree in &forest {
        let sub = tree.to_subgraph(graph);
        let aligned = caps.align_pinned_left(insert, qual, &sub);
        if aligned.path.is_empty() || aligned.score <= 0 {
            continue;
        }
        let down = tree.translate_down(&aligned.path);
        if best.as_ref().map(|(_, s)| aligned.score > *s).unwrap_or(true) {
            best = Some((down, aligned.score));
        }
    }
    best.map(|(path, _)| path)
}

/// Patch an internal gap between two anchors.
///
/// Extracts the subgraph spanning the cut positions, trims the anchor nodes
/// at the cuts, prunes everything not on an entry-to-exit path, aligns the
/// missing sequence banded-global, and translates the result back through
/// the trim metadata.
fn patch_between(
    graph: &dyn GraphIndex,
    caches: &mut WorkerCaches,
    caps: &dyn AlignerCaps,
    insert: &[u8],
    qual: &[u8],
    first_cut: GraphPos,
    second_cut: GraphPos,
) -> Option<Vec<Mapping>> {
    if insert.is_empty() || first_cut.is_reverse != second_cut.is_reverse {
        return None;
    }
    // a reverse-strand gap is the forward-strand gap of the reverse
    // complement, walked the other way
    if first_cut.is_reverse {
        let flip = |p: GraphPos| p.reverse(graph.node_length(p.node));
        let rc = revcomp(insert);
        let rq: Vec<u8> = qual.iter().rev().copied().collect();
        let path = patch_between(
            graph,
            caches,
            caps,
            &rc,
            &rq,
            flip(second_cut),
            flip(first_cut),
        )?;
        let mut aln = Alignment::new("", &rc, b"");
        aln.path = path;
        let node_len = |id: u64| graph.node_length(id);
        return Some(crate::align::alignment::reverse_complement_alignment(&aln, &node_len).path);
    }

    let radius = insert.len() as i64 * PATCH_CONTEXT_FACTOR;
    let mut sub = Subgraph::new();
    crate::align::cluster_align::cached_graph_context(graph, caches, &mut sub, first_cut, radius);
    if !sub.has_node(first_cut.node) || !sub.has_node(second_cut.node) {
        debug!("patch subgraph does not contain both cut points");
        return None;
    }

    let mut entry_shift = 0u32;
    if first_cut.node == second_cut.node {
        if first_cut.offset >= second_cut.offset {
            return None; // nothing between the cuts to align against
        }
        let seq = sub.node_seq(first_cut.node)?.to_vec();
        let mut single = Subgraph::new();
        single.add_node(
            first_cut.node,
            seq[first_cut.offset as usize..second_cut.offset as usize].to_vec(),
        );
        sub = single;
        entry_shift = first_cut.offset;
    } else {
        // trim the anchor nodes at the cut points, remembering which nodes
        // now stand in for the entry and exit sides
        let mut entry_nodes = vec![first_cut.node];
        let mut exit_nodes = vec![second_cut.node];
        let entry_seq = sub.node_seq(first_cut.node)?.to_vec();
        if (first_cut.offset as usize) < entry_seq.len() {
            sub.set_node_seq(first_cut.node, entry_seq[first_cut.offset as usize..].to_vec());
            entry_shift = first_cut.offset;
        } else {
            entry_nodes = sub
                .successors(first_cut.node, false)
                .into_iter()
                .filter(|&(_, rev)| !rev)
                .map(|(n, _)| n)
                .collect();
            sub.remove_node(first_cut.node);
        }
        if sub.has_node(second_cut.node) {
            let exit_seq = sub.node_seq(second_cut.node)?.to_vec();
            if second_cut.offset == 0 {
                exit_nodes = sub
                    .predecessors(second_cut.node, false)
                    .into_iter()
                    .filter(|&(_, rev)| !rev)
                    .map(|(n, _)| n)
                    .collect();
                sub.remove_node(second_cut.node);
            } else {
                sub.set_node_seq(
                    second_cut.node,
                    exit_seq[..(second_cut.offset as usize).min(exit_seq.len())].to_vec(),
                );
            }
        }
        prune_to_span(&mut sub, &entry_nodes, &exit_nodes);
        if sub.node_count() == 0 {
            return None;
        }
    }
    sub.remove_orphan_edges();

    let aligned = caps.align(insert, qual, &sub, AlignmentShape::Global);
    if aligned.path.is_empty() || aligned.score <= 0 {
        return None;
    }
    let mut path = aligned.path;
    // translate back through the entry trim
    for mapping in path.iter_mut() {
        if mapping.pos.node == first_cut.node {
            mapping.pos.offset += entry_shift;
        }
    }
    Some(path)
}

/// Keep only nodes on some path from the entry set to the exit set.
fn prune_to_span(sub: &mut Subgraph, entry: &[u64], exit: &[u64]) {
    let reachable = flood(sub, entry, false);
    let coreachable = flood(sub, exit, true);
    let all: Vec<u64> = sub.node_ids().collect();
    for id in all {
        if !(reachable.contains(&id) && coreachable.contains(&id)) {
            sub.remove_node(id);
        }
    }
}

fn flood(sub: &Subgraph, from: &[u64], backward: bool) -> std::collections::HashSet<u64> {
    let mut seen = std::collections::HashSet::new();
    let mut stack: Vec<u64> = from.iter().copied().filter(|&n| sub.has_node(n)).collect();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let neighbors = if backward {
            sub.predecessors(id, false)
        } else {
            sub.successors(id, false)
        };
        for (n, rev) in neighbors {
            if !rev && sub.has_node(n) {
                stack.push(n);
            }
        }
    }
    seen
}

/// Score an alignment under the configured scheme.
///
/// Walks the edits, charges gaps for positive inter-mapping graph
/// distances, adds the full-length bonus for each unclipped end, and clamps
/// the result at zero.
pub fn score_alignment(graph: &dyn GraphIndex, caps: &dyn AlignerCaps, aln: &Alignment) -> i32 {
    let s = caps.scoring();
    let mut score: i64 = 0;
    let mut read_at: usize = 0;
    let n = aln.path.len();
    for (i, mapping) in aln.path.iter().enumerate() {
        for (j, edit) in mapping.edits.iter().enumerate() {
            if edit.is_match() {
                score += caps.score_exact_match(
                    &aln.sequence[read_at..read_at + edit.to_len as usize],
                    &aln.quality[read_at.min(aln.quality.len())
                        ..(read_at + edit.to_len as usize).min(aln.quality.len())],
                ) as i64;
            } else if edit.is_substitution() {
                score -= caps.score_mismatch(
                    &aln.sequence,
                    &aln.quality,
                    read_at,
                    edit.to_len as usize,
                ) as i64;
            } else if edit.is_deletion() {
                score -= (s.gap_open + edit.from_len as i32 * s.gap_extend) as i64;
            } else if edit.is_insertion() {
                let leading = i == 0 && j == 0;
                let trailing = i + 1 == n && j + 1 == mapping.edits.len();
                if !leading && !trailing {
                    score -= (s.gap_open + edit.to_len as i32 * s.gap_extend) as i64;
                }
            }
            read_at += edit.to_len as usize;
        }
        // charge for implied gaps between adjacent mappings
        if i + 1 < n {
            let last = mapping.end_position();
            let next = aln.path[i + 1].pos;
            let cap = aln.sequence.len() as i64;
            let mut dist = graph_distance(graph, last, next, cap);
            if dist == cap {
                dist = (graph.approx_position(next) - graph.approx_position(last)).abs();
            }
            if dist > 0 {
                score -= (s.gap_open as i64) + dist * s.gap_extend as i64;
            }
        }
    }
    if !aln.path.is_empty() {
        if aln.softclip_start() == 0 {
            score += s.full_length_bonus as i64;
        }
        if aln.softclip_end() == 0 {
            score += s.full_length_bonus as i64;
        }
    }
    score.clamp(0, i32::MAX as i64) as i32
}

/// The score with the end bonuses backed out, for comparing clipped pieces.
pub fn rescore_without_full_length_bonus(
    aln: &Alignment,
    caps: &dyn AlignerCaps,
) -> i32 {
    let mut score = aln.score;
    if aln.softclip_start() == 0 {
        score -= caps.scoring().full_length_bonus;
    }
    if aln.softclip_end() == 0 {
        score -= caps.scoring().full_length_bonus;
    }
    score
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
    fn walk_match_crosses_edges() {
        let g = graph();
        let path = walk_match(&g, b"TACGGATC", GraphPos::new(1, false, 6)).unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].pos, GraphPos::new(1, false, 6));
        assert_eq!(path[1].pos, GraphPos::new(2, false, 0));
        assert!(walk_match(&g, b"TACGTTTT", GraphPos::new(1, false, 6)).is_none());
    }

    #[test]
    fn mems_to_alignment_leaves_gaps_as_insertions() {
        let g = graph();
        // read = node1[0..4] + "TT" + node2[0..4]
        let seq = b"ACGTTTGGAT";
        let mems = vec![
            mem_with_hit(0, 4, GraphPos::new(1, false, 0)),
            mem_with_hit(6, 10, GraphPos::new(2, false, 0)),
        ];
        let aln = mems_to_alignment(&g, seq, b"", &mems);
        assert_eq!(aln.to_length(), 10);
        let inserted: u32 = aln
            .path
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .sum();
        assert_eq!(inserted, 2);
    }

    #[test]
    fn score_alignment_matches_the_policy() {
        let g = graph();
        let caps = Aligner::new(Scoring::default());
        let mut aln = Alignment::new("r", b"ACGTACGTAC", b"");
        let mut m = Mapping::new(GraphPos::new(1, false, 0));
        m.edits.push(Edit::matching(10));
        aln.path.push(m);
        // 10 matches + both end bonuses
        assert_eq!(score_alignment(&g, &caps, &aln), 10 + 2 * 5);
        aln.score = 20;
        assert_eq!(rescore_without_full_length_bonus(&aln, &caps), 10);
    }

    #[test]
    fn score_alignment_charges_implied_gaps() {
        let g = graph();
        let caps = Aligner::new(Scoring::default());
        let mut aln = Alignment::new("r", b"ACGTGGAT", b"");
        let mut m1 = Mapping::new(GraphPos::new(1, false, 0));
        m1.edits.push(Edit::matching(4));
        let mut m2 = Mapping::new(GraphPos::new(2, false, 0));
        m2.edits.push(Edit::matching(4));
        aln.path = vec![m1, m2];
        // jump from node1 offset 4 to node2 start skips 6 bases of node1
        let expected = 8 - (6 + 6) + 2 * 5;
        assert_eq!(score_alignment(&g, &caps, &aln), expected as i32);
    }

    #[test]
    fn patching_fills_an_internal_gap() {
        let g = graph();
        let caps = Aligner::new(Scoring::default());
        let mut caches = WorkerCaches::default();
        // the true read: node1 then node2, with the middle recorded as an
        // insertion between two anchors
        let seq = b"ACGTACGTACGGATCCATGG";
        let mut aln = Alignment::new("r", seq, b"");
        let mut m1 = Mapping::new(GraphPos::new(1, false, 0));
        m1.edits.push(Edit::matching(4));
        m1.edits.push(Edit::insertion(seq[4..16].to_vec()));
        let mut m2 = Mapping::new(GraphPos::new(2, false, 6));
        m2.edits.push(Edit::matching(4));
        aln.path = vec![m1, m2];
        let patched = patch_alignment(&g, &mut caches, &caps, &aln);
        assert_eq!(patched.to_length(), seq.len() as u32);
        // the gap became matches: identity improves and insertions shrink
        let inserted: u32 = patched
            .path
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .sum();
        assert_eq!(inserted, 0);
        assert!(patched.identity > aln.compute_identity());
        assert!(crate::align::alignment::check_alignment(&g, &patched));
    }

    #[test]
    fn unpatchable_gaps_stay_insertions() {
        let g = graph();
        let caps = Aligner::new(Scoring::default());
        let mut caches = WorkerCaches::default();
        let seq = b"ACGTTTTTTTTTTTTTGGAT";
        let mut aln = Alignment::new("r", seq, b"");
        let mut m1 = Mapping::new(GraphPos::new(1, false, 0));
        m1.edits.push(Edit::matching(4));
        m1.edits.push(Edit::insertion(seq[4..16].to_vec()));
        let mut m2 = Mapping::new(GraphPos::new(2, false, 0));
        m2.edits.push(Edit::matching(4));
        aln.path = vec![m1, m2];
        let patched = patch_alignment(&g, &mut caches, &caps, &aln);
        assert_eq!(patched.to_length(), seq.len() as u32);
        let inserted: u32 = patched
            .path
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .sum();
        assert_eq!(inserted, 12);
    }
}
