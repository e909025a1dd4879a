//! Mismatch-limited gapless extension of seed matchings.
//!
//! Each seed anchors a maximal gap-free walk through the graph matching an
//! interval of the read. Extensions never end on a mismatch; a full-length
//! extension covering the whole read converts directly into an alignment
//! without dynamic programming.

use crate::align::aligners::Scoring;
use crate::align::alignment::{Alignment, Edit, Mapping, push_edit};
use crate::graph::{GraphIndex, GraphPos};

/// A maximal gap-free walk matching a read interval.
#[derive(Debug, Clone, PartialEq)]
pub struct GaplessExtension {
    /// Oriented nodes walked, with the orientation-local offset range used
    /// on each.
    pub path: Vec<((u64, bool), std::ops::Range<u32>)>,
    /// Read interval `[start, end)` covered by the walk.
    pub read_interval: (u32, u32),
    /// Read offsets of mismatches inside the interval, ascending.
    pub mismatch_positions: Vec<u32>,
    pub score: i32,
}

impl GaplessExtension {
    /// Whether the extension explains the entire read.
    pub fn full(&self, read_len: usize) -> bool {
        self.read_interval.0 == 0 && self.read_interval.1 as usize == read_len
    }

    /// Graph position of the first matched base.
    pub fn starting_position(&self) -> GraphPos {
        let ((node, rev), ref range) = self.path[0];
        GraphPos::new(node, rev, range.start)
    }

    /// Graph position just past the last matched base.
    pub fn tail_position(&self) -> GraphPos {
        let ((node, rev), ref range) = self.path[self.path.len() - 1];
        GraphPos::new(node, rev, range.end)
    }

    pub fn mismatches(&self) -> usize {
        self.mismatch_positions.len()
    }

    /// Convert into an alignment; uncovered read ends become soft clips.
    pub fn to_alignment(&self, seq: &[u8], qual: &[u8]) -> Alignment {
        let mut aln = Alignment::new("", seq, qual);
        let (start, end) = self.read_interval;
        let mut read_at = start;
        let mut mismatch_iter = self.mismatch_positions.iter().peekable();
        for (idx, ((node, rev), range)) in self.path.iter().enumerate() {
            let mut mapping = Mapping::new(GraphPos::new(*node, *rev, range.start));
            if idx == 0 && start > 0 {
                mapping.edits.push(Edit::insertion(seq[..start as usize].to_vec()));
            }
            let mut used = 0;
            while used < range.end - range.start {
                let is_mismatch = mismatch_iter.peek().map(|&&m| m == read_at).unwrap_or(false);
                if is_mismatch {
                    mismatch_iter.next();
                    push_edit(
                        &mut mapping,
                        Edit::substitution(vec![seq[read_at as usize]]),
                    );
                } else {
                    push_edit(&mut mapping, Edit::matching(1));
                }
                used += 1;
                read_at += 1;
            }
            if idx == self.path.len() - 1 && (end as usize) < seq.len() {
                mapping
                    .edits
                    .push(Edit::insertion(seq[end as usize..].to_vec()));
            }
            aln.path.push(mapping);
        }
        aln.score = self.score.max(0);
        aln.identity = aln.compute_identity();
        aln
    }
}

/// The gapless extender: graph oracle plus extension parameters.
pub struct GaplessExtender<'a> {
    pub graph: &'a dyn GraphIndex,
    pub scoring: Scoring,
    pub mismatch_limit: u32,
}

// one greedy arm of an extension walk
#[derive(Debug, Clone, Default)]
struct Arm {
    handles: Vec<((u64, bool), std::ops::Range<u32>)>,
    matched: u32,
    mismatches: Vec<u32>,
}

impl<'a> GaplessExtender<'a> {
    /// Extend every seed matching of a cluster, deduplicated.
    ///
    /// `matchings` pairs a graph position with the read offset it anchors.
    pub fn extend(&self, matchings: &[(GraphPos, u32)], seq: &[u8]) -> Vec<GaplessExtension> {
        let mut extensions: Vec<GaplessExtension> = Vec::new();
        for &(pos, read_offset) in matchings {
            if read_offset as usize >= seq.len() {
                continue;
            }
            if let Some(ext) = self.extend_one(pos, read_offset, seq) {
                if !extensions.contains(&ext) {
                    extensions.push(ext);
                }
            }
        }
        extensions.sort_by(|a, b| b.score.cmp(&a.score));
        extensions
    }

    fn extend_one(&self, pos: GraphPos, read_offset: u32, seq: &[u8]) -> Option<GaplessExtension> {
        // the anchor base itself must match, or the seed is no anchor
        let anchor = self.graph.position_char(pos)?;
        if !anchor.eq_ignore_ascii_case(&seq[read_offset as usize]) {
            return None;
        }

        let right = self.walk_right(pos, read_offset, seq);
        let left = self.walk_left(pos, read_offset, seq, right.mismatches.len() as u32);

        // assemble: left arm handles are collected outward and come back reversed
        let mut path: Vec<((u64, bool), std::ops::Range<u32>)> = left.handles;
        path.reverse();
        // fuse the anchor node shared by both arms
        for (handle, range) in right.handles {
            if let Some((last_handle, last_range)) = path.last_mut() {
                if *last_handle == handle && last_range.end == range.start {
                    last_range.end = range.end;
                    continue;
                }
            }
            path.push((handle, range));
        }
        if path.is_empty() {
            return None;
        }

        let start = read_offset - left.matched;
        let end = read_offset + 1 + right.matched;
        let mut mismatches = left.mismatches;
        mismatches.extend(right.mismatches);
        mismatches.sort_unstable();

        let s = &self.scoring;
        let matched_bases = (end - start) as i32 - mismatches.len() as i32;
        let mut score = matched_bases * s.match_score
            - mismatches.len() as i32 * s.mismatch;
        if start == 0 {
            score += s.full_length_bonus;
        }
        if end as usize == seq.len() {
            score += s.full_length_bonus;
        }

        Some(GaplessExtension {
            path,
            read_interval: (start, end),
            mismatch_positions: mismatches,
            score,
        })
    }

    /// Walk right of the anchor (excluded), consuming read bases until the
    /// graph or the mismatch budget runs out. Ends are trimmed to matches.
    fn walk_right(&self, anchor: GraphPos, read_offset: u32, seq: &[u8]) -> Arm {
        let mut arm = Arm {
            handles: vec![(
                anchor.handle(),
                anchor.offset..anchor.offset + 1,
            )],
            ..Default::default()
        };
        let mut pos = anchor;
        let mut read_at = read_offset + 1;
        let mut budget = self.mismatch_limit;
        let mut since_last_match: u32 = 0;
        while (read_at as usize) < seq.len() {
            let nexts = self.graph.next_positions(pos, false);
            // prefer a matching branch; otherwise take the first and spend budget
            let read_base = seq[read_at as usize];
            let next = nexts
                .iter()
                .find(|&&p| {
                    self.graph
                        .position_char(p)
                        .map(|c| c.eq_ignore_ascii_case(&read_base))
                        .unwrap_or(false)
                })
                .or_else(|| nexts.first())
                .copied();
            let next = match next {
                Some(p) => p,
                None => break,
            };
            let graph_base = match self.graph.position_char(next) {
                Some(b) => b,
                None => break,
            };
            let is_match = graph_base.eq_ignore_ascii_case(&read_base);
            if !is_match {
                if budget == 0 {
                    break;
                }
                budget -= 1;
            }
            extend_arm(&mut arm, next);
            if is_match {
                since_last_match = 0;
            } else {
                arm.mismatches.push(read_at);
                since_last_match += 1;
            }
            pos = next;
            read_at += 1;
        }
        trim_arm_end(&mut arm, since_last_match);
        arm.matched = arm
            .handles
            .iter()
            .map(|(_, r)| r.end - r.start)
            .sum::<u32>()
            - 1; // anchor excluded
        arm
    }

    /// Walk left of the anchor by walking right on the opposite strand.
    fn walk_left(
        &self,
        anchor: GraphPos,
        read_offset: u32,
        seq: &[u8],
        used_budget: u32,
    ) -> Arm {
        let mut arm = Arm::default();
        let node_len = self.graph.node_length(anchor.node);
        // flip so that "left of the anchor" is forward motion
        let mut pos = GraphPos::new(
            anchor.node,
            !anchor.is_reverse,
            node_len - anchor.offset - 1,
        );
        let mut read_at = read_offset as i64 - 1;
        let mut budget = self.mismatch_limit.saturating_sub(used_budget);
        let mut since_last_match: u32 = 0;
        let rc = crate::utils::revcomp(seq);
        while read_at >= 0 {
            let rc_at = seq.len() as i64 - 1 - read_at;
            let read_base = rc[rc_at as usize];
            let nexts = self.graph.next_positions(pos, false);
            let next = nexts
                .iter()
                .find(|&&p| {
                    self.graph
                        .position_char(p)
                        .map(|c| c.eq_ignore_ascii_case(&read_base))
                        .unwrap_or(false)
                })
                .or_else(|| nexts.first())
                .copied();
            let next = match next {
                Some(p) => p,
                None => break,
            };
            let graph_base = match self.graph.position_char(next) {
                Some(b) => b,
                None => break,
            };
            let is_match = graph_base.eq_ignore_ascii_case(&read_base);
            if !is_match {
                if budget == 0 {
                    break;
                }
                budget -= 1;
            }
            extend_arm(&mut arm, next);
            if is_match {
                since_last_match = 0;
            } else {
                arm.mismatches.push(read_at as u32);
                since_last_match += 1;
            }
            pos = next;
            read_at -= 1;
        }
        trim_arm_end(&mut arm, since_last_match);
        arm.matched = arm.handles.iter().map(|(_, r)| r.end - r.start).sum();
        // express the flipped walk on the original strand
        let len = |node: u64| self.graph.node_length(node);
        arm.handles = arm
            .handles
            .iter()
            .map(|((node, rev), range)| {
                let l = len(*node);
                ((*node, !rev), l - range.end..l - range.start)
            })
            .collect();
        arm
    }
}

fn extend_arm(arm: &mut Arm, pos: GraphPos) {
    if let Some((handle, range)) = arm.handles.last_mut() {
        if *handle == pos.handle() && range.end == pos.offset {
            range.end += 1;
            return;
        }
    }
    arm.handles
        .push((pos.handle(), pos.offset..pos.offset + 1));
}

/// Drop trailing mismatching bases so the arm ends on a match.
fn trim_arm_end(arm: &mut Arm, trailing_mismatches: u32) {
    let mut to_trim = trailing_mismatches;
    while to_trim > 0 {
        arm.mismatches.pop();
        let (_, range) = arm.handles.last_mut().unwrap();
        range.end -= 1;
        if range.start == range.end {
            arm.handles.pop();
        }
        to_trim -= 1;
    }
}

/// Estimate the best score an extension set could align to.
///
/// Sweeps the read positions: a position covered by extensions scores a
/// match unless every covering extension mismatches there (a "universal"
/// mismatch), in which case it scores one mismatch. Uncovered positions
/// score nothing.
pub fn estimate_extension_set_score(
    extensions: &[GaplessExtension],
    seq: &[u8],
    scoring: &Scoring,
) -> i32 {
    if extensions.is_empty() || seq.is_empty() {
        return 0;
    }
    if extensions.len() == 1 && extensions[0].full(seq.len()) {
        return extensions[0].score;
    }
    let mut score = 0i32;
    for p in 0..seq.len() as u32 {
        let covering: Vec<&GaplessExtension> = extensions
            .iter()
            .filter(|e| e.read_interval.0 <= p && p < e.read_interval.1)
            .collect();
        if covering.is_empty() {
            continue;
        }
        let universal_mismatch = covering
            .iter()
            .all(|e| e.mismatch_positions.binary_search(&p).is_ok());
        if universal_mismatch {
            score -= scoring.mismatch;
        } else {
            score += scoring.match_score;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn graph() -> MemoryGraph {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTACGTAC");
        g.add_path("ref", &[(1, false)]);
        g
    }

    fn extender(g: &MemoryGraph) -> GaplessExtender<'_> {
        GaplessExtender {
            graph: g,
            scoring: Scoring::default(),
            mismatch_limit: 4,
        }
    }

    #[test]
    fn exact_read_extends_to_full_length() {
        let g = graph();
        let ext = extender(&g);
        let seq = b"ACGTACGTAC";
        let exts = ext.extend(&[(GraphPos::new(1, false, 4), 4)], seq);
        assert_eq!(exts.len(), 1);
        assert!(exts[0].full(seq.len()));
        assert_eq!(exts[0].mismatches(), 0);
        assert_eq!(exts[0].score, 10 + 2 * 5);
        let aln = exts[0].to_alignment(seq, b"");
        assert_eq!(aln.path[0].edits, vec![Edit::matching(10)]);
    }

    #[test]
    fn mid_read_substitution_is_recorded() {
        let g = graph();
        let ext = extender(&g);
        let seq = b"ACGTAGGTAC"; // C->G at read offset 5
        let exts = ext.extend(&[(GraphPos::new(1, false, 0), 0)], seq);
        assert_eq!(exts.len(), 1);
        assert!(exts[0].full(seq.len()));
        assert_eq!(exts[0].mismatch_positions, vec![5]);
        assert_eq!(exts[0].score, 9 - 4 + 10);
        let aln = exts[0].to_alignment(seq, b"");
        assert!(aln.path[0].edits.iter().any(|e| e.is_substitution()));
    }

    #[test]
    fn extension_never_ends_on_a_mismatch() {
        let g = graph();
        let ext = extender(&g);
        // tail diverges: trailing mismatches are trimmed back to the last match
        let seq = b"ACGTACTTTT";
        let exts = ext.extend(&[(GraphPos::new(1, false, 0), 0)], seq);
        assert_eq!(exts.len(), 1);
        let e = &exts[0];
        assert!(!e.full(seq.len()));
        assert_eq!(e.read_interval, (0, 8));
        assert_eq!(e.mismatch_positions, vec![6]);
        // the last covered base is a match
        assert!(!e.mismatch_positions.contains(&(e.read_interval.1 - 1)));
    }

    #[test]
    fn extension_crosses_nodes() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGT").add_node(2, b"TTGA").add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        let ext = extender(&g);
        let seq = b"ACGTTTGA";
        let exts = ext.extend(&[(GraphPos::new(1, false, 1), 1)], seq);
        assert_eq!(exts.len(), 1);
        assert!(exts[0].full(seq.len()));
        assert_eq!(exts[0].path.len(), 2);
        assert_eq!(exts[0].starting_position(), GraphPos::new(1, false, 0));
        assert_eq!(exts[0].tail_position(), GraphPos::new(2, false, 4));
    }

    #[test]
    fn duplicate_seeds_deduplicate() {
        let g = graph();
        let ext = extender(&g);
        let seq = b"ACGTACGTAC";
        let exts = ext.extend(
            &[
                (GraphPos::new(1, false, 2), 2),
                (GraphPos::new(1, false, 6), 6),
            ],
            seq,
        );
        assert_eq!(exts.len(), 1);
    }

    #[test]
    fn set_score_estimate_handles_universal_mismatches() {
        let scoring = Scoring::default();
        let a = GaplessExtension {
            path: vec![((1, false), 0..5)],
            read_interval: (0, 5),
            mismatch_positions: vec![2],
            score: 0,
        };
        let b = GaplessExtension {
            path: vec![((1, false), 10..15)],
            read_interval: (0, 5),
            mismatch_positions: vec![2],
            score: 0,
        };
        // both mismatch at 2: universal -> one mismatch, 4 matches
        let est = estimate_extension_set_score(&[a.clone(), b], b"ACGTA", &scoring);
        assert_eq!(est, 4 - 4);
        // alone with a non-universal partner covering 2 as a match
        let c = GaplessExtension {
            path: vec![((1, false), 20..25)],
            read_interval: (0, 5),
            mismatch_positions: vec![],
            score: 0,
        };
        let est = estimate_extension_set_score(&[a, c], b"ACGTA", &scoring);
        assert_eq!(est, 5);
    }
}
