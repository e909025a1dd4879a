//! Dynamic-programming alignment kernels over extracted subgraphs.
//!
//! The rest of the pipeline treats alignment as a capability set: exact-match
//! and mismatch scoring, gap parameters, and three alignment shapes (local,
//! pinned, banded-global) over a [`Subgraph`]. Two implementations exist:
//! [`Aligner`] scores bases uniformly, [`QualAdjAligner`] scales scores by
//! base quality. Callers pick one per read depending on whether a quality
//! string is present and quality adjustment is enabled.

use crate::align::alignment::{Alignment, Edit, Mapping, push_edit};
use crate::graph::{GraphPos, Subgraph};

const NEG: i32 = i32::MIN / 4;

/// Scoring parameters shared by both aligner implementations.
#[derive(Debug, Clone, Copy)]
pub struct Scoring {
    pub match_score: i32,
    pub mismatch: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
    pub full_length_bonus: i32,
}

impl Default for Scoring {
    fn default() -> Self {
        Scoring {
            match_score: 1,
            mismatch: 4,
            gap_open: 6,
            gap_extend: 1,
            full_length_bonus: 5,
        }
    }
}

/// How the ends of the alignment are constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentShape {
    /// Start and end anywhere; unaligned read ends become soft clips.
    Local,
    /// Start pinned to the subgraph sources; read fully consumed.
    PinnedLeft,
    /// Read fully consumed; path runs source to sink.
    Global,
}

/// The alignment capability set used throughout the pipeline.
pub trait AlignerCaps: Send + Sync {
    fn scoring(&self) -> &Scoring;

    /// Score of matching `seq` exactly, given its base qualities (may be
    /// empty).
    fn score_exact_match(&self, seq: &[u8], qual: &[u8]) -> i32;

    /// Positive penalty of `seq` mismatching over `len` bases at `read_at`.
    fn score_mismatch(&self, seq: &[u8], qual: &[u8], read_at: usize, len: usize) -> i32;

    /// Score of matching one read base at one position.
    fn base_match_score(&self, base: u8, qual: &[u8], read_at: usize) -> i32;

    /// Penalty of one read base mismatching at one position.
    fn base_mismatch_penalty(&self, base: u8, qual: &[u8], read_at: usize) -> i32;

    /// Longest gap the scoring scheme can detect inside a tail of
    /// `tail_length` bases of a read of `read_length` bases.
    fn longest_detectable_gap(&self, tail_length: usize, read_length: usize) -> usize {
        let s = self.scoring();
        let span = tail_length.min(read_length);
        let budget = span as i64 * s.match_score as i64 + s.full_length_bonus as i64
            - s.gap_open as i64;
        if budget <= 0 || s.gap_extend == 0 {
            0
        } else {
            (budget / s.gap_extend as i64) as usize
        }
    }

    /// Align a read against a subgraph with the given shape.
    fn align(
        &self,
        seq: &[u8],
        qual: &[u8],
        sub: &Subgraph,
        shape: AlignmentShape,
    ) -> Alignment;

    fn align_local(&self, seq: &[u8], qual: &[u8], sub: &Subgraph) -> Alignment {
        self.align(seq, qual, sub, AlignmentShape::Local)
    }

    fn align_pinned_left(&self, seq: &[u8], qual: &[u8], sub: &Subgraph) -> Alignment {
        self.align(seq, qual, sub, AlignmentShape::PinnedLeft)
    }

    fn align_global(&self, seq: &[u8], qual: &[u8], sub: &Subgraph) -> Alignment {
        self.align(seq, qual, sub, AlignmentShape::Global)
    }
}

/// Uniform-scoring aligner.
#[derive(Debug, Clone)]
pub struct Aligner {
    pub scoring: Scoring,
}

impl Aligner {
    pub fn new(scoring: Scoring) -> Self {
        Aligner { scoring }
    }
}

impl AlignerCaps for Aligner {
    fn scoring(&self) -> &Scoring {
        &self.scoring
    }

    fn score_exact_match(&self, seq: &[u8], _qual: &[u8]) -> i32 {
        seq.len() as i32 * self.scoring.match_score
    }

    fn score_mismatch(&self, _seq: &[u8], _qual: &[u8], _read_at: usize, len: usize) -> i32 {
        len as i32 * self.scoring.mismatch
    }

    fn base_match_score(&self, _base: u8, _qual: &[u8], _read_at: usize) -> i32 {
        self.scoring.match_score
    }

    fn base_mismatch_penalty(&self, _base: u8, _qual: &[u8], _read_at: usize) -> i32 {
        self.scoring.mismatch
    }

    fn align(
        &self,
        seq: &[u8],
        qual: &[u8],
        sub: &Subgraph,
        shape: AlignmentShape,
    ) -> Alignment {
        align_to_subgraph(self, seq, qual, sub, shape)
    }
}

/// Base-quality-adjusted aligner.
///
/// Scores are log-likelihood ratios of the base call against the indexed
/// sequence's background composition: the error probability comes from the
/// quality value, the background frequency of each base from `gc_content`.
/// The ratio is scaled so that a confident call of an equal-frequency base
/// scores exactly the unadjusted match score.
#[derive(Debug, Clone)]
pub struct QualAdjAligner {
    pub scoring: Scoring,
    pub gc_content: f64,
}

impl QualAdjAligner {
    pub fn new(scoring: Scoring, gc_content: f64) -> Self {
        QualAdjAligner {
            scoring,
            gc_content: gc_content.clamp(0.01, 0.99),
        }
    }

    fn base_frequency(&self, base: u8) -> f64 {
        match crate::utils::encode_base(base) {
            1 | 2 => self.gc_content / 2.0,
            0 | 3 => (1.0 - self.gc_content) / 2.0,
            _ => 0.25,
        }
    }

    fn error_probability(qual: &[u8], read_at: usize) -> f64 {
        let q = qual.get(read_at).copied().unwrap_or(40).min(60);
        10f64.powf(-(q as f64) / 10.0)
    }

    /// Integer scale anchored at `match_score` for an equal-frequency base.
    fn log_odds_scale(&self) -> f64 {
        self.scoring.match_score as f64 / 4f64.ln()
    }
}

impl AlignerCaps for QualAdjAligner {
    fn scoring(&self) -> &Scoring {
        &self.scoring
    }

    fn score_exact_match(&self, seq: &[u8], qual: &[u8]) -> i32 {
        seq.iter()
            .enumerate()
            .map(|(i, &b)| self.base_match_score(b, qual, i))
            .sum()
    }

    fn score_mismatch(&self, seq: &[u8], qual: &[u8], read_at: usize, len: usize) -> i32 {
        (read_at..read_at + len)
            .map(|i| {
                let base = seq.get(i).copied().unwrap_or(b'N');
                self.base_mismatch_penalty(base, qual, i)
            })
            .sum()
    }

    fn base_match_score(&self, base: u8, qual: &[u8], read_at: usize) -> i32 {
        let err = Self::error_probability(qual, read_at);
        let odds = (1.0 - err).max(f64::MIN_POSITIVE) / self.base_frequency(base);
        (self.log_odds_scale() * odds.ln()).round().max(0.0) as i32
    }

    fn base_mismatch_penalty(&self, base: u8, qual: &[u8], read_at: usize) -> i32 {
        let err = Self::error_probability(qual, read_at);
        // an erroneous call lands on any specific wrong base a third of the time
        let odds = (err / 3.0).max(f64::MIN_POSITIVE) / self.base_frequency(base);
        (-(self.log_odds_scale() * odds.ln())).round().max(1.0) as i32
    }

    fn align(
        &self,
        seq: &[u8],
        qual: &[u8],
        sub: &Subgraph,
        shape: AlignmentShape,
    ) -> Alignment {
        align_to_subgraph(self, seq, qual, sub, shape)
    }
}

// One DP cell per graph base, in topological order.
struct Cell {
    node: u64,
    offset: u32,
    base: u8,
    preds: Vec<u32>,
}

fn build_cells(sub: &Subgraph) -> Vec<Cell> {
    let order = sub.topological_order();
    let mut last_cell_of: std::collections::BTreeMap<u64, u32> = std::collections::BTreeMap::new();
    let mut cells: Vec<Cell> = Vec::with_capacity(sub.total_len());
    for node in order {
        let seq = match sub.node_seq(node) {
            Some(s) if !s.is_empty() => s.to_vec(),
            _ => continue,
        };
        let start = cells.len() as u32;
        for (i, &b) in seq.iter().enumerate() {
            let preds = if i == 0 {
                sub.predecessors(node, false)
                    .into_iter()
                    .filter(|&(_, rev)| !rev)
                    .filter_map(|(p, _)| last_cell_of.get(&p).copied())
                    .collect()
            } else {
                vec![start + i as u32 - 1]
            };
            cells.push(Cell {
                node,
                offset: i as u32,
                base: b.to_ascii_uppercase(),
                preds,
            });
        }
        last_cell_of.insert(node, cells.len() as u32 - 1);
    }
    cells
}

// backtrace states
const ST_M: u8 = 0;
const ST_X: u8 = 1; // insertion in read (gap in graph)
const ST_Y: u8 = 2; // deletion from read (gap in read)
const ST_START: u8 = 3;

/// Affine-gap DP of a read against a subgraph's cell DAG.
///
/// Produces an [`Alignment`] whose mappings are all on the forward strand of
/// the subgraph's nodes; strand flips are the caller's concern.
fn align_to_subgraph(
    caps: &dyn AlignerCaps,
    seq: &[u8],
    qual: &[u8],
    sub: &Subgraph,
    shape: AlignmentShape,
) -> Alignment {
    let mut out = Alignment::new("", seq, qual);
    let cells = build_cells(sub);
    let n = cells.len();
    let m = seq.len();
    if n == 0 || m == 0 {
        return out;
    }
    let s = *caps.scoring();

    let idx = |c: usize, j: usize| c * (m + 1) + j;
    let mut mat = vec![NEG; n * (m + 1)];
    let mut ins = vec![NEG; n * (m + 1)];
    let mut del = vec![NEG; n * (m + 1)];
    // back pointers: (state entered from, pred cell or u32::MAX for same/start)
    let mut bt_m = vec![(ST_START, u32::MAX); n * (m + 1)];
    let mut bt_y = vec![(ST_START, u32::MAX); n * (m + 1)];

    let local = shape == AlignmentShape::Local;

    for (c, cell) in cells.iter().enumerate() {
        let is_origin = cell.preds.is_empty();
        // deletion lane at j = 0 lets global/pinned paths skip graph bases
        if !local {
            if is_origin {
                del[idx(c, 0)] = -(s.gap_open + s.gap_extend);
                bt_y[idx(c, 0)] = (ST_START, u32::MAX);
            }
            for &p in &cell.preds {
                let cand = del[idx(p as usize, 0)] - s.gap_extend;
                if cand > del[idx(c, 0)] {
                    del[idx(c, 0)] = cand;
                    bt_y[idx(c, 0)] = (ST_Y, p);
                }
            }
        }
        for j in 1..=m {
            let read_base = seq[j - 1].to_ascii_uppercase();
            let diag = if read_base == cell.base && !crate::utils::is_ambiguous(read_base) {
                caps.base_match_score(read_base, qual, j - 1)
            } else {
                -caps.base_mismatch_penalty(read_base, qual, j - 1)
            };

            // M: align read base j-1 to this cell
            let mut best = NEG;
            let mut bt = (ST_START, u32::MAX);
            let can_start = match shape {
                AlignmentShape::Local => true,
                AlignmentShape::PinnedLeft | AlignmentShape::Global => is_origin && j == 1,
            };
            if can_start && 0 > best {
                best = 0;
                bt = (ST_START, u32::MAX);
            }
            for &p in &cell.preds {
                let pi = p as usize;
                if mat[idx(pi, j - 1)] > best {
                    best = mat[idx(pi, j - 1)];
                    bt = (ST_M, p);
                }
                if ins[idx(pi, j - 1)] > best {
                    best = ins[idx(pi, j - 1)];
                    bt = (ST_X, p);
                }
                if del[idx(pi, j - 1)] > best {
                    best = del[idx(pi, j - 1)];
                    bt = (ST_Y, p);
                }
            }
            if best > NEG {
                mat[idx(c, j)] = best + diag;
                bt_m[idx(c, j)] = bt;
            }

            // X: consume a read base without a graph base, on this cell
            let open = mat[idx(c, j - 1)].saturating_sub(s.gap_open + s.gap_extend);
            let extend = ins[idx(c, j - 1)].saturating_sub(s.gap_extend);
            ins[idx(c, j)] = open.max(extend).max(NEG);

            // Y: consume this graph base without a read base
            let mut best_y = NEG;
            let mut bt_del = (ST_START, u32::MAX);
            for &p in &cell.preds {
                let pi = p as usize;
                let open = mat[idx(pi, j)].saturating_sub(s.gap_open + s.gap_extend);
                if open > best_y {
                    best_y = open;
                    bt_del = (ST_M, p);
                }
                let extend = del[idx(pi, j)].saturating_sub(s.gap_extend);
                if extend > best_y {
                    best_y = extend;
                    bt_del = (ST_Y, p);
                }
            }
            if best_y > NEG {
                del[idx(c, j)] = best_y;
                bt_y[idx(c, j)] = bt_del;
            }
        }
    }

    // pick the end cell and state
    let has_succ: Vec<bool> = {
        let mut v = vec![false; n];
        for cell in &cells {
            for &p in &cell.preds {
                v[p as usize] = true;
            }
        }
        v
    };
    let mut best_score = NEG;
    let mut end: Option<(usize, usize, u8)> = None;
    for c in 0..n {
        match shape {
            AlignmentShape::Local => {
                for j in 1..=m {
                    let bonus = if j == m { s.full_length_bonus } else { 0 };
                    let cand = mat[idx(c, j)];
                    if cand > NEG && cand + bonus > best_score {
                        best_score = cand + bonus;
                        end = Some((c, j, ST_M));
                    }
                }
            }
            AlignmentShape::PinnedLeft | AlignmentShape::Global => {
                if shape == AlignmentShape::Global && has_succ[c] {
                    continue;
                }
                for (state, lane) in [(ST_M, &mat), (ST_X, &ins), (ST_Y, &del)] {
                    let mut cand = lane[idx(c, m)];
                    if cand <= NEG {
                        continue;
                    }
                    if state == ST_M {
                        cand += s.full_length_bonus;
                    }
                    if cand > best_score {
                        best_score = cand;
                        end = Some((c, m, state));
                    }
                }
            }
        }
    }

    let (mut c, mut j, mut state) = match end {
        Some(e) if best_score > 0 || !local => e,
        _ => return out,
    };

    // trace back to (cell, read, op) triples
    #[derive(Clone, Copy)]
    enum Op {
        Diag,
        Ins,
        Del,
    }
    let mut ops: Vec<(usize, Op)> = Vec::new();
    let trailing_clip = m - j;
    loop {
        match state {
            ST_M => {
                ops.push((c, Op::Diag));
                let (prev_state, pred) = bt_m[idx(c, j)];
                j -= 1;
                if prev_state == ST_START || pred == u32::MAX {
                    break;
                }
                state = prev_state;
                c = pred as usize;
            }
            ST_X => {
                ops.push((c, Op::Ins));
                j -= 1;
                let open = mat[idx(c, j)].saturating_sub(s.gap_open + s.gap_extend);
                let extend = ins[idx(c, j)].saturating_sub(s.gap_extend);
                state = if open >= extend { ST_M } else { ST_X };
                if state == ST_M && mat[idx(c, j)] <= NEG {
                    break;
                }
            }
            ST_Y => {
                ops.push((c, Op::Del));
                let (prev_state, pred) = bt_y[idx(c, j)];
                if prev_state == ST_START || pred == u32::MAX {
                    break;
                }
                state = prev_state;
                c = pred as usize;
            }
            _ => break,
        }
        if j == 0 && state != ST_Y {
            break;
        }
    }
    let leading_clip = j;
    ops.reverse();

    // rebuild the path, grouping ops into per-node mappings
    let mut read_at = leading_clip;
    let mut path: Vec<Mapping> = Vec::new();
    let mut current: Option<Mapping> = None;
    for (ci, op) in ops {
        let cell = &cells[ci];
        let continues = current
            .as_ref()
            .map(|mapping| {
                mapping.pos.node == cell.node
                    && mapping.pos.offset + mapping.from_length() == cell.offset
            })
            .unwrap_or(false);
        let same_node_insert = matches!(op, Op::Ins)
            && current
                .as_ref()
                .map(|mapping| mapping.pos.node == cell.node)
                .unwrap_or(false);
        if !continues && !same_node_insert {
            if let Some(mapping) = current.take() {
                path.push(mapping);
            }
            current = Some(Mapping::new(GraphPos::new(cell.node, false, cell.offset)));
        }
        let mapping = current.as_mut().unwrap();
        match op {
            Op::Diag => {
                let read_base = seq[read_at].to_ascii_uppercase();
                if read_base == cell.base {
                    push_edit(mapping, Edit::matching(1));
                } else {
                    push_edit(mapping, Edit::substitution(vec![seq[read_at]]));
                }
                read_at += 1;
            }
            Op::Ins => {
                push_edit(mapping, Edit::insertion(vec![seq[read_at]]));
                read_at += 1;
            }
            Op::Del => {
                push_edit(mapping, Edit::deletion(1));
            }
        }
    }
    if let Some(mapping) = current.take() {
        path.push(mapping);
    }

    // soft clips
    if leading_clip > 0 {
        if let Some(first) = path.first_mut() {
            first
                .edits
                .insert(0, Edit::insertion(seq[..leading_clip].to_vec()));
        }
    }
    if trailing_clip > 0 {
        if let Some(last) = path.last_mut() {
            last.edits
                .push(Edit::insertion(seq[m - trailing_clip..].to_vec()));
        }
    }

    out.path = path;
    out.score = best_score.max(0);
    out.identity = out.compute_identity();
    out
}
