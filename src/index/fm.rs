//! The compressed graph FM-index oracle and an in-memory stand-in.
//!
//! The mapper only ever talks to the index through [`FmIndex`]: backward
//! search steps, range counting and location, and the longest-common-prefix
//! parent used to back off to the next-longest match. Production deployments
//! plug in a real compressed index; [`WalkIndex`] implements the same
//! contract by brute force over enumerated graph walks and backs the test
//! suite.

use std::collections::BTreeSet;

use crate::graph::{GraphIndex, GraphPos};

/// A half-open interval of index entries whose walk strings share a prefix.
///
/// `depth` is the length of that shared prefix, i.e. how many query bases
/// the range currently matches. The empty range is any with `lo >= hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmRange {
    pub lo: u64,
    pub hi: u64,
    pub depth: u32,
}

impl FmRange {
    pub fn empty() -> Self {
        FmRange {
            lo: 0,
            hi: 0,
            depth: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }

    pub fn len(&self) -> u64 {
        self.hi.saturating_sub(self.lo)
    }
}

/// Read-only oracle over the graph k-mer language.
pub trait FmIndex: Send + Sync {
    /// Number of indexed entries; the full range is `[0, size)` at depth 0.
    fn size(&self) -> u64;

    /// Maximum match length the index answers exactly.
    fn order(&self) -> u32;

    /// Occurrence count of a range.
    fn count(&self, range: FmRange) -> u32;

    /// Distinct graph positions where matches of the range begin.
    fn locate(&self, range: FmRange) -> Vec<GraphPos>;

    /// One backward-search step: extend the matched string left by `base`.
    fn lf(&self, range: FmRange, base: u8) -> FmRange;

    /// Suffix-tree parent of the range: the widest range obtained by
    /// shortening the match, together with the parent's prefix length.
    fn parent(&self, range: FmRange) -> (FmRange, u32);

    /// Range of a full query, or the empty range.
    fn find(&self, seq: &[u8]) -> FmRange {
        let mut range = self.full_range();
        for &b in seq.iter().rev() {
            range = self.lf(range, b);
            if range.is_empty() {
                return FmRange::empty();
            }
        }
        range
    }

    fn full_range(&self) -> FmRange {
        FmRange {
            lo: 0,
            hi: self.size(),
            depth: 0,
        }
    }
}

/// An in-memory index over enumerated graph walks.
///
/// Every walk of up to `order` bases starting at every oriented position is
/// collected as an entry `(walk string, start position)` and sorted
/// lexicographically. A range then carries its matched depth, which makes
/// `lf` and `parent` plain binary searches over the entry table. Intended
/// for small graphs; entry counts grow with the branching of the graph.
pub struct WalkIndex {
    entries: Vec<(Vec<u8>, GraphPos)>,
    order: u32,
}

impl WalkIndex {
    /// Enumerate walks of the graph up to `order` bases and build the index.
    pub fn build(graph: &dyn GraphIndex, order: u32) -> Self {
        let mut entries = Vec::new();
        for id in graph.node_ids() {
            let len = graph.node_length(id);
            for rev in [false, true] {
                for off in 0..len {
                    let start = GraphPos::new(id, rev, off);
                    let mut walks: Vec<Vec<u8>> = Vec::new();
                    Self::collect_walks(graph, start, order, &mut Vec::new(), &mut walks);
                    let mut distinct: BTreeSet<Vec<u8>> = BTreeSet::new();
                    for w in walks {
                        distinct.insert(w);
                    }
                    for w in distinct {
                        if !w.is_empty() {
                            entries.push((w, start));
                        }
                    }
                }
            }
        }
        entries.sort();
        WalkIndex { entries, order }
    }

    fn collect_walks(
        graph: &dyn GraphIndex,
        pos: GraphPos,
        remaining: u32,
        prefix: &mut Vec<u8>,
        out: &mut Vec<Vec<u8>>,
    ) {
        if remaining == 0 {
            out.push(prefix.clone());
            return;
        }
        let b = match graph.position_char(pos) {
            Some(b) => b,
            None => {
                if !prefix.is_empty() {
                    out.push(prefix.clone());
                }
                return;
            }
        };
        prefix.push(b);
        let nexts = graph.next_positions(pos, false);
        if nexts.is_empty() {
            out.push(prefix.clone());
        } else {
            for next in nexts {
                Self::collect_walks(graph, next, remaining - 1, prefix, out);
            }
        }
        prefix.pop();
    }

    /// First `depth` bases of the entries in `range`.
    fn range_prefix(&self, range: FmRange) -> &[u8] {
        let entry = &self.entries[range.lo as usize].0;
        &entry[..(range.depth as usize).min(entry.len())]
    }

    /// Range of entries beginning with `prefix`.
    fn prefix_range(&self, prefix: &[u8]) -> FmRange {
        let lo = self
            .entries
            .partition_point(|(s, _)| s.as_slice() < prefix);
        let hi = self.entries[lo..]
            .partition_point(|(s, _)| s.starts_with(prefix))
            + lo;
        FmRange {
            lo: lo as u64,
            hi: hi as u64,
            depth: prefix.len() as u32,
        }
    }
}

impl FmIndex for WalkIndex {
    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn order(&self) -> u32 {
        self.order
    }

    fn count(&self, range: FmRange) -> u32 {
        range.len() as u32
    }

    fn locate(&self, range: FmRange) -> Vec<GraphPos> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut positions: Vec<GraphPos> = self.entries
            [range.lo as usize..(range.hi as usize).min(self.entries.len())]
            .iter()
            .map(|&(_, pos)| pos)
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    fn lf(&self, range: FmRange, base: u8) -> FmRange {
        if range.is_empty() || crate::utils::is_ambiguous(base) {
            return FmRange::empty();
        }
        let mut prefix = Vec::with_capacity(range.depth as usize + 1);
        prefix.push(base.to_ascii_uppercase());
        prefix.extend_from_slice(self.range_prefix(range));
        self.prefix_range(&prefix)
    }

    fn parent(&self, range: FmRange) -> (FmRange, u32) {
        if range.is_empty() || range.depth == 0 {
            return (self.full_range(), 0);
        }
        let prefix = self.range_prefix(range).to_vec();
        for depth in (0..range.depth).rev() {
            let shorter = self.prefix_range(&prefix[..depth as usize]);
            if shorter.len() > range.len() {
                return (shorter, depth);
            }
        }
        (self.full_range(), 0)
    }
}
