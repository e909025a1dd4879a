//! Super-maximal exact match discovery over the graph FM-index.
//!
//! Backward search with LCP-parent backoff: the cursor walks the read right
//! to left, and when the range empties (or the match outgrows the index
//! order) the current MEM is emitted and the search resumes from the
//! suffix-tree parent of the failed range. High-frequency long MEMs are
//! optionally reseeded with shorter sub-MEMs that have hits outside every
//! containing parent.

use crate::graph::{GraphIndex, GraphPos};
use crate::index::fm::{FmIndex, FmRange};
use crate::utils::is_ambiguous;

/// A maximal exact match between a read interval and the graph.
#[derive(Debug, Clone)]
pub struct Mem {
    /// Read interval `[begin, end)`.
    pub begin: usize,
    pub end: usize,
    /// FM-index range of the match.
    pub range: FmRange,
    /// Occurrence count of the range (parents excluded for sub-MEMs).
    pub match_count: u32,
    /// Graph positions of the hits, populated when within the hit cap.
    pub nodes: Vec<GraphPos>,
    /// 1-based read fragment for paired chaining; 0 when unset.
    pub fragment: u8,
}

impl Mem {
    pub fn new(begin: usize, end: usize, range: FmRange) -> Self {
        Mem {
            begin,
            end,
            range,
            match_count: 0,
            nodes: Vec::new(),
            fragment: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read bases shared with another MEM of the same fragment.
    pub fn overlap_length(&self, other: &Mem) -> usize {
        if self.fragment != other.fragment {
            return 0;
        }
        let lo = self.begin.max(other.begin);
        let hi = self.end.min(other.end);
        hi.saturating_sub(lo)
    }

    pub fn overlaps(&self, other: &Mem) -> bool {
        self.overlap_length(other) > 0
    }
}

/// A sub-MEM together with the indices of the MEMs containing it.
#[derive(Debug, Clone)]
pub struct SubMem {
    pub mem: Mem,
    pub parents: Vec<usize>,
}

/// Parameters and oracles for MEM discovery.
pub struct MemFinder<'a> {
    pub fm: &'a dyn FmIndex,
    pub graph: &'a dyn GraphIndex,
    pub min_mem_length: usize,
    pub max_mem_length: Option<usize>,
    pub reseed_length: Option<usize>,
    pub fast_reseed: bool,
    pub hit_max: Option<u32>,
}

impl<'a> MemFinder<'a> {
    /// Find SMEMs (and sub-MEMs when reseeding) of a read, sorted by
    /// `begin` then `end`, with hit counts and node lists populated.
    pub fn find_mems(&self, seq: &[u8]) -> Vec<Mem> {
        let (mut mems, sub_mems) = self.find_mems_and_submems(seq);
        for sub in sub_mems {
            mems.push(sub.mem);
        }
        mems.sort_by(|a, b| a.begin.cmp(&b.begin).then(a.end.cmp(&b.end)));
        mems
    }

    /// The discovery pass, keeping sub-MEMs separate with their parents.
    pub fn find_mems_and_submems(&self, seq: &[u8]) -> (Vec<Mem>, Vec<SubMem>) {
        let full = self.fm.full_range();
        let mut mems: Vec<Mem> = Vec::new();
        let mut sub_mems: Vec<SubMem> = Vec::new();

        // an empty query matches the entire index
        if seq.is_empty() {
            mems.push(Mem::new(0, 0, full));
            return (mems, sub_mems);
        }

        let order = self.fm.order() as usize;
        let mut cursor: isize = seq.len() as isize - 1;
        let mut match_end = seq.len();
        let mut range = full;
        // whether the previous iteration moved match_end via the LCP parent
        // rather than the cursor; suppresses re-emitting the same MEM
        let mut prev_iter_jumped_lcp = false;

        while cursor >= 0 {
            let c = seq[cursor as usize];

            // break MEMs on ambiguous bases; they match everywhere and help nothing
            if is_ambiguous(c) {
                let begin = cursor as usize + 1;
                let mem_length = match_end - begin;
                let mut emitted = false;
                if mem_length >= self.min_mem_length {
                    mems.push(Mem::new(begin, match_end, range));
                    emitted = true;
                }
                match_end = cursor as usize;
                range = full;
                cursor -= 1;
                if emitted {
                    self.maybe_reseed(seq, &mems, mem_length, match_end, &mut sub_mems);
                }
                prev_iter_jumped_lcp = false;
                continue;
            }

            let last_range = range;
            let stepped = self.fm.lf(range, c);
            let match_length = match_end - cursor as usize;
            let over_length = self
                .max_mem_length
                .map(|mx| match_length > mx)
                .unwrap_or(false)
                || match_length > order;

            if stepped.is_empty() || over_length {
                if cursor as usize + 1 == match_end {
                    // a single mismatching character; move the cursor, not
                    // the LCP, or the search stops making progress
                    let begin = cursor as usize + 1;
                    if match_end - begin >= self.min_mem_length {
                        mems.push(Mem::new(begin, match_end, last_range));
                    }
                    match_end = cursor as usize;
                    range = full;
                    cursor -= 1;
                    prev_iter_jumped_lcp = false;
                } else {
                    let begin = cursor as usize + 1;
                    let mem_length = match_end - begin;
                    let mut emitted = false;
                    if mem_length >= self.min_mem_length && !prev_iter_jumped_lcp {
                        mems.push(Mem::new(begin, match_end, last_range));
                        emitted = true;
                    }
                    // back off to the suffix-tree parent and keep searching
                    // from the same cursor
                    let (parent_range, lcp) = self.fm.parent(last_range);
                    match_end = begin + lcp as usize;
                    range = parent_range;
                    if emitted {
                        self.maybe_reseed(seq, &mems, mem_length, match_end, &mut sub_mems);
                    }
                    prev_iter_jumped_lcp = true;
                }
            } else {
                range = stepped;
                prev_iter_jumped_lcp = false;
                cursor -= 1;
            }
        }

        // trailing MEM at the start of the read
        let mem_length = match_end;
        if mem_length >= self.min_mem_length {
            mems.push(Mem::new(0, match_end, range));
            self.maybe_reseed(seq, &mems, mem_length, 0, &mut sub_mems);
        }

        self.fill_hits(&mut mems);
        self.fill_sub_mem_hits(&mems, &mut sub_mems);

        (mems, sub_mems)
    }

    fn maybe_reseed(
        &self,
        seq: &[u8],
        mems: &[Mem],
        mem_length: usize,
        next_mem_end: usize,
        sub_mems: &mut Vec<SubMem>,
    ) {
        let reseed_length = match self.reseed_length {
            Some(r) => r,
            None => return,
        };
        if mem_length < reseed_length {
            return;
        }
        // the fast path probes at half the parent length; the thorough path
        // probes all the way down to the minimum MEM length
        let min_sub = if self.fast_reseed {
            self.min_mem_length.max(mem_length / 2)
        } else {
            self.min_mem_length
        };
        self.find_sub_mems_fast(seq, mems, next_mem_end, min_sub, sub_mems);
    }

    /// Probe/binary-search sub-MEM discovery inside the most recent MEM.
    ///
    /// A probe window of `min_sub_length` slides across the parent; a probe
    /// whose range outnumbers the parent's has hits outside the parent, and
    /// its maximal right extension is found by binary search over LF runs.
    fn find_sub_mems_fast(
        &self,
        seq: &[u8],
        mems: &[Mem],
        next_mem_end: usize,
        min_sub_length: usize,
        sub_mems_out: &mut Vec<SubMem>,
    ) {
        let parent = match mems.last() {
            Some(m) if m.len() >= min_sub_length => m,
            _ => return,
        };
        let parent_count = self.fm.count(parent.range);
        let full = self.fm.full_range();

        let mut probe_end = parent.begin + min_sub_length;
        if probe_end <= next_mem_end {
            probe_end = next_mem_end + 1;
        }

        while probe_end <= parent.end {
            let mut probe_begin = probe_end - min_sub_length;

            // LF the probe; bail as soon as it stops out-counting the parent
            let mut cursor: isize = probe_end as isize - 1;
            let mut range = full;
            let mut more_frequent = true;
            while cursor >= probe_begin as isize {
                range = self.fm.lf(range, seq[cursor as usize]);
                if self.fm.count(range) <= parent_count {
                    more_frequent = false;
                    break;
                }
                cursor -= 1;
            }

            if more_frequent {
                if probe_end == next_mem_end + 1 {
                    // the probe was shifted right to dodge the next SMEM, so
                    // it may extend further left; walk it out to restore
                    // left-maximality
                    while cursor >= parent.begin as isize {
                        let last = range;
                        range = self.fm.lf(range, seq[cursor as usize]);
                        if self.fm.count(range) <= parent_count {
                            range = last;
                            break;
                        }
                        cursor -= 1;
                    }
                    probe_begin = (cursor + 1) as usize;
                }

                // binary search the rightmost end that still has independent hits
                let mut left = probe_end;
                let mut right = parent.end;
                let mut sub_range = range;
                while right > left {
                    let middle = left + (right - left + 1) / 2;
                    let mut cursor: isize = middle as isize - 1;
                    let mut range = full;
                    let mut contained = true;
                    while cursor >= probe_begin as isize {
                        range = self.fm.lf(range, seq[cursor as usize]);
                        if self.fm.count(range) <= parent_count {
                            contained = false;
                            break;
                        }
                        cursor -= 1;
                    }
                    if contained {
                        left = middle;
                        sub_range = range;
                    } else {
                        right = middle - 1;
                    }
                }

                let mut parents = vec![mems.len() - 1];
                for i in (0..mems.len() - 1).rev() {
                    if probe_begin >= mems[i].begin {
                        parents.push(i);
                    } else {
                        break;
                    }
                }
                sub_mems_out.push(SubMem {
                    mem: Mem::new(probe_begin, left, sub_range),
                    parents,
                });
                probe_end = left + 1;
            } else {
                // the probe suffix lives only inside the parent; skip past it
                probe_end = (cursor + min_sub_length as isize + 1) as usize;
            }
        }
    }

    fn fill_hits(&self, mems: &mut [Mem]) {
        for mem in mems.iter_mut() {
            mem.match_count = self.fm.count(mem.range);
            let within_cap = self
                .hit_max
                .map(|cap| mem.match_count <= cap)
                .unwrap_or(true);
            if mem.match_count > 0 && within_cap {
                mem.nodes = self.fm.locate(mem.range);
            }
        }
    }

    /// Count and locate sub-MEM hits, excluding everything explained by the
    /// parents: counts subtract the parents' counts, and located hits on a
    /// parent's first-hit walk at the matching offset are dropped.
    fn fill_sub_mem_hits(&self, mems: &[Mem], sub_mems: &mut Vec<SubMem>) {
        for sub in sub_mems.iter_mut() {
            let mut count = self.fm.count(sub.mem.range);
            for &p in &sub.parents {
                count = count.saturating_sub(mems[p].match_count);
            }
            sub.mem.match_count = count;
            let within_cap = self
                .hit_max
                .map(|cap| count <= cap)
                .unwrap_or(true);
            if count > 0 && within_cap {
                let mut nodes = self.fm.locate(sub.mem.range);
                for &p in &sub.parents {
                    let parent = &mems[p];
                    if let Some(&first_hit) = parent.nodes.first() {
                        let offset = sub.mem.begin - parent.begin;
                        let shadow = positions_after(self.graph, first_hit, offset);
                        nodes.retain(|pos| !shadow.contains(pos));
                    }
                }
                sub.mem.nodes = nodes;
            }
        }
        sub_mems.retain(|s| s.mem.match_count > 0);
    }
}

/// All positions exactly `steps` bases forward of `start`.
fn positions_after(
    graph: &dyn GraphIndex,
    start: GraphPos,
    steps: usize,
) -> Vec<GraphPos> {
    let mut frontier = vec![start];
    for _ in 0..steps {
        let mut next = Vec::new();
        for pos in frontier {
            next.extend(graph.next_positions(pos, false));
        }
        next.sort_unstable();
        next.dedup();
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }
    frontier
}
