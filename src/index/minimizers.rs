//! `(k, w)` minimizers and the minimizer index oracle.
//!
//! A minimizer of a window of `w` consecutive k-mers is the lexicographically
//! smallest k-mer under canonical (strand-independent) encoding, tagged with
//! the orientation in which it was smallest. Windows containing ambiguous
//! bases yield [`NO_KEY`].

use std::collections::HashMap;

use crate::graph::{GraphIndex, GraphPos};
use crate::utils::encode_base;

/// Sentinel for "no valid k-mer in this window".
pub const NO_KEY: u64 = u64::MAX;

/// One minimizer occurrence in a read.
///
/// `offset` is the position of the k-mer's first base for forward
/// minimizers and of its last base for reverse ones, matching the
/// convention the seed stage relies on when flipping hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Minimizer {
    pub key: u64,
    pub offset: u32,
    pub is_reverse: bool,
}

/// Pack a k-mer into 2 bits per base; `None` when any base is ambiguous.
fn encode_kmer(seq: &[u8]) -> Option<u64> {
    let mut key: u64 = 0;
    for &b in seq {
        let code = encode_base(b);
        if code >= 4 {
            return None;
        }
        key = (key << 2) | code as u64;
    }
    Some(key)
}

fn encode_kmer_revcomp(seq: &[u8]) -> Option<u64> {
    let mut key: u64 = 0;
    for &b in seq.iter().rev() {
        let code = encode_base(b);
        if code >= 4 {
            return None;
        }
        key = (key << 2) | (3 - code) as u64;
    }
    Some(key)
}

/// All `(k, w)` minimizers of a sequence, one per window, deduplicated
/// against repeats of the same occurrence across adjacent windows.
pub fn minimizers_of(seq: &[u8], k: usize, w: usize) -> Vec<Minimizer> {
    let mut out: Vec<Minimizer> = Vec::new();
    if k == 0 || w == 0 || seq.len() < k + w - 1 {
        return out;
    }
    for window_start in 0..=(seq.len() - (k + w - 1)) {
        let mut best: Option<Minimizer> = None;
        for i in 0..w {
            let at = window_start + i;
            let kmer = &seq[at..at + k];
            let fwd = encode_kmer(kmer);
            let rev = encode_kmer_revcomp(kmer);
            let candidate = match (fwd, rev) {
                (Some(f), Some(r)) => {
                    if f <= r {
                        Minimizer {
                            key: f,
                            offset: at as u32,
                            is_reverse: false,
                        }
                    } else {
                        Minimizer {
                            key: r,
                            offset: (at + k - 1) as u32,
                            is_reverse: true,
                        }
                    }
                }
                _ => continue,
            };
            best = match best {
                None => Some(candidate),
                Some(b) if candidate.key < b.key => Some(candidate),
                Some(b) => Some(b),
            };
        }
        match best {
            Some(m) => {
                if out.last() != Some(&m) {
                    out.push(m);
                }
            }
            None => {
                let sentinel = Minimizer {
                    key: NO_KEY,
                    offset: window_start as u32,
                    is_reverse: false,
                };
                if out.last().map(|m| m.key) != Some(NO_KEY) {
                    out.push(sentinel);
                }
            }
        }
    }
    out
}

/// Read-only oracle over an index of graph minimizers.
pub trait MinimizerIndex: Send + Sync {
    fn k(&self) -> usize;
    fn w(&self) -> usize;
    /// Minimizers of a query sequence under this index's parameters.
    fn minimizers(&self, seq: &[u8]) -> Vec<Minimizer> {
        minimizers_of(seq, self.k(), self.w())
    }
    /// Occurrence count of a minimizer key in the graph.
    fn count(&self, minimizer: &Minimizer) -> u32;
    /// Graph positions of a minimizer's occurrences (forward-strand starts).
    fn find(&self, minimizer: &Minimizer) -> Vec<GraphPos>;
}

/// In-memory minimizer index built from enumerated graph walks.
pub struct MemoryMinimizerIndex {
    k: usize,
    w: usize,
    hits: HashMap<u64, Vec<GraphPos>>,
}

impl MemoryMinimizerIndex {
    /// Index every k-mer reachable by a forward walk from each position.
    pub fn build(graph: &dyn GraphIndex, k: usize, w: usize) -> Self {
        let mut hits: HashMap<u64, Vec<GraphPos>> = HashMap::new();
        for id in graph.node_ids() {
            let len = graph.node_length(id);
            for off in 0..len {
                let start = GraphPos::new(id, false, off);
                let mut kmers: Vec<Vec<u8>> = Vec::new();
                collect_kmers(graph, start, k, &mut Vec::new(), &mut kmers);
                for kmer in kmers {
                    if kmer.len() < k {
                        continue;
                    }
                    let fwd = encode_kmer(&kmer);
                    let rev = encode_kmer_revcomp(&kmer);
                    if let (Some(f), Some(r)) = (fwd, rev) {
                        let key = f.min(r);
                        let entry = hits.entry(key).or_default();
                        if !entry.contains(&start) {
                            entry.push(start);
                        }
                    }
                }
            }
        }
        MemoryMinimizerIndex { k, w, hits }
    }
}

fn collect_kmers(
    graph: &dyn GraphIndex,
    pos: GraphPos,
    remaining: usize,
    prefix: &mut Vec<u8>,
    out: &mut Vec<Vec<u8>>,
) {
    if remaining == 0 {
        out.push(prefix.clone());
        return;
    }
    let b = match graph.position_char(pos) {
        Some(b) => b,
        None => return,
    };
    prefix.push(b);
    if remaining == 1 {
        out.push(prefix.clone());
    } else {
        for next in graph.next_positions(pos, false) {
            collect_kmers(graph, next, remaining - 1, prefix, out);
        }
    }
    prefix.pop();
}

impl MinimizerIndex for MemoryMinimizerIndex {
    fn k(&self) -> usize {
        self.k
    }

    fn w(&self) -> usize {
        self.w
    }

    fn count(&self, minimizer: &Minimizer) -> u32 {
        if minimizer.key == NO_KEY {
            return 0;
        }
        self.hits
            .get(&minimizer.key)
            .map(|v| v.len() as u32)
            .unwrap_or(0)
    }

    fn find(&self, minimizer: &Minimizer) -> Vec<GraphPos> {
        if minimizer.key == NO_KEY {
            return Vec::new();
        }
        self.hits
            .get(&minimizer.key)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    #[test]
    fn short_sequences_have_no_minimizers() {
        assert!(minimizers_of(b"ACG", 4, 2).is_empty());
    }

    #[test]
    fn ambiguous_windows_emit_no_key() {
        let mins = minimizers_of(b"NNNNNNNN", 3, 2);
        assert!(!mins.is_empty());
        assert!(mins.iter().all(|m| m.key == NO_KEY));
    }

    #[test]
    fn minimizers_are_strand_symmetric() {
        let seq = b"ACGTTGCAACGTTGCA";
        let fwd = minimizers_of(seq, 5, 3);
        let rc = minimizers_of(&crate::utils::revcomp(seq), 5, 3);
        let mut fwd_keys: Vec<u64> = fwd.iter().map(|m| m.key).collect();
        let mut rc_keys: Vec<u64> = rc.iter().map(|m| m.key).collect();
        fwd_keys.sort_unstable();
        rc_keys.sort_unstable();
        assert_eq!(fwd_keys, rc_keys);
    }

    #[test]
    fn index_finds_read_minimizers() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTACGTACGTACGT");
        g.add_path("ref", &[(1, false)]);
        let idx = MemoryMinimizerIndex::build(&g, 5, 3);
        let mins = idx.minimizers(b"ACGTACGTAC");
        assert!(!mins.is_empty());
        let located: usize = mins
            .iter()
            .filter(|m| m.key != NO_KEY)
            .map(|m| idx.find(m).len())
            .sum();
        assert!(located > 0);
    }
}
