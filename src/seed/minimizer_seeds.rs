//! Minimizer seed finding with hit caps and score-fraction selection.

use crate::graph::{GraphIndex, GraphPos};
use crate::index::minimizers::{Minimizer, MinimizerIndex, NO_KEY};

/// One located seed: a graph position tagged with the read offset and the
/// minimizer that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed {
    pub pos: GraphPos,
    pub read_offset: u32,
    pub source: u32,
}

/// The result of seed selection for one read.
#[derive(Debug, Clone, Default)]
pub struct SeedSelection {
    pub minimizers: Vec<Minimizer>,
    pub minimizer_scores: Vec<f64>,
    pub seeds: Vec<Seed>,
    pub rejected: usize,
}

/// Find and select seeds for a read.
///
/// Minimizers are scored `1 + ln(hard_hit_cap) − ln(hits)` and visited in
/// score-descending order; a minimizer's hits are taken if they are few
/// (`hit_cap`), or if they are tolerable (`hard_hit_cap`) and the selected
/// score so far still fits inside the target fraction of the total.
pub fn find_minimizer_seeds(
    index: &dyn MinimizerIndex,
    graph: &dyn GraphIndex,
    seq: &[u8],
    hit_cap: u32,
    hard_hit_cap: u32,
    score_fraction: f64,
) -> SeedSelection {
    let minimizers = index.minimizers(seq);
    let mut scores = vec![0.0f64; minimizers.len()];
    let mut base_target = 0.0;
    for (i, m) in minimizers.iter().enumerate() {
        if m.key == NO_KEY {
            continue;
        }
        let hits = index.count(m);
        if hits > 0 {
            scores[i] = if hits <= hard_hit_cap {
                1.0 + (hard_hit_cap as f64).ln() - (hits as f64).ln()
            } else {
                1.0
            };
        }
        base_target += scores[i];
    }
    let target_score = base_target * score_fraction;

    let mut order: Vec<usize> = (0..minimizers.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selection = SeedSelection {
        minimizers: minimizers.clone(),
        minimizer_scores: scores.clone(),
        ..Default::default()
    };
    let mut selected_score = 0.0;
    for i in order {
        let minimizer = &minimizers[i];
        if minimizer.key == NO_KEY {
            continue;
        }
        let hits = index.count(minimizer);
        if hits == 0 {
            continue;
        }
        let keep = hits <= hit_cap
            || (hits <= hard_hit_cap && selected_score + scores[i] <= target_score);
        if !keep {
            selection.rejected += 1;
            continue;
        }
        for mut hit in index.find(minimizer) {
            // hits of a reverse minimizer belong on the opposite strand;
            // base positions flip as length - offset - 1
            if minimizer.is_reverse {
                let len = graph.node_length(hit.node);
                hit = GraphPos::new(hit.node, !hit.is_reverse, len - hit.offset - 1);
            }
            selection.seeds.push(Seed {
                pos: hit,
                read_offset: minimizer.offset,
                source: i as u32,
            });
        }
        selected_score += scores[i];
    }
    selection
}

impl SeedSelection {
    /// Fraction of read bases covered by the k-mer windows of a set of
    /// seeds, given the index k.
    pub fn read_coverage(&self, seed_indices: &[usize], read_len: usize, k: usize) -> f64 {
        if read_len == 0 {
            return 0.0;
        }
        let mut covered = vec![false; read_len];
        for &si in seed_indices {
            let seed = &self.seeds[si];
            let minimizer = &self.minimizers[seed.source as usize];
            let start = if minimizer.is_reverse {
                (minimizer.offset as usize + 1).saturating_sub(k)
            } else {
                minimizer.offset as usize
            };
            for i in start..(start + k).min(read_len) {
                covered[i] = true;
            }
        }
        covered.iter().filter(|&&c| c).count() as f64 / read_len as f64
    }

    /// Sum of the distinct source minimizers' scores across a seed set.
    pub fn cluster_score(&self, seed_indices: &[usize]) -> f64 {
        let mut present = vec![false; self.minimizers.len()];
        for &si in seed_indices {
            present[self.seeds[si].source as usize] = true;
        }
        present
            .iter()
            .zip(&self.minimizer_scores)
            .filter(|(p, _)| **p)
            .map(|(_, s)| s)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::index::minimizers::MemoryMinimizerIndex;

    fn setup() -> (MemoryGraph, MemoryMinimizerIndex) {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTTGCATTGGACCAGTTACAGTA");
        g.add_path("ref", &[(1, false)]);
        let idx = MemoryMinimizerIndex::build(&g, 5, 3);
        (g, idx)
    }

    #[test]
    fn seeds_carry_their_source_minimizer() {
        let (g, idx) = setup();
        let selection = find_minimizer_seeds(&idx, &g, b"TGCATTGGACCAG", 10, 300, 0.6);
        assert!(!selection.seeds.is_empty());
        for seed in &selection.seeds {
            assert!((seed.source as usize) < selection.minimizers.len());
            assert!(g.has_node(seed.pos.node));
        }
    }

    #[test]
    fn short_reads_produce_nothing() {
        let (g, idx) = setup();
        let selection = find_minimizer_seeds(&idx, &g, b"ACGT", 10, 300, 0.6);
        assert!(selection.minimizers.is_empty());
        assert!(selection.seeds.is_empty());
    }

    #[test]
    fn scores_are_finite_and_ordered() {
        let (g, idx) = setup();
        let selection = find_minimizer_seeds(&idx, &g, b"TGCATTGGACCAGTTACA", 10, 300, 0.6);
        for &s in &selection.minimizer_scores {
            assert!(s.is_finite());
            assert!(s >= 0.0);
        }
    }

    #[test]
    fn coverage_counts_kmer_windows() {
        let (g, idx) = setup();
        let read = b"TGCATTGGACCAG";
        let selection = find_minimizer_seeds(&idx, &g, read, 10, 300, 0.6);
        if selection.seeds.is_empty() {
            return;
        }
        let all: Vec<usize> = (0..selection.seeds.len()).collect();
        let cov = selection.read_coverage(&all, read.len(), 5);
        assert!(cov > 0.0 && cov <= 1.0);
    }
}
