//! Distance-based clustering of minimizer seeds.
//!
//! Two seeds land in the same cluster when the approximate minimum graph
//! distance between their positions stays within the distance limit. The
//! relation is closed transitively with a union-find over the seed set.

use crate::graph::GraphIndex;
use crate::seed::minimizer_seeds::Seed;

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Partition seeds into clusters under `distance_limit`.
///
/// Returns clusters as lists of seed indices; ordering within and across
/// clusters carries no meaning.
pub fn cluster_seeds(
    graph: &dyn GraphIndex,
    seeds: &[Seed],
    distance_limit: i64,
) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(seeds.len());

    // sort by layout position so only nearby pairs are probed
    let mut order: Vec<usize> = (0..seeds.len()).collect();
    order.sort_by_key(|&i| graph.approx_position(seeds[i].pos));

    for w in 0..order.len() {
        let i = order[w];
        for &j in order[w + 1..].iter() {
            let gap = graph.approx_position(seeds[j].pos) - graph.approx_position(seeds[i].pos);
            if gap > distance_limit {
                break;
            }
            let d = graph.min_path_distance(seeds[i].pos, seeds[j].pos, distance_limit + 1);
            if d <= distance_limit {
                uf.union(i, j);
            }
        }
    }

    let mut clusters: std::collections::HashMap<usize, Vec<usize>> = Default::default();
    for i in 0..seeds.len() {
        let root = uf.find(i);
        clusters.entry(root).or_default().push(i);
    }
    let mut out: Vec<Vec<usize>> = clusters.into_values().collect();
    out.sort_by_key(|c| c.iter().min().copied());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphPos, MemoryGraph};

    fn seed_at(node: u64, offset: u32, read_offset: u32) -> Seed {
        Seed {
            pos: GraphPos::new(node, false, offset),
            read_offset,
            source: 0,
        }
    }

    #[test]
    fn nearby_seeds_cluster_together() {
        let mut g = MemoryGraph::new();
        g.add_node(1, &[b'A'; 100]).add_node(2, &[b'C'; 100]).add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        let seeds = vec![
            seed_at(1, 0, 0),
            seed_at(1, 20, 20),
            seed_at(2, 10, 40), // ~110 away from the first
        ];
        let clusters = cluster_seeds(&g, &seeds, 50);
        assert_eq!(clusters.len(), 2);
        let big = clusters.iter().find(|c| c.len() == 2).unwrap();
        assert!(big.contains(&0) && big.contains(&1));

        let loose = cluster_seeds(&g, &seeds, 500);
        assert_eq!(loose.len(), 1);
    }

    #[test]
    fn empty_input_gives_no_clusters() {
        let g = MemoryGraph::new();
        assert!(cluster_seeds(&g, &[], 100).is_empty());
    }
}
