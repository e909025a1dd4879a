//! Markov-style chaining of MEM hits into ranked clusters.
//!
//! Every (MEM, single graph hit) pair becomes a vertex indexed by its
//! approximate linear position. Vertices that represent the same diagonal
//! are merged, edges connect vertices within a positional bandwidth, and
//! repeated DP/traceback passes peel off the best-scoring chains while
//! masking used vertices and transitions.
//!
//! Vertices live in a dense vector and refer to each other by index, which
//! makes masking a used edge a plain index write.

use std::collections::HashSet;

use crate::graph::GraphIndex;
use crate::seed::mem::Mem;

/// One (MEM, hit) pair in the chain DAG.
#[derive(Debug, Clone)]
pub struct ChainVertex {
    /// The MEM restricted to a single hit.
    pub mem: Mem,
    pub weight: f64,
    pub approx_position: i64,
    /// Incoming transitions `(vertex, weight)`; `None` marks a masked edge.
    pub prev_cost: Vec<(Option<u32>, f64)>,
    pub next_cost: Vec<(Option<u32>, f64)>,
    score: f64,
    prev: Option<u32>,
}

/// The chain model over one read or one read pair.
pub struct ChainModel {
    verts: Vec<ChainVertex>,
    redundant: Vec<bool>,
}

impl ChainModel {
    /// Build the model.
    ///
    /// `fragments` carries the MEMs of each read of the fragment (one entry
    /// for single-end, two for paired); `transition` scores an ordered MEM
    /// pair or returns `f64::NEG_INFINITY` to forbid it.
    pub fn new(
        fragments: &[Vec<Mem>],
        graph: &dyn GraphIndex,
        transition: impl Fn(&Mem, &Mem) -> f64,
        band_width: i64,
        position_depth: Option<usize>,
        max_connections: usize,
    ) -> Self {
        let mut verts: Vec<ChainVertex> = Vec::new();
        for (frag_idx, mems) in fragments.iter().enumerate() {
            for mem in mems {
                for &node in &mem.nodes {
                    let mut single = mem.clone();
                    single.nodes = vec![node];
                    single.fragment = frag_idx as u8 + 1;
                    let approx = graph.approx_position(node);
                    verts.push(ChainVertex {
                        weight: single.len() as f64,
                        mem: single,
                        approx_position: approx,
                        prev_cost: Vec::new(),
                        next_cost: Vec::new(),
                        score: 0.0,
                        prev: None,
                    });
                }
            }
        }

        // bucket by approximate position; keep the least-repetitive vertices
        let mut buckets: Vec<(i64, Vec<u32>)> = {
            let mut map: std::collections::BTreeMap<i64, Vec<u32>> = Default::default();
            for (i, v) in verts.iter().enumerate() {
                map.entry(v.approx_position).or_default().push(i as u32);
            }
            map.into_iter().collect()
        };
        for (_, bucket) in buckets.iter_mut() {
            bucket.sort_by(|&a, &b| {
                verts[a as usize]
                    .mem
                    .match_count
                    .cmp(&verts[b as usize].mem.match_count)
            });
            if let Some(depth) = position_depth {
                bucket.truncate(depth);
            }
        }

        let mut redundant = vec![false; verts.len()];

        // merge vertices that advance equally in the read and the graph,
        // scanning forward then in reverse
        let merge_scan = |forward: bool, verts: &mut Vec<ChainVertex>, redundant: &mut Vec<bool>| {
            let n = buckets.len();
            let indices: Vec<usize> = if forward {
                (0..n).collect()
            } else {
                (0..n).rev().collect()
            };
            for (rank, &p) in indices.iter().enumerate() {
                let (p_pos, p_bucket) = (buckets[p].0, buckets[p].1.clone());
                for &v1 in &p_bucket {
                    if redundant[v1 as usize] {
                        continue;
                    }
                    for &q in indices.iter().skip(rank + 1) {
                        let (q_pos, ref q_bucket) = buckets[q];
                        if (p_pos - q_pos).abs() >= band_width {
                            break;
                        }
                        for &v2 in q_bucket {
                            if redundant[v2 as usize] || v1 == v2 {
                                continue;
                            }
                            let (m1, m2) = (&verts[v1 as usize].mem, &verts[v2 as usize].mem);
                            if m1.overlaps(m2)
                                && (m2.begin as i64 - m1.begin as i64).abs()
                                    == (q_pos - p_pos).abs()
                            {
                                let new_end = m2.end;
                                verts[v1 as usize].mem.end = new_end;
                                verts[v1 as usize].weight = verts[v1 as usize].mem.len() as f64;
                                redundant[v2 as usize] = true;
                            }
                        }
                    }
                }
            }
        };
        merge_scan(true, &mut verts, &mut redundant);
        merge_scan(false, &mut verts, &mut redundant);

        // connect vertices within the band
        for p in 0..buckets.len() {
            let (p_pos, p_bucket) = (buckets[p].0, buckets[p].1.clone());
            for &v1 in &p_bucket {
                if redundant[v1 as usize] {
                    continue;
                }
                for q in (p + 1)..buckets.len() {
                    let (q_pos, ref q_bucket) = buckets[q];
                    if (p_pos - q_pos).abs() >= band_width {
                        break;
                    }
                    for &v2 in q_bucket {
                        if redundant[v2 as usize] || v1 == v2 {
                            continue;
                        }
                        if verts[v1 as usize].next_cost.len() >= max_connections
                            || verts[v2 as usize].prev_cost.len() >= max_connections
                        {
                            continue;
                        }
                        let (m1, m2) = (&verts[v1 as usize].mem, &verts[v2 as usize].mem);
                        if m1.fragment < m2.fragment
                            || (m1.fragment == m2.fragment && m1.begin < m2.begin)
                        {
                            let weight = transition(m1, m2);
                            if weight > f64::NEG_INFINITY {
                                verts[v1 as usize].next_cost.push((Some(v2), weight));
                                verts[v2 as usize].prev_cost.push((Some(v1), weight));
                            }
                        } else if m1.fragment > m2.fragment
                            || (m1.fragment == m2.fragment && m1.begin > m2.begin)
                        {
                            let weight = transition(m2, m1);
                            if weight > f64::NEG_INFINITY {
                                verts[v2 as usize].next_cost.push((Some(v1), weight));
                                verts[v1 as usize].prev_cost.push((Some(v2), weight));
                            }
                        }
                    }
                }
            }
        }

        ChainModel { verts, redundant }
    }

    /// Number of live (non-redundant) vertices.
    pub fn vertex_count(&self) -> usize {
        self.redundant.iter().filter(|&&r| !r).count()
    }

    pub fn vertices(&self) -> &[ChainVertex] {
        &self.verts
    }

    fn clear_scores(&mut self) {
        for v in &mut self.verts {
            v.score = 0.0;
            v.prev = None;
        }
    }

    /// Propagate chain scores; `exclude` masks whole vertices.
    fn score(&mut self, exclude: &HashSet<u32>) {
        for i in 0..self.verts.len() {
            if exclude.contains(&(i as u32)) || self.redundant[i] {
                continue;
            }
            let mut best = self.verts[i].weight;
            let mut best_prev = None;
            for k in 0..self.verts[i].prev_cost.len() {
                let (p, w) = self.verts[i].prev_cost[k];
                let p = match p {
                    Some(p) => p,
                    None => continue, // masked transition
                };
                if exclude.contains(&p) {
                    continue;
                }
                let proposal = self.verts[i].weight + w + self.verts[p as usize].score;
                if proposal > best {
                    best = proposal;
                    best_prev = Some(p);
                }
            }
            self.verts[i].score = best;
            self.verts[i].prev = best_prev;
        }
    }

    fn max_vertex(&self) -> Option<u32> {
        let mut best: Option<u32> = None;
        for (i, v) in self.verts.iter().enumerate() {
            if self.redundant[i] {
                continue;
            }
            if best
                .map(|b| v.score > self.verts[b as usize].score)
                .unwrap_or(true)
            {
                best = Some(i as u32);
            }
        }
        best
    }

    /// Peel off up to `alt_alns` best chains as MEM clusters.
    ///
    /// Each round rescans the DAG with the used vertices excluded and the
    /// used transitions masked; paired mode additionally severs transitions
    /// that would reuse the other fragment's part of an earlier chain.
    pub fn traceback(&mut self, alt_alns: usize, paired: bool) -> Vec<Vec<Mem>> {
        let mut traces: Vec<Vec<Mem>> = Vec::new();
        let mut exclude: HashSet<u32> = HashSet::new();
        for _ in 0..alt_alns {
            self.clear_scores();
            self.score(&exclude);
            let vertex = match self.max_vertex() {
                Some(v) if self.verts[v as usize].score > 0.0 => v,
                _ => break,
            };
            let mut vertex_trace = vec![vertex];
            while let Some(prev) = self.verts[*vertex_trace.last().unwrap() as usize].prev {
                vertex_trace.push(prev);
            }
            if paired && vertex_trace.len() == 1 {
                exclude.insert(vertex_trace[0]);
            }
            let chain_members: HashSet<u32> = if paired {
                vertex_trace.iter().copied().collect()
            } else {
                HashSet::new()
            };
            let mut cluster: Vec<Mem> = Vec::with_capacity(vertex_trace.len());
            // walk the chain from its start to its end
            for (step, &vi) in vertex_trace.iter().rev().enumerate() {
                if !paired {
                    exclude.insert(vi);
                }
                if step > 0 {
                    let prev_vi = vertex_trace[vertex_trace.len() - step];
                    let fragment = self.verts[vi as usize].mem.fragment;
                    for k in 0..self.verts[vi as usize].prev_cost.len() {
                        let (p, _) = self.verts[vi as usize].prev_cost[k];
                        let p = match p {
                            Some(p) => p,
                            None => continue,
                        };
                        if p == prev_vi {
                            self.verts[vi as usize].prev_cost[k].0 = None;
                        } else if paired
                            && self.verts[p as usize].mem.fragment != fragment
                            && chain_members.contains(&p)
                        {
                            self.verts[vi as usize].prev_cost[k].0 = None;
                        }
                    }
                }
                cluster.push(self.verts[vi as usize].mem.clone());
            }
            traces.push(cluster);
        }
        traces
    }
}

/// Number of distinct read positions covered by a cluster's MEMs,
/// fragment-aware.
pub fn cluster_coverage(cluster: &[Mem]) -> usize {
    let mut seen: HashSet<(u8, usize)> = HashSet::new();
    for mem in cluster {
        for p in mem.begin..mem.end {
            seen.insert((mem.fragment, p));
        }
    }
    seen.len()
}

fn clusters_overlap(a: &[Mem], b: &[Mem]) -> bool {
    a.iter().any(|m1| b.iter().any(|m2| m1.overlaps(m2)))
}

/// Indices of clusters dominated by a longer overlapping cluster.
///
/// A cluster is dropped when it overlaps a better-covering cluster and its
/// own coverage falls below `drop_chain` of the better one's.
pub fn clusters_to_drop(clusters: &[Vec<Mem>], drop_chain: f64) -> HashSet<usize> {
    let mut to_drop = HashSet::new();
    let coverage: Vec<usize> = clusters.iter().map(|c| cluster_coverage(c)).collect();
    for i in 0..clusters.len() {
        let t = coverage[i];
        let mut l = t;
        let mut dominated = false;
        for j in (0..i).rev() {
            if clusters_overlap(&clusters[i], &clusters[j]) && coverage[j] > l {
                l = coverage[j];
                dominated = true;
            }
        }
        if dominated && (t as f64) / (l as f64) < drop_chain {
            to_drop.insert(i);
        }
    }
    to_drop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphPos, MemoryGraph};
    use crate::index::fm::FmRange;

    fn mem_at(begin: usize, end: usize, node: u64, offset: u32, count: u32) -> Mem {
        let mut mem = Mem::new(begin, end, FmRange::empty());
        mem.match_count = count;
        mem.nodes = vec![GraphPos::new(node, false, offset)];
        mem
    }

    fn layout_graph() -> MemoryGraph {
        let mut g = MemoryGraph::new();
        g.add_node(1, &[b'A'; 50]).add_node(2, &[b'C'; 50]).add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        g
    }

    fn simple_transition(m1: &Mem, m2: &Mem) -> f64 {
        if m2.begin >= m1.begin {
            (m1.len() + m2.len()) as f64
        } else {
            f64::NEG_INFINITY
        }
    }

    #[test]
    fn collinear_mems_chain_together() {
        let g = layout_graph();
        let mems = vec![
            mem_at(0, 10, 1, 0, 1),
            mem_at(12, 22, 1, 12, 1),
            mem_at(30, 45, 1, 30, 1),
        ];
        let mut model = ChainModel::new(
            &[mems],
            &g,
            simple_transition,
            100,
            None,
            10,
        );
        let clusters = model.traceback(2, false);
        assert!(!clusters.is_empty());
        assert_eq!(clusters[0].len(), 3);
        let begins: Vec<usize> = clusters[0].iter().map(|m| m.begin).collect();
        assert_eq!(begins, vec![0, 12, 30]);
    }

    #[test]
    fn forbidden_transitions_split_chains() {
        let g = layout_graph();
        let mems = vec![mem_at(0, 10, 1, 0, 1), mem_at(12, 22, 2, 10, 1)];
        let far = |_: &Mem, _: &Mem| f64::NEG_INFINITY;
        let mut model = ChainModel::new(&[mems], &g, far, 200, None, 10);
        let clusters = model.traceback(4, false);
        // no edges allowed: each MEM is its own cluster
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn redundant_diagonal_hits_are_merged() {
        let g = layout_graph();
        // two overlapping MEMs on the same diagonal (read delta == graph delta)
        let mems = vec![mem_at(0, 12, 1, 0, 1), mem_at(4, 20, 1, 4, 1)];
        let model = ChainModel::new(&[mems], &g, simple_transition, 100, None, 10);
        assert_eq!(model.vertex_count(), 1);
        let live: Vec<&ChainVertex> = model
            .verts
            .iter()
            .zip(&model.redundant)
            .filter(|(_, &r)| !r)
            .map(|(v, _)| v)
            .collect();
        assert_eq!(live[0].mem.end, 20);
    }

    #[test]
    fn traceback_yields_alternatives_without_reuse() {
        let g = layout_graph();
        let mems = vec![
            mem_at(0, 10, 1, 0, 1),
            mem_at(0, 10, 2, 0, 2), // alternative placement of the same interval
        ];
        let mut model = ChainModel::new(&[mems], &g, simple_transition, 20, None, 10);
        let clusters = model.traceback(4, false);
        assert_eq!(clusters.len(), 2);
        let nodes: HashSet<u64> = clusters
            .iter()
            .map(|c| c[0].nodes[0].node)
            .collect();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn paired_chains_span_fragments() {
        let g = layout_graph();
        let mems1 = vec![mem_at(0, 10, 1, 0, 1)];
        let mems2 = vec![mem_at(0, 10, 2, 20, 1)];
        let cross = |m1: &Mem, m2: &Mem| {
            if m1.fragment != m2.fragment {
                5.0
            } else {
                simple_transition(m1, m2)
            }
        };
        let mut model = ChainModel::new(&[mems1, mems2], &g, cross, 200, None, 10);
        let clusters = model.traceback(2, true);
        assert!(!clusters.is_empty());
        let fragments: HashSet<u8> = clusters[0].iter().map(|m| m.fragment).collect();
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn coverage_and_drop_rules() {
        let big = vec![mem_at(0, 30, 1, 0, 1)];
        let small = vec![mem_at(5, 9, 1, 40, 1)];
        assert_eq!(cluster_coverage(&big), 30);
        assert_eq!(cluster_coverage(&small), 4);
        let dropped = clusters_to_drop(&[big, small], 0.2);
        assert!(dropped.contains(&1));
        assert!(!dropped.contains(&0));
    }
}
