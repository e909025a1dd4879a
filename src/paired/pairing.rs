//! Paired-end resolution strategies.
//!
//! Three strategies share the same outer contract: both mates go in, two
//! parallel candidate lists come out, pair-consistent placements are
//! preferred, and perfect pairs feed the fragment model. Pairs mapped
//! before the model has trained are parked on a retry queue.

use log::debug;

use crate::align::alignment::Alignment;
use crate::cluster::chain::ChainModel;
use crate::map_opt::PairingMode;
use crate::mapper::{Mapper, Read};
use crate::mapq::compute_paired_mapping_qualities;
use crate::seed::mem::Mem;
use crate::utils::normal_pdf;

impl Mapper {
    /// Map a read pair.
    ///
    /// Returns ranked candidate lists for both mates, index-aligned where
    /// the strategy produces joint candidates.
    pub fn align_paired_multi(
        &self,
        read1: &Read,
        read2: &Read,
    ) -> (Vec<Alignment>, Vec<Alignment>) {
        let banded = read1.sequence.len() > self.opt.band_width
            || read2.sequence.len() > self.opt.band_width;
        let mode = if banded {
            PairingMode::Separated
        } else {
            self.opt.pairing_mode
        };
        let (mut alns1, mut alns2) = match mode {
            PairingMode::Simultaneous => self.align_paired_simul(read1, read2),
            PairingMode::Combinatorial => self.align_paired_combi(read1, read2),
            PairingMode::Separated => self.align_paired_sep(read1, read2),
        };
        self.finalize_pair(read1, read2, &mut alns1, &mut alns2);
        (alns1, alns2)
    }

    /// Drain pairs parked before the fragment model trained and remap them.
    pub fn drain_retry_queue(&self) -> Vec<(Vec<Alignment>, Vec<Alignment>)> {
        let queued: Vec<(Read, Read)> = {
            let mut queue = self.retry_queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        if !queued.is_empty() {
            debug!("retrying {} deferred pairs", queued.len());
        }
        queued
            .iter()
            .map(|(r1, r2)| self.align_paired_multi(r1, r2))
            .collect()
    }

    /// Whether two mate placements look like one fragment.
    pub fn pair_consistent(&self, aln1: &Alignment, aln2: &Alignment) -> bool {
        if !(aln1.is_mapped() && aln2.is_mapped()) {
            return false;
        }
        let stats = self.fragment_model.snapshot();
        let cap = self
            .opt
            .fragment_size
            .or(if stats.is_trained() {
                Some(stats.size_cap)
            } else {
                None
            });
        let length_ok = if !aln1.fragment_lengths.is_empty() {
            aln1.fragment_lengths.iter().any(|&len| {
                let len = len.abs();
                match cap {
                    Some(c) => len > 0 && len < c,
                    None => len > 0 && len < self.opt.fragment_max,
                }
            })
        } else {
            let len = self.approx_fragment_length(aln1, aln2);
            let len = if len == i64::MAX { 0 } else { len.abs() };
            match cap {
                Some(c) => len > 0 && len < c,
                None => len > 0 && len < self.opt.fragment_max,
            }
        };
        let rev1 = aln1.first_position().map(|p| p.is_reverse).unwrap_or(false);
        let rev2 = aln2.first_position().map(|p| p.is_reverse).unwrap_or(false);
        let orientation_ok = if stats.is_trained() {
            stats.same_orientation == (rev1 == rev2)
        } else {
            true
        };
        length_ok && orientation_ok
    }

    /// Record an accepted fragment configuration into the model.
    pub(crate) fn record_fragment_configuration(
        &self,
        length: i64,
        aln1: &Alignment,
        aln2: &Alignment,
    ) {
        let rev1 = match aln1.first_position() {
            Some(p) => p.is_reverse,
            None => return,
        };
        let rev2 = match aln2.first_position() {
            Some(p) => p.is_reverse,
            None => return,
        };
        let same_orientation = rev1 == rev2;
        // direction: does the second mate lie forward of the first along
        // the first mate's strand
        let same_direction = if rev1 { length <= 0 } else { length >= 0 };
        self.fragment_model
            .observe(length, same_orientation, same_direction);
    }

    /// One chain model over both fragments; cross-fragment transitions are
    /// constrained by the fragment model.
    fn align_paired_simul(
        &self,
        read1: &Read,
        read2: &Read,
    ) -> (Vec<Alignment>, Vec<Alignment>) {
        let total_multimaps = self.opt.total_multimaps();
        let graph = self.graph.as_ref();
        let scoring = *self.caps(&read1.quality).scoring();
        let stats = self.fragment_model.snapshot();
        let fragment_size = self
            .opt
            .fragment_size
            .or(if stats.is_trained() {
                Some(stats.size_cap)
            } else {
                None
            });
        let fragment_max = self.opt.fragment_max;

        let mems1: Vec<Mem> = self
            .find_mems(&read1.sequence, self.min_mem_length)
            .into_iter()
            .filter(|m| !m.nodes.is_empty())
            .collect();
        let mems2: Vec<Mem> = self
            .find_mems(&read2.sequence, self.min_mem_length)
            .into_iter()
            .filter(|m| !m.nodes.is_empty())
            .collect();

        let has_paths = graph.path_count() > 0;
        let transition = |m1: &Mem, m2: &Mem| -> f64 {
            let p1 = m1.nodes[0];
            let p2 = m2.nodes[0];
            let approx = graph.approx_position(p2) - graph.approx_position(p1);
            if m1.fragment < m2.fragment {
                let mut dist = approx.abs();
                if dist >= fragment_max {
                    return f64::NEG_INFINITY;
                }
                if has_paths {
                    dist = graph.min_path_distance(p1, p2, fragment_max);
                }
                if dist >= fragment_max {
                    return f64::NEG_INFINITY;
                }
                match fragment_size {
                    Some(size) => {
                        let same_strand = p1.is_reverse == p2.is_reverse;
                        if stats.same_orientation != same_strand || dist > size {
                            f64::NEG_INFINITY
                        } else {
                            let denom = normal_pdf(stats.mean, stats.mean, stats.stdev);
                            if denom > 0.0 {
                                normal_pdf(dist as f64, stats.mean, stats.stdev) / denom
                            } else {
                                1.0 / dist.max(1) as f64
                            }
                        }
                    }
                    None => 1.0 / dist.max(1) as f64,
                }
            } else if m1.fragment > m2.fragment {
                f64::NEG_INFINITY // never walk backward through the fragment
            } else {
                let max_length = (2 * (m1.len() + m2.len())) as i64;
                let dist = approx.abs();
                if dist >= max_length || p1.is_reverse != p2.is_reverse {
                    return f64::NEG_INFINITY;
                }
                let uniqueness = 2.0 / (m1.match_count + m2.match_count).max(1) as f64;
                let unique_coverage = (m1.len() + m2.len() - m1.overlap_length(m2)) as f64;
                let jump = (m2.begin as i64 - m1.begin as i64 - dist).abs();
                let base = unique_coverage * scoring.match_score as f64 * uniqueness;
                if jump > 0 {
                    base - (scoring.gap_open as f64 + jump as f64 * scoring.gap_extend as f64)
                } else {
                    base
                }
            }
        };

        let band = ((read1.sequence.len() + read2.sequence.len()) as i64)
            .max(fragment_size.unwrap_or(fragment_max));
        let mut model = ChainModel::new(
            &[mems1, mems2],
            graph,
            transition,
            band,
            self.opt.chain_position_depth,
            self.opt.chain_max_connections,
        );
        let clusters = model.traceback(total_multimaps, true);

        let mut alns1: Vec<Alignment> = Vec::new();
        let mut alns2: Vec<Alignment> = Vec::new();
        for cluster in &clusters {
            // split the chain at the fragment boundary
            let mut cluster1: Vec<Mem> = Vec::new();
            let mut cluster2: Vec<Mem> = Vec::new();
            let mut seen2 = false;
            for mem in cluster {
                if mem.fragment == 1 && !seen2 {
                    cluster1.push(mem.clone());
                } else if mem.fragment == 2 {
                    seen2 = true;
                    cluster2.push(mem.clone());
                }
            }
            let mut aln1 = if cluster1.is_empty() {
                Alignment::unmapped(&read1.name, &read1.sequence, &read1.quality)
            } else {
                self.align_cluster_full(read1, &cluster1)
            };
            let mut aln2 = if cluster2.is_empty() {
                Alignment::unmapped(&read2.name, &read2.sequence, &read2.quality)
            } else {
                self.align_cluster_full(read2, &cluster2)
            };
            // one-sided chains leave the other mate for rescue
            if self.opt.mate_rescues > 0 && (aln1.is_mapped() ^ aln2.is_mapped()) {
                self.pair_rescue(&mut aln1, &mut aln2);
            }
            if aln1.identity > self.opt.min_identity || aln2.identity > self.opt.min_identity {
                alns1.push(aln1);
                alns2.push(aln2);
            }
        }

        if alns1.is_empty() {
            alns1.push(Alignment::unmapped(&read1.name, &read1.sequence, &read1.quality));
            alns2.push(Alignment::unmapped(&read2.name, &read2.sequence, &read2.quality));
        }
        self.sort_pairs(&mut alns1, &mut alns2);
        (alns1, alns2)
    }

    /// Multi-map both mates independently and cross the candidates.
    fn align_paired_combi(
        &self,
        read1: &Read,
        read2: &Read,
    ) -> (Vec<Alignment>, Vec<Alignment>) {
        let candidates1 = {
            let mut c = self.align_multi_internal(read1, self.opt.extra_multimaps, false);
            c.push(Alignment::unmapped(&read1.name, &read1.sequence, &read1.quality));
            c
        };
        let candidates2 = {
            let mut c = self.align_multi_internal(read2, self.opt.extra_multimaps, false);
            c.push(Alignment::unmapped(&read2.name, &read2.sequence, &read2.quality));
            c
        };

        let stats = self.fragment_model.snapshot();
        let mut pairs: Vec<(Alignment, Alignment, f64)> = Vec::new();
        for a1 in &candidates1 {
            for a2 in &candidates2 {
                let mut score = (a1.score + a2.score) as f64;
                if self.pair_consistent(a1, a2) && stats.is_trained() {
                    // reward a fragment length near the model's center
                    let len = self.approx_fragment_length(a1, a2).abs() as f64;
                    let denom = normal_pdf(stats.mean, stats.mean, stats.stdev);
                    if denom > 0.0 {
                        let ratio = normal_pdf(len, stats.mean, stats.stdev) / denom;
                        score += ratio * 2.0 * self.opt.scoring.match_score as f64;
                    }
                }
                pairs.push((a1.clone(), a2.clone(), score));
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        pairs.dedup_by(|a, b| {
            a.0.first_position() == b.0.first_position()
                && a.1.first_position() == b.1.first_position()
        });
        pairs.truncate(self.opt.total_multimaps().max(1));

        let mut alns1 = Vec::with_capacity(pairs.len());
        let mut alns2 = Vec::with_capacity(pairs.len());
        for (a1, a2, _) in pairs {
            alns1.push(a1);
            alns2.push(a2);
        }
        (alns1, alns2)
    }

    /// Map each mate on its own; rescue whichever end came up empty.
    fn align_paired_sep(
        &self,
        read1: &Read,
        read2: &Read,
    ) -> (Vec<Alignment>, Vec<Alignment>) {
        let mut alns1 = self.align_multi_internal(read1, self.opt.extra_multimaps, false);
        let mut alns2 = self.align_multi_internal(read2, self.opt.extra_multimaps, false);
        let needs_rescue = self.opt.always_rescue
            || alns1.first().map(|a| !a.is_mapped()).unwrap_or(true)
            || alns2.first().map(|a| !a.is_mapped()).unwrap_or(true);
        if needs_rescue && self.opt.mate_rescues > 0 {
            let mut a1 = alns1
                .first()
                .cloned()
                .unwrap_or_else(|| Alignment::unmapped(&read1.name, &read1.sequence, &read1.quality));
            let mut a2 = alns2
                .first()
                .cloned()
                .unwrap_or_else(|| Alignment::unmapped(&read2.name, &read2.sequence, &read2.quality));
            if self.pair_rescue(&mut a1, &mut a2) {
                if alns1.is_empty() {
                    alns1.push(a1);
                } else {
                    alns1[0] = a1;
                }
                if alns2.is_empty() {
                    alns2.push(a2);
                } else {
                    alns2[0] = a2;
                }
            }
        }
        (alns1, alns2)
    }

    /// Sort joint candidates by pair score, best first.
    fn sort_pairs(&self, alns1: &mut Vec<Alignment>, alns2: &mut Vec<Alignment>) {
        let mut order: Vec<usize> = (0..alns1.len()).collect();
        order.sort_by_key(|&i| -((alns1[i].score + alns2[i].score) as i64));
        let sorted1: Vec<Alignment> = order.iter().map(|&i| alns1[i].clone()).collect();
        let sorted2: Vec<Alignment> = order.iter().map(|&i| alns2[i].clone()).collect();
        *alns1 = sorted1;
        *alns2 = sorted2;
    }

    /// Shared postlude: fragment annotations, model updates, retry queue,
    /// mapping qualities, secondary flags.
    fn finalize_pair(
        &self,
        read1: &Read,
        read2: &Read,
        alns1: &mut Vec<Alignment>,
        alns2: &mut Vec<Alignment>,
    ) {
        if alns1.is_empty() {
            alns1.push(Alignment::unmapped(&read1.name, &read1.sequence, &read1.quality));
        }
        if alns2.is_empty() {
            alns2.push(Alignment::unmapped(&read2.name, &read2.sequence, &read2.quality));
        }
        if self.opt.only_top_scoring_pair {
            alns1.truncate(1);
            alns2.truncate(1);
        }

        // annotate observed fragment lengths on the joint candidates
        let n = alns1.len().min(alns2.len());
        for i in 0..n {
            if alns1[i].is_mapped() && alns2[i].is_mapped() {
                let len = self.approx_fragment_length(&alns1[i], &alns2[i]);
                if len != i64::MAX {
                    alns1[i].fragment_lengths = vec![len];
                    alns2[i].fragment_lengths = vec![-len];
                }
            }
        }

        compute_paired_mapping_qualities(
            alns1,
            alns2,
            self.opt.mapping_quality_method,
            self.opt.max_mapping_quality,
            None,
            self.opt.mq_overlap,
        );
        for (i, aln) in alns1.iter_mut().enumerate() {
            aln.is_secondary = i > 0;
            self.set_refpos(aln);
        }
        for (i, aln) in alns2.iter_mut().enumerate() {
            aln.is_secondary = i > 0;
            self.set_refpos(aln);
        }

        // learn from the winning pair
        let (a1, a2) = (&alns1[0], &alns2[0]);
        if a1.is_mapped() && a2.is_mapped() {
            let threshold = self.opt.perfect_pair_identity_threshold;
            let len = self.approx_fragment_length(a1, a2);
            let within_cap = len != i64::MAX && len.abs() < self.opt.fragment_max;
            if a1.identity > threshold && a2.identity > threshold && within_cap {
                let trained_before = self.fragment_model.is_trained();
                self.record_fragment_configuration(len, a1, a2);
                if !trained_before {
                    // remap once the model knows what a fragment looks like
                    let mut queue = self.retry_queue.lock().unwrap();
                    queue.push((read1.clone(), read2.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::index::fm::WalkIndex;
    use crate::map_opt::MapOpt;
    use crate::utils::revcomp;
    use std::sync::Arc;

    fn reference_sequence(len: usize) -> Vec<u8> {
        // deterministic non-repetitive-ish sequence
        let mut seq = Vec::with_capacity(len);
        let mut state: u64 = 0x9E3779B97F4A7C15;
        for _ in 0..len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seq.push(b"ACGT"[(state >> 33) as usize % 4]);
        }
        seq
    }

    fn mapper_over(seq: &[u8]) -> Mapper {
        let mut g = MemoryGraph::new();
        g.add_node(1, seq);
        g.add_path("ref", &[(1, false)]);
        let g = Arc::new(g);
        let fm = Arc::new(WalkIndex::build(g.as_ref(), 64));
        let mut opt = MapOpt::default();
        opt.min_mem_length = 8;
        opt.reseed_length = Some(24);
        opt.fragment_length_estimate_interval = 2;
        Mapper::new(g, fm, opt).unwrap()
    }

    fn mate_pair(reference: &[u8], at: usize, insert: usize, read_len: usize) -> (Read, Read) {
        let r1 = Read::new("m/1", &reference[at..at + read_len]);
        let end = at + insert;
        let r2_fwd = &reference[end - read_len..end];
        let r2 = Read::new("m/2", &revcomp(r2_fwd));
        (r1, r2)
    }

    #[test]
    fn consistent_pair_maps_and_trains_the_model() {
        let reference = reference_sequence(600);
        let mapper = mapper_over(&reference);
        for i in 0..3 {
            let (r1, r2) = mate_pair(&reference, 40 + i * 60, 300, 50);
            let (alns1, alns2) = mapper.align_paired_multi(&r1, &r2);
            assert!(alns1[0].is_mapped(), "mate 1 failed at pair {i}");
            assert!(alns2[0].is_mapped(), "mate 2 failed at pair {i}");
        }
        let stats = mapper.fragment_model.snapshot();
        assert!(stats.is_trained());
        assert!((stats.mean - 300.0).abs() < 30.0);
    }

    #[test]
    fn inconsistent_fragment_is_rejected_once_trained() {
        let reference = reference_sequence(800);
        let mapper = mapper_over(&reference);
        for i in 0..4 {
            let (r1, r2) = mate_pair(&reference, 30 + i * 40, 300, 50);
            mapper.align_paired_multi(&r1, &r2);
        }
        assert!(mapper.fragment_model.is_trained());
        let (r1, _) = mate_pair(&reference, 50, 300, 50);
        let (_, far_r2) = mate_pair(&reference, 50, 700, 50);
        let a1 = mapper.align(&r1);
        let a2 = mapper.align(&Read::new("far", &far_r2.sequence));
        // 700 exceeds the trained cap (300 + 4 * small stdev)
        assert!(!mapper.pair_consistent(&a1, &a2));
    }

    #[test]
    fn untrained_model_accepts_anything_below_fragment_max() {
        let reference = reference_sequence(600);
        let mapper = mapper_over(&reference);
        let (r1, r2) = mate_pair(&reference, 60, 400, 50);
        let a1 = mapper.align(&r1);
        let mut a2 = mapper.align(&r2);
        a2.fragment_lengths.clear();
        assert!(mapper.pair_consistent(&a1, &a2));
    }

    #[test]
    fn retry_queue_collects_pretraining_pairs() {
        let reference = reference_sequence(600);
        let mapper = mapper_over(&reference);
        let (r1, r2) = mate_pair(&reference, 80, 300, 50);
        mapper.align_paired_multi(&r1, &r2);
        let retried = mapper.drain_retry_queue();
        assert_eq!(retried.len(), 1);
        // the remap may re-queue once while the model is still training,
        // but the queue quiesces as soon as the model holds
        let mut rounds = 0;
        while !mapper.drain_retry_queue().is_empty() {
            rounds += 1;
            assert!(rounds < 4, "retry queue failed to quiesce");
        }
    }

    #[test]
    fn combinatorial_mode_produces_joint_candidates() {
        let reference = reference_sequence(600);
        let mut mapper = mapper_over(&reference);
        mapper.opt.pairing_mode = PairingMode::Combinatorial;
        let (r1, r2) = mate_pair(&reference, 100, 300, 50);
        let (alns1, alns2) = mapper.align_paired_multi(&r1, &r2);
        assert_eq!(alns1.len(), alns2.len());
        assert!(alns1[0].is_mapped());
        assert!(alns2[0].is_mapped());
        assert!(alns1[0].fragment_lengths.first().copied().unwrap_or(0).abs() > 0);
    }
}
