//! Mate rescue: realigning a lost mate near its partner's position.

use log::debug;

use crate::align::alignment::{reverse_complement_alignment, Alignment};
use crate::align::cluster_align::cached_graph_context;
use crate::align::patch::score_alignment;
use crate::graph::{GraphPos, Subgraph};
use crate::mapper::Mapper;
use crate::utils::revcomp;

/// A mate is solid enough to rescue from above this identity.
const HANG_THRESHOLD: f64 = 0.9;
/// A mate is worth re-trying below this identity.
const RETRY_THRESHOLD: f64 = 0.7;

impl Mapper {
    /// Predict where the partner of `aln` should sit.
    ///
    /// Advances the alignment's approximate position by the model mean
    /// along the current strand's reference direction, flipping the strand
    /// when the model says mates map on opposite strands.
    pub(crate) fn likely_mate_position(&self, aln: &Alignment) -> Option<GraphPos> {
        let stats = self.fragment_model.snapshot();
        if !stats.is_trained() {
            return None;
        }
        let pos = aln.first_position()?;
        let here = self.approx_alignment_position(aln);
        if here < 0 {
            return None;
        }
        let delta = stats.mean.round() as i64;
        let step = if pos.is_reverse { -delta } else { delta };
        let target = if stats.same_direction {
            here + step
        } else {
            here - step
        };
        let node = self.graph.node_at_approx_position(target.max(0))?;
        let is_reverse = if stats.same_orientation {
            pos.is_reverse
        } else {
            !pos.is_reverse
        };
        Some(GraphPos::new(node, is_reverse, 0))
    }

    /// Try to rescue whichever mate looks broken off the one that looks
    /// solid. Returns true when a mate was improved.
    pub fn pair_rescue(&self, mate1: &mut Alignment, mate2: &mut Alignment) -> bool {
        if self.cancelled() {
            return false;
        }
        let stats = self.fragment_model.snapshot();
        let trained = stats.is_trained() || self.opt.fragment_size.is_some();
        if !trained {
            return false;
        }
        let (rescue_second, anchor_identity, target_identity) =
            if mate1.identity > mate2.identity {
                (true, mate1.identity, mate2.identity)
            } else {
                (false, mate2.identity, mate1.identity)
            };
        if anchor_identity <= HANG_THRESHOLD || target_identity >= RETRY_THRESHOLD {
            return false;
        }
        let (anchor, target) = if rescue_second {
            (&*mate1, &*mate2)
        } else {
            (&*mate2, &*mate1)
        };
        let mate_pos = match self.likely_mate_position(anchor) {
            Some(p) => p,
            None => return false,
        };
        debug!(
            "rescuing {} near {}",
            target.name, mate_pos
        );

        let rescued = self.align_mate_in_window(anchor, &target.sequence, &target.quality, mate_pos);
        let improved = rescued.score > target.score;
        if improved {
            if rescue_second {
                let name = mate2.name.clone();
                *mate2 = rescued;
                mate2.name = name;
            } else {
                let name = mate1.name.clone();
                *mate1 = rescued;
                mate1.name = name;
            }
        }
        improved
    }

    /// Align a mate locally inside a window around a predicted position.
    pub(crate) fn align_mate_in_window(
        &self,
        anchor: &Alignment,
        seq: &[u8],
        qual: &[u8],
        mate_pos: GraphPos,
    ) -> Alignment {
        let stats = self.fragment_model.snapshot();
        let read_len = seq.len() as i64;
        let window = if !stats.is_trained() {
            self.opt.fragment_max
        } else {
            ((stats.stdev * 6.0) as i64 + read_len).max(read_len * 4)
        }
        .max(self.opt.thread_extension);

        let mut caches = self.caches.borrow_mut();
        let mut sub = Subgraph::new();
        cached_graph_context(
            self.graph.as_ref(),
            &mut caches,
            &mut sub,
            mate_pos,
            window / 2,
        );
        let node_len = self.graph.node_length(mate_pos.node);
        cached_graph_context(
            self.graph.as_ref(),
            &mut caches,
            &mut sub,
            mate_pos.reverse(node_len),
            window / 2,
        );
        sub.remove_orphan_edges();
        drop(caches);
        if sub.node_count() == 0 {
            return Alignment::unmapped("", seq, qual);
        }
        if self.opt.max_query_graph_ratio > 0.0
            && sub.total_len() as f64 > self.opt.max_query_graph_ratio * seq.len().max(1) as f64
        {
            return Alignment::unmapped("", seq, qual);
        }

        // align on the strand the model predicts for this mate
        let anchor_rev = anchor
            .first_position()
            .map(|p| p.is_reverse)
            .unwrap_or(false);
        let flip = anchor_rev == stats.same_orientation;
        let caps = self.caps(qual);
        let mut aln = if flip {
            let rc = revcomp(seq);
            let rq: Vec<u8> = qual.iter().rev().copied().collect();
            let forward = caps.align_local(&rc, &rq, &sub);
            if forward.path.is_empty() {
                Alignment::unmapped("", seq, qual)
            } else {
                let node_len = |id: u64| self.graph.node_length(id);
                reverse_complement_alignment(&forward, &node_len)
            }
        } else {
            caps.align_local(seq, qual, &sub)
        };
        aln.score = score_alignment(self.graph.as_ref(), caps, &aln);
        aln.identity = aln.compute_identity();
        aln.sequence = seq.to_vec();
        aln.quality = qual.to_vec();
        aln
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::MemoryGraph;
    use crate::index::fm::WalkIndex;
    use crate::map_opt::MapOpt;
    use crate::mapper::{Mapper, Read};
    use crate::utils::revcomp;
    use std::sync::Arc;

    fn reference_sequence(len: usize) -> Vec<u8> {
        let mut seq = Vec::with_capacity(len);
        let mut state: u64 = 0xD1B54A32D192ED03;
        for _ in 0..len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seq.push(b"ACGT"[(state >> 33) as usize % 4]);
        }
        seq
    }

    fn trained_mapper(reference: &[u8]) -> Mapper {
        let mut g = MemoryGraph::new();
        g.add_node(1, reference);
        g.add_path("ref", &[(1, false)]);
        let g = Arc::new(g);
        let fm = Arc::new(WalkIndex::build(g.as_ref(), 64));
        let mut opt = MapOpt::default();
        opt.min_mem_length = 8;
        opt.reseed_length = Some(24);
        opt.fragment_length_estimate_interval = 2;
        let mapper = Mapper::new(g, fm, opt).unwrap();
        // train: opposite orientations, mate forward of the anchor
        for _ in 0..4 {
            mapper.fragment_model.observe(300, false, true);
        }
        mapper
    }

    #[test]
    fn likely_mate_position_advances_by_the_mean() {
        let reference = reference_sequence(600);
        let mapper = trained_mapper(&reference);
        let read = Read::new("a", &reference[50..100]);
        let aln = mapper.align(&read);
        assert!(aln.is_mapped());
        let predicted = mapper.likely_mate_position(&aln).unwrap();
        // single-node graph: the node is right, the strand flips
        assert_eq!(predicted.node, 1);
        assert!(predicted.is_reverse);
    }

    #[test]
    fn rescue_recovers_an_unmapped_mate() {
        let reference = reference_sequence(600);
        let mapper = trained_mapper(&reference);
        let r1 = Read::new("p/1", &reference[100..150]);
        let mate_seq = revcomp(&reference[350..400]);
        let mut a1 = mapper.align(&r1);
        assert!(a1.is_mapped());
        let mut a2 = crate::align::alignment::Alignment::unmapped("p/2", &mate_seq, b"");
        assert!(mapper.pair_rescue(&mut a1, &mut a2));
        assert!(a2.is_mapped());
        assert!(a2.first_position().unwrap().is_reverse);
        assert!(a2.identity > 0.9);
    }

    #[test]
    fn rescue_declines_when_both_mates_look_fine() {
        let reference = reference_sequence(600);
        let mapper = trained_mapper(&reference);
        let r1 = Read::new("p/1", &reference[100..150]);
        let r2 = Read::new("p/2", &revcomp(&reference[350..400]));
        let mut a1 = mapper.align(&r1);
        let mut a2 = mapper.align(&r2);
        assert!(a1.is_mapped() && a2.is_mapped());
        assert!(!mapper.pair_rescue(&mut a1, &mut a2));
    }
}
