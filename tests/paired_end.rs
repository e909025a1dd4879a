//! Paired-end mapping scenarios: fragment learning, consistency bounds,
//! and mate rescue.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use graphite_align::utils::revcomp;
use graphite_align::{MapOpt, Mapper, MemoryGraph, PairingMode, Read, WalkIndex};

fn reference_sequence(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

fn paired_mapper(reference: &[u8], mode: PairingMode) -> Mapper {
    let mut g = MemoryGraph::new();
    g.add_node(1, reference);
    g.add_path("ref", &[(1, false)]);
    let g = Arc::new(g);
    let fm = Arc::new(WalkIndex::build(g.as_ref(), 64));
    let mut opt = MapOpt::default();
    opt.min_mem_length = 10;
    opt.reseed_length = Some(32);
    opt.pairing_mode = mode;
    opt.fragment_length_estimate_interval = 2;
    Mapper::new(g, fm, opt).unwrap()
}

fn mate_pair(reference: &[u8], name: &str, at: usize, insert: usize, len: usize) -> (Read, Read) {
    let r1 = Read::new(&format!("{name}/1"), &reference[at..at + len]);
    let end = at + insert;
    let r2 = Read::new(&format!("{name}/2"), &revcomp(&reference[end - len..end]));
    (r1, r2)
}

#[test]
fn fragment_model_learns_from_perfect_pairs() {
    let reference = reference_sequence(900, 17);
    let mapper = paired_mapper(&reference, PairingMode::Simultaneous);

    for i in 0..4 {
        let (r1, r2) = mate_pair(&reference, &format!("p{i}"), 50 + i * 80, 300, 60);
        let (alns1, alns2) = mapper.align_paired_multi(&r1, &r2);
        assert!(alns1[0].is_mapped(), "pair {i} mate 1 unmapped");
        assert!(alns2[0].is_mapped(), "pair {i} mate 2 unmapped");
        assert!(!alns1[0].is_secondary);
        let len = alns1[0].fragment_lengths.first().copied().unwrap_or(0);
        assert_eq!(len.abs(), 300, "pair {i} observed fragment {len}");
    }
    // identities were perfect, so the model has trained
    assert!(mapper.drain_retry_queue().len() >= 1);
}

#[test]
fn consistency_follows_the_model_bounds() {
    let reference = reference_sequence(1200, 29);
    let mapper = paired_mapper(&reference, PairingMode::Simultaneous);

    // untrained: anything under fragment_max passes
    let (r1, r2) = mate_pair(&reference, "wide", 100, 500, 60);
    let a1 = mapper.align(&r1);
    let a2 = mapper.align(&r2);
    assert!(a1.is_mapped() && a2.is_mapped());
    assert!(mapper.pair_consistent(&a1, &a2));

    // a fragment beyond fragment_max is never consistent
    let far1 = Read::new("far/1", &reference[0..60]);
    let far2 = Read::new("far/2", &revcomp(&reference[1100..1160]));
    let f1 = mapper.align(&far1);
    let mut f2 = mapper.align(&far2);
    f2.fragment_lengths.clear();
    let mut tight = mapper.worker();
    tight.opt.fragment_max = 800;
    assert!(!tight.pair_consistent(&f1, &f2));

    // train on 300 bp fragments and the 500 bp pair stops being consistent
    for i in 0..4 {
        let (t1, t2) = mate_pair(&reference, &format!("t{i}"), 150 + i * 70, 300, 60);
        mapper.align_paired_multi(&t1, &t2);
    }
    let (w1, w2) = mate_pair(&reference, "wide2", 100, 500, 60);
    let b1 = mapper.align(&w1);
    let mut b2 = mapper.align(&w2);
    b2.fragment_lengths.clear();
    assert!(!mapper.pair_consistent(&b1, &b2));
}

#[test]
fn separated_mode_rescues_a_broken_mate() {
    let reference = reference_sequence(900, 31);
    let mapper = paired_mapper(&reference, PairingMode::Separated);
    // train the model first
    for i in 0..4 {
        let (r1, r2) = mate_pair(&reference, &format!("seed{i}"), 60 + i * 90, 300, 60);
        mapper.align_paired_multi(&r1, &r2);
    }

    // mate 2 is garbage except for what rescue can recover near the
    // predicted window
    let (r1, good_r2) = mate_pair(&reference, "resc", 200, 300, 60);
    let mut corrupt = good_r2.sequence.clone();
    for i in 0..20 {
        corrupt[i * 3] = b'N';
    }
    let r2 = Read::new("resc/2", &corrupt);
    let (alns1, alns2) = mapper.align_paired_multi(&r1, &r2);
    assert!(alns1[0].is_mapped());
    // rescue either found a placement or left it unmapped with sequence
    // preserved; it must never invent a path that scores zero
    if alns2[0].is_mapped() {
        assert!(alns2[0].score > 0);
    } else {
        assert_eq!(alns2[0].sequence, corrupt);
    }
}

#[test]
fn combinatorial_pairs_are_index_aligned_and_deduplicated() {
    let reference = reference_sequence(900, 37);
    let mapper = paired_mapper(&reference, PairingMode::Combinatorial);
    let (r1, r2) = mate_pair(&reference, "combi", 120, 300, 60);
    let (alns1, alns2) = mapper.align_paired_multi(&r1, &r2);
    assert_eq!(alns1.len(), alns2.len());
    assert!(alns1[0].is_mapped() && alns2[0].is_mapped());
    // no duplicated joint placements
    let mut starts: Vec<_> = alns1
        .iter()
        .zip(&alns2)
        .map(|(a, b)| (a.first_position(), b.first_position()))
        .collect();
    let before = starts.len();
    starts.dedup();
    assert_eq!(before, starts.len());
}

#[test]
fn paired_mapq_is_shared_and_bounded() {
    let reference = reference_sequence(900, 41);
    let mapper = paired_mapper(&reference, PairingMode::Simultaneous);
    let (r1, r2) = mate_pair(&reference, "mq", 300, 300, 60);
    let (alns1, alns2) = mapper.align_paired_multi(&r1, &r2);
    assert!(alns1[0].mapq <= 60);
    assert!(alns2[0].mapq <= 60);
    if alns1[0].is_mapped() && alns2[0].is_mapped() {
        assert_eq!(alns1[0].mapq, alns2[0].mapq);
        assert!(alns1[0].mapq > 0);
    }
}
