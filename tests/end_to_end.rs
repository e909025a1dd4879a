//! End-to-end mapping scenarios over small in-memory graphs.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use graphite_align::align::alignment::check_alignment;
use graphite_align::align::patch::score_alignment;
use graphite_align::{
    GraphIndex, MapOpt, Mapper, MemoryGraph, Read, WalkIndex,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn reference_sequence(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

fn mapper_for(graph: MemoryGraph, opt: MapOpt) -> Mapper {
    let graph = Arc::new(graph);
    let fm = Arc::new(WalkIndex::build(graph.as_ref(), 64));
    Mapper::new(graph, fm, opt).unwrap()
}

fn small_opt() -> MapOpt {
    let mut opt = MapOpt::default();
    opt.min_mem_length = 4;
    opt.reseed_length = Some(16);
    opt
}

#[test]
fn exact_read_on_a_single_node() {
    init_logs();
    let mut g = MemoryGraph::new();
    g.add_node(1, b"ACGTACGTAC");
    g.add_path("ref", &[(1, false)]);
    let mapper = mapper_for(g, small_opt());

    let alns = mapper.align_multi(&Read::new("exact", b"ACGTACGTAC"));
    let primary = &alns[0];
    assert!(primary.is_mapped());
    let s = &mapper.opt.scoring;
    assert_eq!(
        primary.score,
        10 * s.match_score + 2 * s.full_length_bonus
    );
    assert_eq!(primary.identity, 1.0);
    assert_eq!(primary.mapq, 60);
    assert!(!primary.is_secondary);
    assert!(alns.iter().skip(1).all(|a| a.is_secondary));
}

#[test]
fn single_substitution_mid_read() {
    let mut g = MemoryGraph::new();
    g.add_node(1, b"ACGTACGTAC");
    g.add_path("ref", &[(1, false)]);
    let mapper = mapper_for(g, small_opt());

    let aln = mapper.align(&Read::new("snp", b"ACGTAGGTAC"));
    assert!(aln.is_mapped());
    let subs: Vec<_> = aln
        .path
        .iter()
        .flat_map(|m| m.edits.iter())
        .filter(|e| e.is_substitution())
        .collect();
    assert_eq!(subs.len(), 1);
    let s = &mapper.opt.scoring;
    // nine matched bases, one mismatch, both ends reach the read bounds
    assert_eq!(
        aln.score,
        9 * s.match_score - s.mismatch + 2 * s.full_length_bonus
    );
    assert_eq!(aln.identity, 0.9);
}

#[test]
fn bubble_graph_places_the_primary_on_the_direct_path() {
    let mut g = MemoryGraph::new();
    g.add_node(1, b"ACGT")
        .add_node(2, b"AACT")
        .add_node(3, b"TTTT");
    g.add_edge(1, 2).add_edge(1, 3);
    g.add_path("ref", &[(1, false), (2, false)]);
    let mapper = mapper_for(g, small_opt());

    let aln = mapper.align(&Read::new("direct", b"ACGTAACT"));
    assert!(aln.is_mapped());
    let nodes: Vec<u64> = aln.path.iter().map(|m| m.pos.node).collect();
    assert!(nodes.contains(&1));
    assert!(nodes.contains(&2));
    assert!(!nodes.contains(&3));
    assert_eq!(aln.identity, 1.0);
    assert!(aln.mapq >= 1 && aln.mapq <= 60);
}

#[test]
fn banded_mapping_of_a_long_read() {
    init_logs();
    let left = reference_sequence(250, 11);
    let right = reference_sequence(250, 23);
    let mut g = MemoryGraph::new();
    g.add_node(1, &left).add_node(2, &right).add_edge(1, 2);
    g.add_path("ref", &[(1, false), (2, false)]);
    let mut reference = left.clone();
    reference.extend_from_slice(&right);

    let mut opt = small_opt();
    opt.min_mem_length = 10;
    opt.band_width = 150;
    let mapper = mapper_for(g, opt);

    let read_seq = &reference[30..430];
    let aln = mapper.align(&Read::new("long", read_seq));
    assert!(aln.is_mapped(), "banded read failed to map");
    // cumulative read length is preserved through band stripping and merge
    assert_eq!(aln.to_length(), 400);
    let clipped = aln.softclip_start() + aln.softclip_end();
    assert!(clipped <= 20, "unexpectedly large soft clips: {clipped}");
    // every mapping stays inside its node and spells the graph
    let graph = {
        let mut g = MemoryGraph::new();
        g.add_node(1, &left).add_node(2, &right).add_edge(1, 2);
        g.add_path("ref", &[(1, false), (2, false)]);
        g
    };
    assert!(check_alignment(&graph, &aln));
}

#[test]
fn split_read_gets_a_central_insertion() {
    // two anchoring regions over {A,C,G} with 30 bp of unmatchable sequence
    // in between
    let anchors = {
        let mut seq: Vec<u8> = Vec::new();
        let mut state = 77u64;
        while seq.len() < 40 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let b = b"ACG"[(state >> 33) as usize % 3];
            // no A runs: the T-run filler must stay unmatchable on both strands
            if b == b'A' && seq.ends_with(b"AA") {
                seq.push(b'C');
            } else {
                seq.push(b);
            }
        }
        seq
    };
    let mut g = MemoryGraph::new();
    g.add_node(1, &anchors);
    g.add_path("ref", &[(1, false)]);

    let mut opt = small_opt();
    opt.min_mem_length = 6;
    // reward matches enough that bridging the gap beats clipping an anchor
    opt.scoring.match_score = 2;
    let mapper = mapper_for(g, opt);

    let mut read_seq = anchors[..20].to_vec();
    read_seq.extend(std::iter::repeat(b'T').take(30));
    read_seq.extend_from_slice(&anchors[20..]);
    let aln = mapper.align(&Read::new("split", &read_seq));
    assert!(aln.is_mapped());
    let insertions: Vec<u32> = aln
        .path
        .iter()
        .flat_map(|m| m.edits.iter())
        .filter(|e| e.is_insertion())
        .map(|e| e.to_len)
        .collect();
    assert_eq!(insertions, vec![30]);
    assert_eq!(aln.to_length(), 70);
}

#[test]
fn one_base_insertion_at_the_midpoint() {
    let reference = reference_sequence(40, 5);
    let mut g = MemoryGraph::new();
    g.add_node(1, &reference);
    g.add_path("ref", &[(1, false)]);
    let mut opt = small_opt();
    opt.min_mem_length = 6;
    let mapper = mapper_for(g, opt);

    let exact = mapper.align(&Read::new("exact", &reference[0..20]));
    let mut with_ins = reference[0..10].to_vec();
    // insert a base that disagrees with the reference continuation
    let foreign = match reference[10] {
        b'A' => b'C',
        b'C' => b'G',
        b'G' => b'T',
        _ => b'A',
    };
    with_ins.push(foreign);
    with_ins.extend_from_slice(&reference[10..20]);
    let aln = mapper.align(&Read::new("ins", &with_ins));
    assert!(aln.is_mapped());
    let insertions: Vec<u32> = aln
        .path
        .iter()
        .flat_map(|m| m.edits.iter())
        .filter(|e| e.is_insertion())
        .map(|e| e.to_len)
        .collect();
    assert_eq!(insertions, vec![1]);
    let s = &mapper.opt.scoring;
    assert_eq!(
        exact.score - aln.score,
        s.gap_open + s.gap_extend
    );
}

#[test]
fn reverse_complement_round_trip() {
    let reference = reference_sequence(120, 42);
    let mut g = MemoryGraph::new();
    g.add_node(1, &reference);
    g.add_path("ref", &[(1, false)]);
    let mut opt = small_opt();
    opt.min_mem_length = 8;
    let mapper = mapper_for(g, opt);

    let read_seq = &reference[20..80];
    let fwd = mapper.align(&Read::new("fwd", read_seq));
    let rc_seq = graphite_align::utils::revcomp(read_seq);
    let rev = mapper.align(&Read::new("rev", &rc_seq));
    assert!(fwd.is_mapped() && rev.is_mapped());
    assert_eq!(fwd.score, rev.score);

    let graph = {
        let mut g = MemoryGraph::new();
        g.add_node(1, &reference);
        g
    };
    let node_len = |id: u64| graph.node_length(id);
    let flipped =
        graphite_align::align::alignment::reverse_complement_alignment(&rev, &node_len);
    assert_eq!(flipped.path, fwd.path);
}

#[test]
fn rescoring_an_emitted_alignment_is_stable() {
    let reference = reference_sequence(100, 9);
    let mut g = MemoryGraph::new();
    g.add_node(1, &reference);
    g.add_path("ref", &[(1, false)]);
    let mut opt = small_opt();
    opt.min_mem_length = 8;
    let mapper = mapper_for(g, opt);

    let mut seq = reference[10..70].to_vec();
    seq[25] = match seq[25] {
        b'A' => b'G',
        _ => b'A',
    };
    let aln = mapper.align(&Read::new("resc", &seq));
    assert!(aln.is_mapped());

    let graph = {
        let mut g = MemoryGraph::new();
        g.add_node(1, &reference);
        g.add_path("ref", &[(1, false)]);
        g
    };
    let caps = graphite_align::Aligner::new(mapper.opt.scoring);
    assert_eq!(score_alignment(&graph, &caps, &aln), aln.score);
}

#[test]
fn repeated_mapping_is_deterministic() {
    let reference = reference_sequence(300, 3);
    let mut g = MemoryGraph::new();
    g.add_node(1, &reference);
    g.add_path("ref", &[(1, false)]);
    let mut opt = small_opt();
    opt.min_mem_length = 8;
    opt.band_width = 100;
    let mapper = mapper_for(g, opt);

    let read = Read::new("repeat", &reference[20..270]);
    let first = mapper.align(&read);
    let second = mapper.align(&read);
    assert_eq!(first.score, second.score);
    assert_eq!(first.path, second.path);
}

#[test]
fn mapq_is_zero_for_truly_ambiguous_placements() {
    // the same 30 bp sequence on two unconnected nodes
    let repeat = reference_sequence(30, 8);
    let mut g = MemoryGraph::new();
    g.add_node(1, &repeat).add_node(2, &repeat);
    g.add_path("ref", &[(1, false)]);
    let mut opt = small_opt();
    opt.min_mem_length = 8;
    let mapper = mapper_for(g, opt);

    let alns = mapper.align_multi(&Read::new("ambiguous", &repeat[2..28]));
    assert!(alns[0].is_mapped());
    assert_eq!(alns[0].mapq, 0);
}
