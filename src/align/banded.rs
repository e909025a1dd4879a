//! Banded alignment of long reads.
//!
//! Reads longer than the band width are split into `2·div − 1` overlapping
//! sub-reads: `div` primary bands at stride `segment_size` plus the
//! half-shifted bands between them, the last band re-anchored to the true
//! read tail. Each band aligns independently; overlaps are stripped so the
//! bands meet exactly, a DP across per-band candidates picks one alignment
//! per band, and the winners concatenate into the final alignment.

use crate::align::alignment::{merge_alignments, Alignment};
use crate::graph::{graph_distance, GraphIndex, GraphPos};

/// One band of a long read, with the overlap to strip after alignment.
#[derive(Debug, Clone)]
pub struct Band {
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    pub strip_front: u32,
    pub strip_back: u32,
}

/// Cut a read into overlapping bands.
///
/// The band width is forced to a multiple of four, as is the segment size,
/// which keeps the quarter-segment strip arithmetic exact.
pub fn make_bands(seq: &[u8], qual: &[u8], band_width: usize) -> Vec<Band> {
    let mut band_width = band_width;
    if band_width % 4 != 0 {
        band_width = band_width - band_width % 4 + 4;
    }
    debug_assert!(seq.len() > band_width);
    let mut div = 2;
    while seq.len() / div > band_width {
        div += 1;
    }
    let mut segment_size = seq.len() / div;
    if segment_size % 4 != 0 {
        segment_size = segment_size - segment_size % 4 + 4;
    }

    let quarter = segment_size / 4;
    let slice_qual = |lo: usize, hi: usize| -> Vec<u8> {
        if qual.is_empty() {
            Vec::new()
        } else {
            qual[lo.min(qual.len())..hi.min(qual.len())].to_vec()
        }
    };

    let mut bands: Vec<Band> = vec![
        Band {
            sequence: Vec::new(),
            quality: Vec::new(),
            strip_front: 0,
            strip_back: 0,
        };
        2 * div - 1
    ];
    for i in 0..div {
        let off = i * segment_size;
        let idx = 2 * i;
        if i + 1 == div {
            // the last band always gets a full segment against the true tail
            let last_off = seq.len() - segment_size.min(seq.len());
            let addl = off.saturating_sub(last_off);
            let start = if off > last_off { last_off } else { off };
            bands[idx] = Band {
                sequence: seq[start..].to_vec(),
                quality: slice_qual(start, seq.len()),
                strip_front: (quarter + addl) as u32,
                strip_back: 0,
            };
            if i == 0 {
                bands[idx].strip_front = 0;
            }
        } else {
            bands[idx] = Band {
                sequence: seq[off..off + segment_size].to_vec(),
                quality: slice_qual(off, off + segment_size),
                strip_front: if i == 0 { 0 } else { quarter as u32 },
                strip_back: quarter as u32,
            };
            // the half-shifted band between this primary and the next
            let mid = off + segment_size / 2;
            let end = (mid + segment_size).min(seq.len());
            let short_by = segment_size - (end - mid);
            bands[2 * i + 1] = Band {
                sequence: seq[mid..end].to_vec(),
                quality: slice_qual(mid, end),
                strip_front: quarter as u32,
                strip_back: quarter.saturating_sub(short_by) as u32,
            };
        }
    }
    bands
}

/// True when a band alignment's end can feed the next band's start: the
/// same cut on a node, or one edge away.
pub fn adjacent_positions(graph: &dyn GraphIndex, prev_end: GraphPos, next_start: GraphPos) -> bool {
    graph_distance(graph, prev_end, next_start, 2) == 0
}

/// Pick one alignment per band by DP over the per-band candidates.
///
/// Transitions between graph-adjacent band ends add their scores; a band
/// whose candidates do not connect inherits the best predecessor score, and
/// unmapped candidates chain through the unmapped predecessor so a gap in
/// the middle does not strand the traceback.
pub fn resolve_banded_multi(
    graph: &dyn GraphIndex,
    multi_alns: &[Vec<Alignment>],
) -> Vec<Alignment> {
    // (score, candidate index within band, parent candidate index)
    let mut scores: Vec<Vec<(i64, usize, usize)>> = Vec::with_capacity(multi_alns.len());
    scores.push(
        multi_alns[0]
            .iter()
            .enumerate()
            .map(|(k, aln)| (aln.score as i64, k, 0))
            .collect(),
    );
    for i in 1..multi_alns.len() {
        let prev_scores = scores[i - 1].clone();
        let mut best_prev = 0usize;
        let mut unmapped_prev = 0usize;
        for (j, t) in prev_scores.iter().enumerate() {
            if t.0 > prev_scores[best_prev].0 {
                best_prev = j;
            }
            if multi_alns[i - 1][t.1].score == 0 {
                unmapped_prev = j;
            }
        }
        let mut curr: Vec<(i64, usize, usize)> = Vec::with_capacity(multi_alns[i].len());
        for (k, aln) in multi_alns[i].iter().enumerate() {
            if !aln.is_mapped() {
                curr.push((prev_scores[best_prev].0, k, best_prev));
                continue;
            }
            let start = aln.first_position().unwrap();
            // best adjacent predecessor wins; ties break to the earlier one
            let mut chosen: Option<(i64, usize)> = None;
            for (j, t) in prev_scores.iter().enumerate() {
                let prev_aln = &multi_alns[i - 1][t.1];
                if !prev_aln.is_mapped() {
                    continue;
                }
                let prev_end = prev_aln.path.last().unwrap().end_position();
                if adjacent_positions(graph, prev_end, start)
                    && chosen.map(|(s, _)| t.0 > s).unwrap_or(true)
                {
                    chosen = Some((t.0, j));
                }
            }
            match chosen {
                Some((s, j)) => curr.push((s + aln.score as i64, k, j)),
                None => {
                    // nothing connects; chain through the best or, if the
                    // best is unmapped-adjacent, the unmapped predecessor
                    let fallback = if multi_alns[i - 1][prev_scores[best_prev].1].is_mapped() {
                        best_prev
                    } else {
                        unmapped_prev
                    };
                    curr.push((prev_scores[fallback].0, k, fallback));
                }
            }
        }
        scores.push(curr);
    }

    let last = scores.last().unwrap();
    let mut best_idx = 0usize;
    for (j, t) in last.iter().enumerate() {
        if t.0 > last[best_idx].0 {
            best_idx = j;
        }
    }
    let mut picked: Vec<Alignment> = vec![Alignment::new("", b"", b""); multi_alns.len()];
    let mut at = best_idx;
    for i in (0..multi_alns.len()).rev() {
        let (_, cand, parent) = scores[i][at];
        picked[i] = multi_alns[i][cand].clone();
        at = parent;
    }
    picked
}

/// Concatenate resolved band alignments into one alignment of the read.
pub fn merge_banded(
    pieces: &[Alignment],
    name: &str,
    seq: &[u8],
    qual: &[u8],
) -> Alignment {
    merge_alignments(pieces, name, seq, qual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::alignment::{Edit, Mapping};
    use crate::graph::MemoryGraph;

    #[test]
    fn band_layout_covers_the_read_exactly() {
        let seq: Vec<u8> = (0..400).map(|i| b"ACGT"[i % 4]).collect();
        let bands = make_bands(&seq, &[], 150);
        // div = 3 -> 5 bands
        assert_eq!(bands.len(), 5);
        // stripped spans tile the read exactly
        let mut covered = 0usize;
        for band in &bands {
            covered += band.sequence.len()
                - band.strip_front as usize
                - band.strip_back as usize;
        }
        assert_eq!(covered, seq.len());
        assert_eq!(bands[0].strip_front, 0);
        assert_eq!(bands.last().unwrap().strip_back, 0);
    }

    #[test]
    fn band_sizes_are_multiples_of_four() {
        let seq: Vec<u8> = (0..402).map(|i| b"ACGT"[i % 4]).collect();
        let bands = make_bands(&seq, &[], 149);
        for band in &bands[..bands.len() - 1] {
            assert_eq!(band.sequence.len() % 4, 0);
        }
    }

    fn mapped(node: u64, offset: u32, len: u32, score: i32) -> Alignment {
        let mut aln = Alignment::new("", &vec![b'A'; len as usize], b"");
        let mut m = Mapping::new(GraphPos::new(node, false, offset));
        m.edits.push(Edit::matching(len));
        aln.path.push(m);
        aln.score = score;
        aln
    }

    #[test]
    fn resolve_prefers_connected_chains() {
        let mut g = MemoryGraph::new();
        g.add_node(1, &[b'A'; 40]);
        g.add_path("ref", &[(1, false)]);
        // band 1 has a higher-scoring candidate that does not connect and a
        // lower-scoring one that does
        let band0 = vec![mapped(1, 0, 10, 10)];
        let band1 = vec![mapped(1, 25, 10, 12), mapped(1, 10, 10, 9)];
        let resolved = resolve_banded_multi(&g, &[band0, band1]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].first_position().unwrap().offset, 10);
    }

    #[test]
    fn resolve_survives_unmapped_bands() {
        let mut g = MemoryGraph::new();
        g.add_node(1, &[b'A'; 40]);
        g.add_path("ref", &[(1, false)]);
        let band0 = vec![mapped(1, 0, 10, 10)];
        let band1 = vec![Alignment::new("", &[b'A'; 10], b"")];
        let band2 = vec![mapped(1, 20, 10, 10)];
        let resolved = resolve_banded_multi(&g, &[band0, band1, band2]);
        assert!(!resolved[1].is_mapped());
        assert!(resolved[0].is_mapped());
        assert!(resolved[2].is_mapped());
    }
}
