//! The alignment data model: edits, mappings, and whole-read alignments.
//!
//! An [`Alignment`] is a walk through the graph annotated with edit
//! operations against the read. Unmapped reads are represented by an
//! alignment with an empty path, score 0, and identity 0 so that sequence
//! and quality are always preserved through the pipeline.

use crate::graph::{GraphIndex, GraphPos};
use crate::utils::revcomp;

/// A single edit operation.
///
/// Match: `from_len == to_len`, no replacement. Mismatch: equal lengths with
/// a replacement. Insertion (including soft clips at the path ends):
/// `from_len == 0` with a replacement. Deletion: `to_len == 0`, no
/// replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub from_len: u32,
    pub to_len: u32,
    pub replacement: Option<Vec<u8>>,
}

impl Edit {
    pub fn matching(len: u32) -> Self {
        Edit {
            from_len: len,
            to_len: len,
            replacement: None,
        }
    }

    pub fn substitution(seq: Vec<u8>) -> Self {
        let len = seq.len() as u32;
        Edit {
            from_len: len,
            to_len: len,
            replacement: Some(seq),
        }
    }

    pub fn insertion(seq: Vec<u8>) -> Self {
        Edit {
            from_len: 0,
            to_len: seq.len() as u32,
            replacement: Some(seq),
        }
    }

    pub fn deletion(len: u32) -> Self {
        Edit {
            from_len: len,
            to_len: 0,
            replacement: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.from_len == self.to_len && self.replacement.is_none()
    }

    pub fn is_substitution(&self) -> bool {
        self.from_len == self.to_len && self.from_len > 0 && self.replacement.is_some()
    }

    pub fn is_insertion(&self) -> bool {
        self.from_len == 0 && self.to_len > 0
    }

    pub fn is_deletion(&self) -> bool {
        self.to_len == 0 && self.from_len > 0
    }
}

/// Edits applied at one graph position.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub pos: GraphPos,
    pub edits: Vec<Edit>,
}

impl Mapping {
    pub fn new(pos: GraphPos) -> Self {
        Mapping {
            pos,
            edits: Vec::new(),
        }
    }

    /// Graph bases consumed by this mapping.
    pub fn from_length(&self) -> u32 {
        self.edits.iter().map(|e| e.from_len).sum()
    }

    /// Read bases consumed by this mapping.
    pub fn to_length(&self) -> u32 {
        self.edits.iter().map(|e| e.to_len).sum()
    }

    /// Position just past the graph bases of this mapping.
    pub fn end_position(&self) -> GraphPos {
        GraphPos {
            node: self.pos.node,
            is_reverse: self.pos.is_reverse,
            offset: self.pos.offset + self.from_length(),
        }
    }
}

/// A read aligned (or failed to align) to the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub name: String,
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
    pub path: Vec<Mapping>,
    pub score: i32,
    pub identity: f64,
    pub mapq: u8,
    pub is_secondary: bool,
    /// Reference path projection of the primary position, when known.
    pub refpos: Option<(String, i64)>,
    /// Observed fragment lengths for paired reads, signed.
    pub fragment_lengths: Vec<i64>,
}

impl Alignment {
    pub fn new(name: &str, sequence: &[u8], quality: &[u8]) -> Self {
        Alignment {
            name: name.to_string(),
            sequence: sequence.to_vec(),
            quality: quality.to_vec(),
            path: Vec::new(),
            score: 0,
            identity: 0.0,
            mapq: 0,
            is_secondary: false,
            refpos: None,
            fragment_lengths: Vec::new(),
        }
    }

    /// The unmapped rendition of this read.
    pub fn unmapped(name: &str, sequence: &[u8], quality: &[u8]) -> Self {
        Alignment::new(name, sequence, quality)
    }

    /// Strip the path and scores, keeping read identity.
    pub fn clear_alignment(&mut self) {
        self.path.clear();
        self.score = 0;
        self.identity = 0.0;
        self.mapq = 0;
        self.refpos = None;
    }

    pub fn is_mapped(&self) -> bool {
        !self.path.is_empty() && self.score > 0
    }

    pub fn from_length(&self) -> u32 {
        self.path.iter().map(|m| m.from_length()).sum()
    }

    pub fn to_length(&self) -> u32 {
        self.path.iter().map(|m| m.to_length()).sum()
    }

    pub fn first_position(&self) -> Option<GraphPos> {
        self.path.first().map(|m| m.pos)
    }

    pub fn edit_count(&self) -> usize {
        self.path.iter().map(|m| m.edits.len()).sum()
    }

    /// Length of the leading soft clip (insertion at the very start).
    pub fn softclip_start(&self) -> u32 {
        self.path
            .first()
            .and_then(|m| m.edits.first())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .unwrap_or(0)
    }

    /// Length of the trailing soft clip.
    pub fn softclip_end(&self) -> u32 {
        self.path
            .last()
            .and_then(|m| m.edits.last())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .unwrap_or(0)
    }

    /// Fraction of read bases sitting in match edits.
    pub fn compute_identity(&self) -> f64 {
        let mut matches: u64 = 0;
        let mut total: u64 = 0;
        for m in &self.path {
            for e in &m.edits {
                total += e.to_len as u64;
                if e.is_match() {
                    matches += e.to_len as u64;
                }
            }
        }
        if self.sequence.is_empty() {
            return 0.0;
        }
        let denom = total.max(self.sequence.len() as u64);
        matches as f64 / denom as f64
    }

    /// Read interval covered by non-clip alignment, `[start, end)`.
    pub fn query_bounds(&self) -> (u32, u32) {
        let start = self.softclip_start();
        let end = self.sequence.len() as u32 - self.softclip_end();
        (start, end.max(start))
    }
}

/// Number of overlapping read bases between the aligned intervals of two
/// alignments of the same read.
pub fn query_overlap(a: &Alignment, b: &Alignment) -> u32 {
    let (a_start, a_end) = a.query_bounds();
    let (b_start, b_end) = b.query_bounds();
    let lo = a_start.max(b_start);
    let hi = a_end.min(b_end);
    hi.saturating_sub(lo)
}

/// Append `edit` to a mapping, coalescing adjacent matches.
pub fn push_edit(mapping: &mut Mapping, edit: Edit) {
    if let Some(last) = mapping.edits.last_mut() {
        if last.is_match() && edit.is_match() {
            last.from_len += edit.from_len;
            last.to_len += edit.to_len;
            return;
        }
    }
    mapping.edits.push(edit);
}

/// Append the mappings of `tail` onto `path`, merging when the next mapping
/// continues on the same node at a nonzero offset.
pub fn append_path(path: &mut Vec<Mapping>, tail: Vec<Mapping>) {
    for mapping in tail {
        let merge = mapping.pos.offset != 0
            && path
                .last()
                .map(|prev| {
                    prev.pos.node == mapping.pos.node
                        && prev.pos.is_reverse == mapping.pos.is_reverse
                        && prev.end_position().offset == mapping.pos.offset
                })
                .unwrap_or(false);
        if merge {
            let prev = path.last_mut().unwrap();
            for edit in mapping.edits {
                push_edit(prev, edit);
            }
        } else {
            path.push(mapping);
        }
    }
}

/// Remove `strip` read bases from the start of an alignment.
///
/// Mapping positions advance past any graph bases the stripped edits
/// consumed; mappings emptied entirely are dropped.
pub fn strip_from_start(aln: &Alignment, strip: u32) -> Alignment {
    if strip == 0 {
        return aln.clone();
    }
    let mut out = aln.clone();
    out.sequence = aln.sequence[strip as usize..].to_vec();
    if !aln.quality.is_empty() {
        out.quality = aln.quality[strip as usize..].to_vec();
    }
    out.path.clear();
    let mut remaining = strip;
    for mapping in &aln.path {
        if remaining == 0 {
            out.path.push(mapping.clone());
            continue;
        }
        let mut new_mapping = Mapping::new(mapping.pos);
        for edit in &mapping.edits {
            if remaining == 0 {
                new_mapping.edits.push(edit.clone());
                continue;
            }
            if edit.to_len <= remaining && edit.to_len > 0 {
                remaining -= edit.to_len;
                new_mapping.pos.offset += edit.from_len;
            } else if edit.to_len == 0 {
                // deletion before the strip point moves the position too
                new_mapping.pos.offset += edit.from_len;
            } else {
                // split the edit
                let keep_to = edit.to_len - remaining;
                let consumed_from = if edit.is_match() || edit.is_substitution() {
                    remaining
                } else {
                    0
                };
                new_mapping.pos.offset += consumed_from;
                let replacement = edit
                    .replacement
                    .as_ref()
                    .map(|r| r[remaining as usize..].to_vec());
                new_mapping.edits.push(Edit {
                    from_len: edit.from_len - consumed_from,
                    to_len: keep_to,
                    replacement,
                });
                remaining = 0;
            }
        }
        if !new_mapping.edits.is_empty() {
            out.path.push(new_mapping);
        }
    }
    out.identity = out.compute_identity();
    out
}

/// Remove `strip` read bases from the end of an alignment.
pub fn strip_from_end(aln: &Alignment, strip: u32) -> Alignment {
    if strip == 0 {
        return aln.clone();
    }
    let keep = aln.sequence.len() as u32 - strip;
    let mut out = aln.clone();
    out.sequence = aln.sequence[..keep as usize].to_vec();
    if !aln.quality.is_empty() {
        out.quality = aln.quality[..keep as usize].to_vec();
    }
    out.path.clear();
    let mut taken = 0u32;
    'outer: for mapping in &aln.path {
        let mut new_mapping = Mapping::new(mapping.pos);
        for edit in &mapping.edits {
            if taken + edit.to_len <= keep {
                taken += edit.to_len;
                new_mapping.edits.push(edit.clone());
                if taken == keep && edit.to_len > 0 {
                    if !new_mapping.edits.is_empty() {
                        out.path.push(new_mapping);
                    }
                    break 'outer;
                }
            } else {
                let keep_to = keep - taken;
                if keep_to > 0 {
                    let keep_from = if edit.is_match() || edit.is_substitution() {
                        keep_to
                    } else {
                        0
                    };
                    let replacement = edit
                        .replacement
                        .as_ref()
                        .map(|r| r[..keep_to as usize].to_vec());
                    new_mapping.edits.push(Edit {
                        from_len: keep_from,
                        to_len: keep_to,
                        replacement,
                    });
                }
                taken = keep;
                if !new_mapping.edits.is_empty() {
                    out.path.push(new_mapping);
                }
                break 'outer;
            }
        }
        if !new_mapping.edits.is_empty() {
            out.path.push(new_mapping);
        }
    }
    out.identity = out.compute_identity();
    out
}

/// The same alignment expressed against the reverse complement of the read.
pub fn reverse_complement_alignment(
    aln: &Alignment,
    node_length: &dyn Fn(u64) -> u32,
) -> Alignment {
    let mut out = aln.clone();
    out.sequence = revcomp(&aln.sequence);
    if !aln.quality.is_empty() {
        out.quality = aln.quality.iter().rev().copied().collect();
    }
    out.path.clear();
    for mapping in aln.path.iter().rev() {
        let len = node_length(mapping.pos.node);
        let end = mapping.pos.offset + mapping.from_length();
        let pos = GraphPos {
            node: mapping.pos.node,
            is_reverse: !mapping.pos.is_reverse,
            offset: len - end,
        };
        let mut new_mapping = Mapping::new(pos);
        for edit in mapping.edits.iter().rev() {
            new_mapping.edits.push(Edit {
                from_len: edit.from_len,
                to_len: edit.to_len,
                replacement: edit.replacement.as_ref().map(|r| revcomp(r)),
            });
        }
        out.path.push(new_mapping);
    }
    out
}

/// Merge per-band alignments of consecutive sub-reads into one alignment of
/// the full read. Unmapped bands contribute their sequence as insertions.
pub fn merge_alignments(pieces: &[Alignment], name: &str, sequence: &[u8], quality: &[u8]) -> Alignment {
    let mut out = Alignment::new(name, sequence, quality);
    let mut pending_insert: Vec<u8> = Vec::new();
    for piece in pieces {
        if piece.path.is_empty() {
            pending_insert.extend_from_slice(&piece.sequence);
            continue;
        }
        let mut path = piece.path.clone();
        if !pending_insert.is_empty() {
            let seq = std::mem::take(&mut pending_insert);
            if let Some(last) = out.path.last_mut() {
                push_edit(last, Edit::insertion(seq));
            } else if let Some(first) = path.first_mut() {
                first.edits.insert(0, Edit::insertion(seq));
            }
        }
        append_path(&mut out.path, path);
    }
    if !pending_insert.is_empty() {
        if let Some(last) = out.path.last_mut() {
            push_edit(last, Edit::insertion(pending_insert));
        }
        // a fully unmapped merge stays unmapped
    }
    out.identity = out.compute_identity();
    out
}

/// Verify that an alignment's match edits spell the graph, and that no
/// mapping overruns its node. Used behind debug logging and in tests.
pub fn check_alignment(graph: &dyn GraphIndex, aln: &Alignment) -> bool {
    let mut read_at: usize = 0;
    for mapping in &aln.path {
        let node_len = graph.node_length(mapping.pos.node);
        if mapping.pos.offset + mapping.from_length() > node_len {
            return false;
        }
        let mut pos = mapping.pos;
        for edit in &mapping.edits {
            if edit.is_match() {
                for i in 0..edit.to_len {
                    let here = GraphPos {
                        offset: pos.offset + i,
                        ..pos
                    };
                    match graph.position_char(here) {
                        Some(c)
                            if c.to_ascii_uppercase()
                                == aln.sequence[read_at + i as usize].to_ascii_uppercase() => {}
                        _ => return false,
                    }
                }
            }
            pos.offset += edit.from_len;
            read_at += edit.to_len as usize;
        }
    }
    read_at <= aln.sequence.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn simple_alignment() -> Alignment {
        let mut aln = Alignment::new("read", b"ACGTACGT", b"");
        let mut mapping = Mapping::new(GraphPos::new(1, false, 0));
        mapping.edits.push(Edit::matching(8));
        aln.path.push(mapping);
        aln.score = 8;
        aln.identity = 1.0;
        aln
    }

    #[test]
    fn edit_classification() {
        assert!(Edit::matching(3).is_match());
        assert!(Edit::substitution(b"A".to_vec()).is_substitution());
        assert!(Edit::insertion(b"GG".to_vec()).is_insertion());
        assert!(Edit::deletion(2).is_deletion());
    }

    #[test]
    fn strip_start_advances_position() {
        let aln = simple_alignment();
        let stripped = strip_from_start(&aln, 3);
        assert_eq!(stripped.sequence, b"TACGT");
        assert_eq!(stripped.path[0].pos.offset, 3);
        assert_eq!(stripped.path[0].edits[0], Edit::matching(5));
    }

    #[test]
    fn strip_end_truncates_edits() {
        let aln = simple_alignment();
        let stripped = strip_from_end(&aln, 2);
        assert_eq!(stripped.sequence, b"ACGTAC");
        assert_eq!(stripped.path[0].edits[0], Edit::matching(6));
        assert_eq!(stripped.path[0].pos.offset, 0);
    }

    #[test]
    fn revcomp_alignment_round_trips() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTACGT");
        let aln = simple_alignment();
        let node_len = |id: u64| g.node_length(id);
        let rc = reverse_complement_alignment(&aln, &node_len);
        assert_eq!(rc.sequence, revcomp(&aln.sequence));
        assert!(rc.path[0].pos.is_reverse);
        let back = reverse_complement_alignment(&rc, &node_len);
        assert_eq!(back.sequence, aln.sequence);
        assert_eq!(back.path, aln.path);
    }

    #[test]
    fn merged_unmapped_band_becomes_insertion() {
        let mut left = Alignment::new("read", b"ACGT", b"");
        let mut m = Mapping::new(GraphPos::new(1, false, 0));
        m.edits.push(Edit::matching(4));
        left.path.push(m);
        let middle = Alignment::new("read", b"TTTT", b"");
        let mut right = Alignment::new("read", b"ACGT", b"");
        let mut m = Mapping::new(GraphPos::new(2, false, 0));
        m.edits.push(Edit::matching(4));
        right.path.push(m);

        let merged = merge_alignments(
            &[left, middle, right],
            "read",
            b"ACGTTTTTACGT",
            b"",
        );
        assert_eq!(merged.path.len(), 2);
        assert!(merged.path[0].edits.iter().any(|e| e.is_insertion()));
        assert_eq!(merged.to_length(), 12);
    }

    #[test]
    fn check_alignment_validates_matches() {
        let mut g = MemoryGraph::new();
        g.add_node(1, b"ACGTACGT");
        let aln = simple_alignment();
        assert!(check_alignment(&g, &aln));
        let mut bad = aln.clone();
        bad.sequence = b"ACGTACGA".to_vec();
        assert!(!check_alignment(&g, &bad));
    }

    #[test]
    fn softclips_and_bounds() {
        let mut aln = Alignment::new("read", b"AAACGTACGTTT", b"");
        let mut mapping = Mapping::new(GraphPos::new(1, false, 0));
        mapping.edits.push(Edit::insertion(b"AAA".to_vec()));
        mapping.edits.push(Edit::matching(7));
        mapping.edits.push(Edit::insertion(b"TT".to_vec()));
        aln.path.push(mapping);
        assert_eq!(aln.softclip_start(), 3);
        assert_eq!(aln.softclip_end(), 2);
        assert_eq!(aln.query_bounds(), (3, 10));
    }
}
