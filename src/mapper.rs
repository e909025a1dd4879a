//! The mapper: orchestrates seeds, clusters, alignment, and ranking.
//!
//! A [`Mapper`] owns shared handles to the graph and FM-index oracles plus
//! per-worker state (caches and aligner instances). One mapping call owns
//! one worker; batch entry points clone workers per thread. The only shared
//! mutable state is the paired fragment model and the imperfect-pair retry
//! queue, both internally synchronized.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use log::debug;
use rayon::prelude::*;
use thiserror::Error;

use crate::align::aligners::{Aligner, AlignerCaps, QualAdjAligner};
use crate::align::alignment::Alignment;
use crate::align::banded::{make_bands, merge_banded, resolve_banded_multi};
use crate::align::cluster_align::{align_cluster, resolve_softclips};
use crate::align::patch::{mems_to_alignment, patch_alignment, score_alignment};
use crate::cache::WorkerCaches;
use crate::cluster::chain::{cluster_coverage, clusters_to_drop, ChainModel};
use crate::graph::GraphIndex;
use crate::index::fm::FmIndex;
use crate::map_opt::MapOpt;
use crate::mapq::{cluster_mapping_quality, compute_mapping_qualities};
use crate::paired::fragment::FragmentModel;
use crate::seed::mem::{Mem, MemFinder};

/// Construction-time failures.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("a graph index is required to map reads")]
    MissingGraph,
    #[error("an FM-index over the graph is required to query MEMs")]
    MissingIndex,
    #[error("invalid options: {0}")]
    BadOptions(String),
}

/// An input read.
#[derive(Debug, Clone, Default)]
pub struct Read {
    pub name: String,
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
}

impl Read {
    pub fn new(name: &str, sequence: &[u8]) -> Self {
        Read {
            name: name.to_string(),
            sequence: sequence.to_vec(),
            quality: Vec::new(),
        }
    }

    pub fn with_quality(name: &str, sequence: &[u8], quality: &[u8]) -> Self {
        Read {
            name: name.to_string(),
            sequence: sequence.to_vec(),
            quality: quality.to_vec(),
        }
    }
}

/// The shareable part of a mapper: everything except the per-worker caches.
#[derive(Clone)]
pub(crate) struct WorkerSeed {
    graph: Arc<dyn GraphIndex>,
    fm: Arc<dyn FmIndex>,
    opt: MapOpt,
    fragment_model: Arc<FragmentModel>,
    retry_queue: Arc<Mutex<Vec<(Read, Read)>>>,
    min_mem_length: usize,
    deadline: Option<std::time::Instant>,
}

impl WorkerSeed {
    pub(crate) fn make_worker(&self) -> Mapper {
        Mapper {
            aligner: Aligner::new(self.opt.scoring),
            qual_adj_aligner: QualAdjAligner::new(self.opt.scoring, self.opt.gc_content),
            graph: Arc::clone(&self.graph),
            fm: Arc::clone(&self.fm),
            opt: self.opt.clone(),
            caches: RefCell::new(WorkerCaches::default()),
            fragment_model: Arc::clone(&self.fragment_model),
            retry_queue: Arc::clone(&self.retry_queue),
            min_mem_length: self.min_mem_length,
            deadline: self.deadline,
        }
    }
}

/// Sequence-to-graph mapper over the MEM front-end.
pub struct Mapper {
    pub(crate) graph: Arc<dyn GraphIndex>,
    pub(crate) fm: Arc<dyn FmIndex>,
    pub opt: MapOpt,
    pub(crate) aligner: Aligner,
    pub(crate) qual_adj_aligner: QualAdjAligner,
    pub(crate) caches: RefCell<WorkerCaches>,
    pub(crate) fragment_model: Arc<FragmentModel>,
    pub(crate) retry_queue: Arc<Mutex<Vec<(Read, Read)>>>,
    pub(crate) min_mem_length: usize,
    /// Cooperative cancellation: checked at coarse stage boundaries.
    pub(crate) deadline: Option<std::time::Instant>,
}

impl Mapper {
    /// Build a mapper over shared graph and FM-index handles.
    pub fn new(
        graph: Arc<dyn GraphIndex>,
        fm: Arc<dyn FmIndex>,
        opt: MapOpt,
    ) -> Result<Self, MapperError> {
        if graph.node_count() == 0 {
            return Err(MapperError::MissingGraph);
        }
        if fm.size() == 0 {
            return Err(MapperError::MissingIndex);
        }
        let min_mem_length = opt.effective_min_mem_length(graph.total_sequence_length());
        if let Some(reseed) = opt.reseed_length {
            if min_mem_length > reseed {
                return Err(MapperError::BadOptions(
                    "minimum reseed length cannot be less than the minimum MEM length".into(),
                ));
            }
        }
        let fragment_model = Arc::new(FragmentModel::new(
            opt.fragment_length_cache_size,
            opt.fragment_length_estimate_interval,
            opt.fragment_sigma,
        ));
        Ok(Mapper {
            aligner: Aligner::new(opt.scoring),
            qual_adj_aligner: QualAdjAligner::new(opt.scoring, opt.gc_content),
            graph,
            fm,
            caches: RefCell::new(WorkerCaches::default()),
            fragment_model,
            retry_queue: Arc::new(Mutex::new(Vec::new())),
            min_mem_length,
            deadline: None,
            opt,
        })
    }

    /// Arm a cooperative deadline: once passed, mapping calls give up at
    /// their next stage boundary and report the read unmapped.
    pub fn set_deadline(&mut self, deadline: Option<std::time::Instant>) {
        self.deadline = deadline;
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.deadline
            .map(|d| std::time::Instant::now() > d)
            .unwrap_or(false)
    }

    /// A worker clone: shared oracles and model, fresh caches.
    pub fn worker(&self) -> Mapper {
        self.seed().make_worker()
    }

    /// The `Sync` portion of a mapper, from which parallel sections mint
    /// one worker per thread (the caches themselves are never shared).
    pub(crate) fn seed(&self) -> WorkerSeed {
        WorkerSeed {
            graph: Arc::clone(&self.graph),
            fm: Arc::clone(&self.fm),
            opt: self.opt.clone(),
            fragment_model: Arc::clone(&self.fragment_model),
            retry_queue: Arc::clone(&self.retry_queue),
            min_mem_length: self.min_mem_length,
            deadline: self.deadline,
        }
    }

    /// The aligner implementation for a read: quality-adjusted when a
    /// quality string is present and adjustment is enabled.
    pub(crate) fn caps(&self, quality: &[u8]) -> &dyn AlignerCaps {
        if self.opt.adjust_for_base_quality && !quality.is_empty() {
            &self.qual_adj_aligner
        } else {
            &self.aligner
        }
    }

    /// Find MEMs for a read at the current sensitivity.
    pub fn find_mems(&self, seq: &[u8], min_mem_length: usize) -> Vec<Mem> {
        let finder = MemFinder {
            fm: self.fm.as_ref(),
            graph: self.graph.as_ref(),
            min_mem_length,
            max_mem_length: self.opt.max_mem_length,
            reseed_length: self.opt.reseed_length,
            fast_reseed: self.opt.fast_reseed,
            hit_max: self.opt.hit_max,
        };
        finder.find_mems(seq)
    }

    /// Map a read, returning only the primary alignment.
    pub fn align(&self, read: &Read) -> Alignment {
        self.align_multi(read)
            .into_iter()
            .next()
            .unwrap_or_else(|| Alignment::unmapped(&read.name, &read.sequence, &read.quality))
    }

    /// Map a read into a ranked multi-alignment list.
    pub fn align_multi(&self, read: &Read) -> Vec<Alignment> {
        self.align_multi_internal(read, self.opt.extra_multimaps, true)
    }

    /// Map a batch of reads in parallel, one worker per thread.
    pub fn map_batch(&self, reads: &[Read]) -> Vec<Vec<Alignment>> {
        let seed = self.seed();
        reads
            .par_iter()
            .map_init(
                move || seed.make_worker(),
                |worker, read| worker.align_multi(read),
            )
            .collect()
    }

    /// Band width rounded the way the band layout rounds it; the banded
    /// trigger must agree with the layout or a band could re-enter banding.
    fn effective_band_width(&self) -> usize {
        let bw = self.opt.band_width;
        if bw % 4 != 0 {
            bw - bw % 4 + 4
        } else {
            bw
        }
    }

    pub(crate) fn align_multi_internal(
        &self,
        read: &Read,
        additional_multimaps: usize,
        compute_quality: bool,
    ) -> Vec<Alignment> {
        if read.sequence.len() > self.effective_band_width() {
            return vec![self.align_banded(read)];
        }
        // keep a runner-up around so MAPQ has something to compare against
        let additional = if additional_multimaps == 0
            && self.opt.max_multimaps == 1
            && self.opt.mapping_quality_method != crate::map_opt::MappingQualityMethod::None
        {
            1
        } else {
            additional_multimaps
        };

        let mut alignments: Vec<Alignment> = Vec::new();
        let mut cluster_mq = None;
        let mut min_mem_length = self.min_mem_length;
        for attempt in 0..self.opt.max_attempts.max(1) {
            if self.cancelled() {
                debug!("{}: cancelled before attempt {}", read.name, attempt);
                break;
            }
            if attempt > 0 {
                // local recovery: reseed with shorter matches
                min_mem_length = min_mem_length
                    .saturating_sub(self.opt.kmer_sensitivity_step)
                    .max(4);
                debug!(
                    "retrying {} with minimum MEM length {}",
                    read.name, min_mem_length
                );
            }
            let mems = self.find_mems(&read.sequence, min_mem_length);
            let (alns, mq) = self.align_mem_multi(read, &mems, additional);
            alignments = alns;
            cluster_mq = mq;
            if alignments.iter().any(|a| a.is_mapped()) {
                break;
            }
            if min_mem_length <= 4 {
                break;
            }
        }

        let mut alignments = self.score_sort_and_deduplicate(alignments, read);
        if compute_quality {
            compute_mapping_qualities(
                &mut alignments,
                self.opt.mapping_quality_method,
                self.opt.max_mapping_quality,
                if self.opt.use_cluster_mq { cluster_mq } else { None },
                self.opt.mq_overlap,
            );
            self.filter_and_process_multimaps(&mut alignments, 0);
        } else {
            self.filter_and_process_multimaps(&mut alignments, additional_multimaps);
        }
        for aln in alignments.iter_mut() {
            self.set_refpos(aln);
        }
        alignments
    }

    /// Chain MEM hits, align the surviving clusters, and collect candidates.
    pub(crate) fn align_mem_multi(
        &self,
        read: &Read,
        mems: &[Mem],
        additional_multimaps: usize,
    ) -> (Vec<Alignment>, Option<f64>) {
        let total_multimaps = self.opt.max_multimaps + additional_multimaps;
        let seq_len = read.sequence.len();
        let scoring = *self.caps(&read.quality).scoring();
        let graph = self.graph.as_ref();

        let usable: Vec<Mem> = mems
            .iter()
            .filter(|m| !m.nodes.is_empty())
            .cloned()
            .collect();
        if usable.is_empty() {
            return (Vec::new(), None);
        }

        let transition = |m1: &Mem, m2: &Mem| -> f64 {
            let p1 = m1.nodes[0];
            let p2 = m2.nodes[0];
            let uniqueness = 2.0 / (m1.match_count + m2.match_count).max(1) as f64;
            let unique_coverage =
                (m1.len() + m2.len() - m1.overlap_length(m2)) as f64;
            let approx_dist =
                (graph.approx_position(p2) - graph.approx_position(p1)).abs();
            if approx_dist >= seq_len as i64 {
                return f64::NEG_INFINITY;
            }
            if p1.is_reverse != p2.is_reverse {
                return f64::NEG_INFINITY; // no inversions inside a chain
            }
            let jump = (m2.begin as i64 - m1.begin as i64 - approx_dist).abs();
            let base = unique_coverage * scoring.match_score as f64 * uniqueness;
            if jump > 0 {
                base - (scoring.gap_open as f64 + jump as f64 * scoring.gap_extend as f64)
            } else {
                base
            }
        };

        let mut model = ChainModel::new(
            &[usable],
            graph,
            transition,
            seq_len as i64,
            self.opt.chain_position_depth,
            self.opt.chain_max_connections,
        );
        let clusters = model.traceback(total_multimaps, false);

        let cluster_mq = if self.opt.use_cluster_mq {
            Some(self.compute_cluster_mapping_quality(&clusters, seq_len))
        } else {
            None
        };

        let to_drop = clusters_to_drop(&clusters, self.opt.drop_chain);
        let mut alns: Vec<Alignment> = Vec::new();
        let mut multimaps = 0usize;
        for (i, cluster) in clusters.iter().enumerate() {
            if to_drop.contains(&i) {
                continue;
            }
            if cluster.len() < self.opt.cluster_min {
                continue;
            }
            multimaps += 1;
            if multimaps > total_multimaps.max(self.opt.max_attempts) {
                break;
            }
            if let Some(min_len) = self.opt.min_cluster_length {
                if cluster_coverage(cluster) < min_len && alns.len() > 1 {
                    continue;
                }
            }
            let candidate = self.align_cluster_full(read, cluster);
            if candidate.identity > self.opt.min_identity {
                alns.push(candidate);
            }
        }
        (alns, cluster_mq)
    }

    /// Align one cluster: subgraph DP with soft-clip resolution, falling
    /// back to a patched MEM skeleton when the DP cannot place the read.
    pub(crate) fn align_cluster_full(&self, read: &Read, cluster: &[Mem]) -> Alignment {
        if self.cancelled() {
            return Alignment::unmapped(&read.name, &read.sequence, &read.quality);
        }
        let caps = self.caps(&read.quality);
        let graph = self.graph.as_ref();
        let mut caches = self.caches.borrow_mut();

        let (mut best, mut sub) = align_cluster(
            graph,
            &mut caches,
            caps,
            &read.sequence,
            &read.quality,
            cluster,
            self.opt.max_target_factor,
        );

        if best.is_mapped() {
            resolve_softclips(
                graph,
                caps,
                &mut best,
                &mut sub,
                self.opt.softclip_threshold,
                self.opt.max_softclip_iterations,
                self.opt.context_depth,
            );
        } else {
            // DP failure: build the exact-walk skeleton from the chain
            best = mems_to_alignment(graph, &read.sequence, &read.quality, cluster);
        }

        // fill unaligned stretches between anchors
        let has_internal_gap = best.path.iter().enumerate().any(|(i, m)| {
            m.edits.iter().enumerate().any(|(j, e)| {
                e.is_insertion()
                    && e.to_len as usize <= self.opt.max_thread_gap as usize
                    && !(i == 0 && j == 0)
                    && !(i + 1 == best.path.len() && j + 1 == m.edits.len())
            })
        }) || (best.softclip_start() > 0 || best.softclip_end() > 0);
        if best.is_mapped() || !best.path.is_empty() {
            if has_internal_gap {
                best = patch_alignment(graph, &mut caches, caps, &best);
            } else {
                best.score = score_alignment(graph, caps, &best);
            }
        }

        best.name = read.name.clone();
        best.sequence = read.sequence.clone();
        best.quality = read.quality.clone();
        best.identity = best.compute_identity();
        best
    }

    /// Cluster-level mapping quality from per-cluster coverage weights.
    fn compute_cluster_mapping_quality(&self, clusters: &[Vec<Mem>], read_len: usize) -> f64 {
        if clusters.is_empty() || read_len == 0 {
            return 0.0;
        }
        let mut weights: Vec<f64> = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let mut weight = 0.0;
            for (i, mem) in cluster.iter().enumerate() {
                let mut shared = 0usize;
                if i > 0 {
                    shared += cluster[i - 1].overlap_length(mem);
                }
                if i + 1 < cluster.len() {
                    shared += mem.overlap_length(&cluster[i + 1]);
                }
                weight += ((mem.len() as f64 - shared as f64 / 2.0) / read_len as f64)
                    / mem.match_count.max(1) as f64;
            }
            weights.push(weight);
        }
        cluster_mapping_quality(&weights, self.opt.max_cluster_mapping_quality)
    }

    /// Band a long read: align the bands, resolve one alignment per band,
    /// and merge.
    pub(crate) fn align_banded(&self, read: &Read) -> Alignment {
        let bands = make_bands(&read.sequence, &read.quality, self.opt.band_width);
        let seed = self.seed();
        let multi: Vec<Vec<Alignment>> = bands
            .par_iter()
            .map_init(
                move || seed.make_worker(),
                |worker, band| {
                    let band_read = Read {
                        name: read.name.clone(),
                        sequence: band.sequence.clone(),
                        quality: band.quality.clone(),
                    };
                    let mut candidates = if worker.opt.max_multimaps > 1 {
                        worker.align_multi_internal(&band_read, worker.opt.extra_multimaps, false)
                    } else {
                        vec![worker
                            .align_multi_internal(&band_read, 0, false)
                            .into_iter()
                            .next()
                            .unwrap_or_else(|| {
                                Alignment::unmapped(
                                    &band_read.name,
                                    &band_read.sequence,
                                    &band_read.quality,
                                )
                            })]
                    };
                    // always keep an unmapped fallback in play
                    candidates.push(Alignment::unmapped(
                        &band_read.name,
                        &band_read.sequence,
                        &band_read.quality,
                    ));
                    for aln in candidates.iter_mut() {
                        if aln.identity < worker.opt.min_identity {
                            aln.clear_alignment();
                        }
                        *aln = crate::align::alignment::strip_from_start(aln, band.strip_front);
                        *aln = crate::align::alignment::strip_from_end(aln, band.strip_back);
                    }
                    candidates
                },
            )
            .collect();

        let resolved = resolve_banded_multi(self.graph.as_ref(), &multi);
        let mut merged = merge_banded(&resolved, &read.name, &read.sequence, &read.quality);
        let caps = self.caps(&read.quality);
        merged.score = score_alignment(self.graph.as_ref(), caps, &merged);
        merged.identity = merged.compute_identity();
        self.set_refpos(&mut merged);
        if log::log_enabled!(log::Level::Debug) {
            for mapping in &merged.path {
                debug_assert!(
                    mapping.pos.offset + mapping.from_length()
                        <= self.graph.node_length(mapping.pos.node)
                );
            }
        }
        merged
    }

    /// Sort by score (ties broken toward denser edit structure, as the
    /// richer candidate carries more signal), then drop exact duplicates by
    /// score and start position.
    pub(crate) fn score_sort_and_deduplicate(
        &self,
        mut alns: Vec<Alignment>,
        read: &Read,
    ) -> Vec<Alignment> {
        if alns.is_empty() {
            alns.push(Alignment::unmapped(&read.name, &read.sequence, &read.quality));
            return alns;
        }
        alns.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.edit_count().cmp(&a.edit_count()))
        });
        alns.dedup_by(|a, b| {
            a.score == b.score && (a.score == 0 || a.first_position() == b.first_position())
        });
        alns
    }

    /// Cut the list to the requested multimaps and flag secondaries.
    pub(crate) fn filter_and_process_multimaps(
        &self,
        alns: &mut Vec<Alignment>,
        additional_multimaps: usize,
    ) {
        let total = self.opt.max_multimaps + additional_multimaps;
        alns.truncate(total.max(1));
        for (i, aln) in alns.iter_mut().enumerate() {
            aln.is_secondary = i > 0;
        }
    }

    /// Annotate an alignment with its projection onto a reference path.
    pub(crate) fn set_refpos(&self, aln: &mut Alignment) {
        aln.refpos = None;
        if let Some(pos) = aln.first_position() {
            let mut caches = self.caches.borrow_mut();
            let paths =
                caches.positions_in_paths(self.graph.as_ref(), pos.node, pos.is_reverse);
            if let Some((name, offsets)) = paths.into_iter().next() {
                if let Some(&off) = offsets.first() {
                    aln.refpos = Some((name, off + pos.offset as i64));
                }
            }
        }
    }

    /// Approximate linear position of an alignment's start.
    pub(crate) fn approx_alignment_position(&self, aln: &Alignment) -> i64 {
        let pos = match aln.first_position() {
            Some(p) => p,
            None => return -1,
        };
        let mut caches = self.caches.borrow_mut();
        let start = caches.node_start(self.graph.as_ref(), pos.node);
        let len = caches.node_length(self.graph.as_ref(), pos.node) as i64;
        if pos.is_reverse {
            start + len - pos.offset as i64
        } else {
            start + pos.offset as i64
        }
    }

    /// Signed approximate fragment length between two mates.
    pub(crate) fn approx_fragment_length(&self, aln1: &Alignment, aln2: &Alignment) -> i64 {
        let p1 = self.approx_alignment_position(aln1);
        let p2 = self.approx_alignment_position(aln2);
        if p1 < 0 || p2 < 0 {
            return i64::MAX;
        }
        p2 - p1
    }
}
