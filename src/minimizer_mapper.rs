//! The minimizer front-end: seed, cluster, gapless-extend, tail-align.
//!
//! An alternative to the MEM pipeline for short reads: minimizer seeds are
//! clustered by graph distance, clusters are extended gaplessly, and only
//! the read ends left uncovered see dynamic programming. Every stage picks
//! its survivors through the same threshold protocol so the coverage,
//! extension-set, and alignment-count cutoffs stay independent.

use std::sync::Arc;

use log::debug;

use crate::align::aligners::{Aligner, AlignerCaps, QualAdjAligner};
use crate::align::alignment::Alignment;
use crate::cluster::distance::cluster_seeds;
use crate::extend::gapless::{estimate_extension_set_score, GaplessExtender, GaplessExtension};
use crate::extend::tail::align_tails;
use crate::graph::{GraphIndex, GraphPos};
use crate::index::minimizers::MinimizerIndex;
use crate::map_opt::{MapOpt, MappingQualityMethod};
use crate::mapper::{MapperError, Read};
use crate::mapq::{maximum_mapping_quality, maximum_mapping_quality_exact};
use crate::multimap::process_until_threshold;
use crate::seed::minimizer_seeds::find_minimizer_seeds;

/// Minimizer-based mapper.
pub struct MinimizerMapper {
    graph: Arc<dyn GraphIndex>,
    minimizer_index: Arc<dyn MinimizerIndex>,
    pub opt: MapOpt,
    aligner: Aligner,
    qual_adj_aligner: QualAdjAligner,
}

impl MinimizerMapper {
    pub fn new(
        graph: Arc<dyn GraphIndex>,
        minimizer_index: Arc<dyn MinimizerIndex>,
        opt: MapOpt,
    ) -> Result<Self, MapperError> {
        if graph.node_count() == 0 {
            return Err(MapperError::MissingGraph);
        }
        Ok(MinimizerMapper {
            graph,
            minimizer_index,
            aligner: Aligner::new(opt.scoring),
            qual_adj_aligner: QualAdjAligner::new(opt.scoring, opt.gc_content),
            opt,
        })
    }

    fn caps(&self, quality: &[u8]) -> &dyn AlignerCaps {
        if self.opt.adjust_for_base_quality && !quality.is_empty() {
            &self.qual_adj_aligner
        } else {
            &self.aligner
        }
    }

    /// Map one read into ranked alignments.
    pub fn map(&self, read: &Read) -> Vec<Alignment> {
        let seq = &read.sequence;
        let graph = self.graph.as_ref();

        // seed
        let selection = find_minimizer_seeds(
            self.minimizer_index.as_ref(),
            graph,
            seq,
            self.opt.hit_cap,
            self.opt.hard_hit_cap,
            self.opt.minimizer_score_fraction,
        );
        if selection.seeds.is_empty() {
            debug!("{}: no seeds", read.name);
            return vec![Alignment::unmapped(&read.name, seq, &read.quality)];
        }

        // cluster by graph distance
        let clusters = cluster_seeds(graph, &selection.seeds, self.opt.distance_limit);
        let k = self.minimizer_index.k();
        let cluster_scores: Vec<f64> = clusters
            .iter()
            .map(|c| selection.cluster_score(c))
            .collect();
        let coverage: Vec<f64> = clusters
            .iter()
            .map(|c| selection.read_coverage(c, seq.len(), k))
            .collect();
        let score_cutoff = self
            .opt
            .cluster_score_threshold
            .map(|t| cluster_scores.iter().cloned().fold(0.0, f64::max) - t);

        // extend the best-covered clusters
        let extender = GaplessExtender {
            graph,
            scoring: self.opt.scoring,
            mismatch_limit: self.opt.extension_mismatch_limit,
        };
        let mut cluster_extensions: Vec<Vec<GaplessExtension>> = Vec::new();
        process_until_threshold(
            clusters.len(),
            |i| coverage[i],
            self.opt.cluster_coverage_threshold,
            1,
            self.opt.max_extensions,
            |i| {
                if let Some(cutoff) = score_cutoff {
                    if cluster_scores[i] < cutoff {
                        return false;
                    }
                }
                let matchings: Vec<(GraphPos, u32)> = clusters[i]
                    .iter()
                    .map(|&si| {
                        let s = &selection.seeds[si];
                        (s.pos, s.read_offset)
                    })
                    .collect();
                let extensions = extender.extend(&matchings, seq);
                if extensions.is_empty() {
                    return false;
                }
                cluster_extensions.push(extensions);
                true
            },
            |_| {},
            |_| {},
        );

        // estimate and align
        let estimates: Vec<i32> = cluster_extensions
            .iter()
            .map(|exts| estimate_extension_set_score(exts, seq, &self.opt.scoring))
            .collect();
        let caps = self.caps(&read.quality);
        let mut alignments: Vec<Alignment> = Vec::new();
        process_until_threshold(
            cluster_extensions.len(),
            |i| estimates[i] as f64,
            self.opt.extension_set_score_threshold,
            2,
            self.opt.max_alignments,
            |i| {
                let extensions = &cluster_extensions[i];
                let mut out;
                if extensions.len() == 1 && extensions[0].full(seq.len()) {
                    // exact score known; no DP needed
                    out = extensions[0].to_alignment(seq, &read.quality);
                } else {
                    out = align_tails(
                        seq,
                        &read.quality,
                        extensions,
                        graph,
                        caps,
                        self.opt.extension_score_threshold,
                        self.opt.max_local_extensions,
                    );
                }
                out.name = read.name.clone();
                alignments.push(out);
                true
            },
            |_| {},
            |_| {},
        );

        if alignments.is_empty() {
            alignments.push(Alignment::unmapped(&read.name, seq, &read.quality));
        }

        // winner selection and MAPQ
        alignments.sort_by(|a, b| b.score.cmp(&a.score));
        let scores: Vec<f64> = alignments.iter().map(|a| a.score as f64).collect();
        let mut mappings: Vec<Alignment> = Vec::new();
        process_until_threshold(
            alignments.len(),
            |i| scores[i],
            None,
            1,
            self.opt.max_multimaps,
            |i| {
                mappings.push(alignments[i].clone());
                true
            },
            |_| {},
            |_| {},
        );

        let mapq = if mappings.is_empty() || !mappings[0].is_mapped() {
            0.0
        } else {
            match self.opt.mapping_quality_method {
                MappingQualityMethod::None => 0.0,
                MappingQualityMethod::Approx => maximum_mapping_quality(&scores),
                MappingQualityMethod::Exact => maximum_mapping_quality_exact(&scores),
            }
        };
        if let Some(primary) = mappings.first_mut() {
            primary.mapq = mapq
                .clamp(0.0, self.opt.max_mapping_quality as f64)
                .round() as u8;
        }
        for (i, aln) in mappings.iter_mut().enumerate() {
            aln.is_secondary = i > 0;
        }
        mappings
    }
}
