//! Mapper configuration.
//!
//! One options struct covers every knob the core recognizes, grouped the way
//! the pipeline consumes them. Cutoffs that the source treated as
//! "0 means disabled" are `Option` fields here.

use crate::align::aligners::Scoring;

/// How mapping quality is estimated from the candidate score set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingQualityMethod {
    None,
    Approx,
    Exact,
}

/// Which paired-end resolution strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    /// One chain model over both mates; cross-fragment edges carry the
    /// fragment-length likelihood.
    Simultaneous,
    /// Multi-map each mate independently and cross the candidates.
    Combinatorial,
    /// Map independently; rescue an unmapped mate from its partner.
    Separated,
}

/// Alignment options for the seed-cluster-extend-align core.
#[derive(Debug, Clone)]
pub struct MapOpt {
    // Seeding
    pub min_mem_length: usize, // Minimum MEM length; 0 derives one from graph size
    pub max_mem_length: Option<usize>, // Cap on MEM length; None leaves the index order as the cap
    pub reseed_length: Option<usize>, // Reseed MEMs at least this long; None disables reseeding
    pub fast_reseed: bool,     // Use the probe/binary-search sub-MEM algorithm
    pub hit_max: Option<u32>,  // Skip locating MEMs with more hits than this
    pub hit_cap: u32,          // Minimizer hits always kept
    pub hard_hit_cap: u32,     // Minimizer hits never kept above this
    pub minimizer_score_fraction: f64, // Fraction of total minimizer score to retain

    // Clustering
    pub distance_limit: i64,   // Seed clustering distance bound (minimizer path)
    pub cluster_min: usize,    // Minimum seeds for a cluster to be aligned
    pub min_cluster_length: Option<usize>, // Coverage floor once two alignments exist
    pub cluster_coverage_threshold: Option<f64>, // Read-coverage gap for cluster selection
    pub cluster_score_threshold: Option<f64>, // Score gap for cluster selection
    pub drop_chain: f64,       // Drop overlapped chains below this coverage ratio
    pub max_cluster_mapping_quality: f64, // Cap for cluster mapping quality
    pub use_cluster_mq: bool,  // Fold cluster mapping quality into MAPQ
    pub mq_overlap: f64,       // Read-overlap fraction that counts as a sub-overlap
    pub chain_position_depth: Option<usize>, // Vertices kept per position bucket; None keeps all
    pub chain_max_connections: usize, // Edge list cap per chain vertex

    // Extension and alignment
    pub max_extensions: usize, // Clusters extended (minimizer path)
    pub max_alignments: usize, // Extension sets aligned (minimizer path)
    pub extension_set_score_threshold: Option<f64>, // Score gap for extension sets
    pub extension_score_threshold: Option<f64>, // Score gap for single extensions
    pub max_local_extensions: usize, // Extensions tail-aligned per set
    pub extension_mismatch_limit: u32, // Mismatches tolerated by gapless extension
    pub context_depth: i64,    // Base step for widening subgraphs
    pub max_query_graph_ratio: f64, // Abort if subgraph dwarfs the query by this factor
    pub max_target_factor: f64, // Skip subgraphs larger than factor * read length
    pub softclip_threshold: u32, // Soft clips at least this long trigger re-alignment
    pub max_softclip_iterations: usize, // Widening rounds per clipped side
    pub band_width: usize,     // Reads longer than this are banded
    pub kmer_sensitivity_step: usize, // Seed-length reduction per retry attempt
    pub thread_extension: i64, // Distance bound when clustering hits by position
    pub max_thread_gap: i64,   // Largest gap tolerated between chained seeds
    pub min_identity: f64,     // Discard alignments below this identity

    // Scoring
    pub scoring: Scoring,
    pub adjust_for_base_quality: bool, // Use the quality-adjusted aligner when qualities exist
    pub gc_content: f64,       // Background base composition for quality-adjusted scoring

    // Pairing
    pub pairing_mode: PairingMode,
    pub fragment_size: Option<i64>, // Manual fragment-size cap; None learns one online
    pub fragment_max: i64,     // Hard bound on fragment length when untrained
    pub fragment_sigma: f64,   // size_cap = mean + sigma * stdev
    pub fragment_length_cache_size: usize, // Rolling observations retained
    pub fragment_length_estimate_interval: usize, // Observations between snapshot refreshes
    pub perfect_pair_identity_threshold: f64, // Identity both mates need to train the model
    pub mate_rescues: usize,   // Rescue attempts per pair
    pub always_rescue: bool,   // Attempt rescue even when both mates mapped
    pub only_top_scoring_pair: bool, // Emit only the best pair

    // Multi-mapping
    pub max_multimaps: usize,  // Alignments reported
    pub extra_multimaps: usize, // Additional candidates kept for MAPQ
    pub max_attempts: usize,   // Local-recovery rounds before reporting unmapped
    pub mapping_quality_method: MappingQualityMethod,
    pub max_mapping_quality: u8,
}

impl Default for MapOpt {
    fn default() -> Self {
        MapOpt {
            min_mem_length: 0,
            max_mem_length: None,
            reseed_length: Some(32),
            fast_reseed: true,
            hit_max: Some(512),
            hit_cap: 10,
            hard_hit_cap: 300,
            minimizer_score_fraction: 0.6,

            distance_limit: 1000,
            cluster_min: 1,
            min_cluster_length: None,
            cluster_coverage_threshold: Some(0.3),
            cluster_score_threshold: Some(50.0),
            drop_chain: 0.2,
            max_cluster_mapping_quality: 1024.0,
            use_cluster_mq: false,
            mq_overlap: 0.5,
            chain_position_depth: None,
            chain_max_connections: 20,

            max_extensions: 48,
            max_alignments: 8,
            extension_set_score_threshold: Some(20.0),
            extension_score_threshold: Some(1.0),
            max_local_extensions: 32,
            extension_mismatch_limit: 4,
            context_depth: 3,
            max_query_graph_ratio: 128.0,
            max_target_factor: 128.0,
            softclip_threshold: 8,
            max_softclip_iterations: 10,
            band_width: 256,
            kmer_sensitivity_step: 5,
            thread_extension: 10,
            max_thread_gap: 30,
            min_identity: 0.0,

            scoring: Scoring::default(),
            adjust_for_base_quality: false,
            gc_content: 0.5,

            pairing_mode: PairingMode::Simultaneous,
            fragment_size: None,
            fragment_max: 10_000,
            fragment_sigma: 4.0,
            fragment_length_cache_size: 1000,
            fragment_length_estimate_interval: 10,
            perfect_pair_identity_threshold: 0.98,
            mate_rescues: 4,
            always_rescue: false,
            only_top_scoring_pair: false,

            max_multimaps: 1,
            extra_multimaps: 16,
            max_attempts: 3,
            mapping_quality_method: MappingQualityMethod::Approx,
            max_mapping_quality: 60,
        }
    }
}

impl MapOpt {
    /// Seed length at which a random match against `total_len` indexed bases
    /// becomes less likely than `chance_random`.
    pub fn random_match_length(&self, total_len: u64, chance_random: f64) -> usize {
        if total_len == 0 || chance_random <= 0.0 || chance_random >= 1.0 {
            return 0;
        }
        // per-position miss probability that keeps the whole index clean
        let miss = (1.0 - chance_random).powf(1.0 / total_len as f64);
        let k = -(1.0 - miss).max(f64::MIN_POSITIVE).ln() / 4f64.ln();
        k.ceil().max(1.0) as usize
    }

    /// Effective minimum MEM length against a given index.
    pub fn effective_min_mem_length(&self, total_len: u64) -> usize {
        if self.min_mem_length > 0 {
            self.min_mem_length
        } else {
            self.random_match_length(total_len, 0.05)
        }
    }

    /// Total candidates carried through ranking before the final cut.
    pub fn total_multimaps(&self) -> usize {
        self.max_multimaps + self.extra_multimaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let opt = MapOpt::default();
        assert_eq!(opt.scoring.match_score, 1);
        assert_eq!(opt.scoring.mismatch, 4);
        assert_eq!(opt.scoring.gap_open, 6);
        assert_eq!(opt.scoring.gap_extend, 1);
        assert!(opt.fast_reseed);
        assert_eq!(opt.total_multimaps(), 17);
        assert!(opt.reseed_length.unwrap() >= opt.min_mem_length);
    }

    #[test]
    fn random_match_length_scales_with_index_size() {
        let opt = MapOpt::default();
        let small = opt.random_match_length(1_000, 0.05);
        let large = opt.random_match_length(3_000_000_000, 0.05);
        assert!(large > small);
        assert!(small >= 1);
        assert_eq!(opt.random_match_length(0, 0.05), 0);
    }

    #[test]
    fn effective_min_mem_length_prefers_explicit_values() {
        let mut opt = MapOpt::default();
        opt.min_mem_length = 11;
        assert_eq!(opt.effective_min_mem_length(1 << 30), 11);
        opt.min_mem_length = 0;
        assert!(opt.effective_min_mem_length(1 << 30) > 11);
    }
}
