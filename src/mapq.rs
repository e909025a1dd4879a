//! Mapping quality from the score distribution over candidate placements.

use crate::align::alignment::{query_overlap, Alignment};
use crate::map_opt::MappingQualityMethod;
use crate::utils::{log_sum_exp, prob_to_phred};

/// Hard ceiling on reported mapping quality.
pub const MAX_MAPQ: f64 = 60.0;

/// Phred-scaled confidence that the top-scoring placement is correct.
///
/// Computed as the phred of the posterior odds of the best score against
/// the log-sum-exp of the rest, which keeps the computation stable for
/// large score gaps. With fewer than two candidates the result saturates.
pub fn maximum_mapping_quality(scores: &[f64]) -> f64 {
    if scores.is_empty() || scores[0] <= 0.0 {
        return 0.0;
    }
    if scores.len() < 2 {
        return MAX_MAPQ;
    }
    let top = scores[0];
    let rest = log_sum_exp(&scores[1..]);
    if rest == f64::NEG_INFINITY {
        return MAX_MAPQ;
    }
    let diff = top - rest;
    if diff <= 0.0 {
        return 0.0;
    }
    // phred of the likelihood ratio between the winner and everything else
    let mapq = diff * 10.0 / std::f64::consts::LN_10;
    mapq.clamp(0.0, MAX_MAPQ)
}

/// Exact posterior variant: 1 − P(top) over the full candidate set.
pub fn maximum_mapping_quality_exact(scores: &[f64]) -> f64 {
    if scores.is_empty() || scores[0] <= 0.0 {
        return 0.0;
    }
    if scores.len() < 2 {
        return MAX_MAPQ;
    }
    let total = log_sum_exp(scores);
    let p_top = (scores[0] - total).exp();
    if p_top >= 1.0 {
        return MAX_MAPQ;
    }
    prob_to_phred(1.0 - p_top).clamp(0.0, MAX_MAPQ)
}

/// Count rank-0 overlaps: secondaries whose aligned read interval covers at
/// least `overlap_fraction` of the read length shared with the primary.
pub fn sub_overlaps_of_first(alns: &[Alignment], overlap_fraction: f64) -> usize {
    if alns.is_empty() {
        return 0;
    }
    let first = &alns[0];
    let seq_len = first.sequence.len().max(1);
    alns[1..]
        .iter()
        .filter(|other| {
            query_overlap(first, other) as f64 / seq_len as f64 >= overlap_fraction
        })
        .count()
}

/// Apply the configured method to a ranked alignment list, writing MAPQ
/// into the primary. Secondaries keep MAPQ 0.
pub fn compute_mapping_qualities(
    alns: &mut [Alignment],
    method: MappingQualityMethod,
    max_mapping_quality: u8,
    cluster_mq: Option<f64>,
    mq_overlap: f64,
) {
    if alns.is_empty() {
        return;
    }
    if method == MappingQualityMethod::None {
        return;
    }
    if !alns[0].is_mapped() {
        alns[0].mapq = 0;
        return;
    }
    let scores: Vec<f64> = alns.iter().map(|a| a.score as f64).collect();
    let mut mapq = match method {
        MappingQualityMethod::Approx => maximum_mapping_quality(&scores),
        MappingQualityMethod::Exact => maximum_mapping_quality_exact(&scores),
        MappingQualityMethod::None => unreachable!(),
    };
    let sub_overlaps = sub_overlaps_of_first(alns, mq_overlap);
    if sub_overlaps > 0 {
        // each overlapping near-duplicate halves the posterior odds
        mapq /= (sub_overlaps + 1) as f64;
    }
    if let Some(cmq) = cluster_mq {
        mapq = mapq.min(cmq);
    }
    let cap = (max_mapping_quality as f64).min(MAX_MAPQ);
    alns[0].mapq = mapq.clamp(0.0, cap).round() as u8;
    for aln in alns[1..].iter_mut() {
        aln.mapq = 0;
    }
}

/// Paired variant: quality comes from pair score sums, applied to both
/// primaries.
pub fn compute_paired_mapping_qualities(
    alns1: &mut [Alignment],
    alns2: &mut [Alignment],
    method: MappingQualityMethod,
    max_mapping_quality: u8,
    cluster_mq: Option<f64>,
    mq_overlap: f64,
) {
    if alns1.is_empty() || alns2.is_empty() || method == MappingQualityMethod::None {
        return;
    }
    let n = alns1.len().min(alns2.len());
    let pair_scores: Vec<f64> = (0..n)
        .map(|i| (alns1[i].score + alns2[i].score) as f64)
        .collect();
    let mut mapq = match method {
        MappingQualityMethod::Approx => maximum_mapping_quality(&pair_scores),
        MappingQualityMethod::Exact => maximum_mapping_quality_exact(&pair_scores),
        MappingQualityMethod::None => unreachable!(),
    };
    let overlaps = sub_overlaps_of_first(alns1, mq_overlap) + sub_overlaps_of_first(alns2, mq_overlap);
    if overlaps > 0 {
        mapq /= (overlaps + 1) as f64;
    }
    if let Some(cmq) = cluster_mq {
        mapq = mapq.min(cmq);
    }
    let cap = (max_mapping_quality as f64).min(MAX_MAPQ);
    let value = mapq.clamp(0.0, cap).round() as u8;
    if alns1[0].is_mapped() {
        alns1[0].mapq = value;
    }
    if alns2[0].is_mapped() {
        alns2[0].mapq = value;
    }
}

/// Cluster-level mapping quality from per-cluster coverage weights.
///
/// Each MEM contributes its read coverage, sharing overlap with its
/// neighbors, discounted by its hit count; the quality is the phred of the
/// runner-up/winner weight ratio.
pub fn cluster_mapping_quality(weights: &[f64], max_cluster_mapping_quality: f64) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    if weights.len() == 1 {
        return max_cluster_mapping_quality;
    }
    let mut sorted = weights.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    if sorted[0] <= 0.0 {
        return 0.0;
    }
    let max_count = sorted.iter().take_while(|&&w| w == sorted[0]).count();
    let best_chance = if max_count > 1 {
        prob_to_phred(1.0 - 1.0 / max_count as f64)
    } else {
        0.0
    };
    let ratio_quality = prob_to_phred(sorted[1] / sorted[0]);
    best_chance.max(ratio_quality).min(max_cluster_mapping_quality)
}
