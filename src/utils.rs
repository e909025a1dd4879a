//! Small sequence and statistics helpers shared across the pipeline.

use std::collections::VecDeque;

use bio::alphabets::dna;

/// Reverse complement of a DNA sequence. Ambiguous bases map to themselves
/// (`N` stays `N`), matching the alphabet used by the rest of the pipeline.
pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    dna::revcomp(seq)
}

/// Encode a nucleotide as 0..3, or 4 for anything ambiguous.
#[inline]
pub fn encode_base(b: u8) -> u8 {
    match b {
        b'A' | b'a' => 0,
        b'C' | b'c' => 1,
        b'G' | b'g' => 2,
        b'T' | b't' => 3,
        _ => 4,
    }
}

/// True if the base cannot take part in an exact match.
#[inline]
pub fn is_ambiguous(b: u8) -> bool {
    encode_base(b) >= 4
}

/// Mean of an integer deque; 0.0 when empty.
pub fn deque_mean(values: &VecDeque<i64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: i64 = values.iter().sum();
    sum as f64 / values.len() as f64
}

/// Population standard deviation of an integer deque; 0.0 when empty.
pub fn deque_stdev(values: &VecDeque<i64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = deque_mean(values);
    let var: f64 = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    var.sqrt()
}

/// Normal probability density.
pub fn normal_pdf(x: f64, mean: f64, stdev: f64) -> f64 {
    if stdev <= 0.0 {
        return 0.0;
    }
    let z = (x - mean) / stdev;
    (-0.5 * z * z).exp() / (stdev * (2.0 * std::f64::consts::PI).sqrt())
}

/// Phred-scale a probability of error.
pub fn prob_to_phred(prob: f64) -> f64 {
    if prob <= 0.0 {
        return f64::INFINITY;
    }
    -10.0 * prob.log10()
}

/// Stable log of a sum of exponentials.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}
