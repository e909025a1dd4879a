//! Generic top-K selection under a relative score gap.
//!
//! Clustering, extension, alignment, and winner selection all pick the best
//! few candidates the same way: iterate in score-descending order, accept
//! while the score stays within a threshold of the best, up to a count cap.
//! Keeping one implementation keeps the three cutoffs independent of each
//! other.

/// Iterate candidate indices in score-descending order.
///
/// An item is accepted (dispatched to `on_pass`) while its score is within
/// `threshold` of the best score — or unconditionally until `min_count`
/// items have been accepted — and fewer than `max_count` items have been
/// taken. Items that meet the threshold after the cap goes to `on_over`;
/// items below the threshold go to `on_fail`. `on_pass` may return `false`
/// to retract its acceptance without stopping the scan.
///
/// A `threshold` of `None` disables the gap check entirely.
pub fn process_until_threshold(
    count: usize,
    score: impl Fn(usize) -> f64,
    threshold: Option<f64>,
    min_count: usize,
    max_count: usize,
    mut on_pass: impl FnMut(usize) -> bool,
    mut on_over: impl FnMut(usize),
    mut on_fail: impl FnMut(usize),
) {
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by(|&a, &b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let best = order.first().map(|&i| score(i)).unwrap_or(0.0);
    let cutoff = threshold.map(|t| best - t);

    let mut accepted = 0usize;
    for i in order {
        let s = score(i);
        let in_gap = match cutoff {
            Some(c) => s >= c,
            None => true,
        };
        if in_gap || accepted < min_count {
            if accepted < max_count {
                if on_pass(i) {
                    accepted += 1;
                }
            } else {
                on_over(i);
            }
        } else {
            on_fail(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_in_score_order_up_to_cap() {
        let scores = [5.0, 9.0, 8.0, 1.0];
        let mut passed = Vec::new();
        let mut over = Vec::new();
        let mut failed = Vec::new();
        process_until_threshold(
            scores.len(),
            |i| scores[i],
            Some(5.0),
            1,
            2,
            |i| {
                passed.push(i);
                true
            },
            |i| over.push(i),
            |i| failed.push(i),
        );
        assert_eq!(passed, vec![1, 2]);
        assert_eq!(over, vec![0]); // within gap but over the cap
        assert_eq!(failed, vec![3]);
    }

    #[test]
    fn min_count_overrides_the_gap() {
        let scores = [10.0, 1.0];
        let mut passed = Vec::new();
        process_until_threshold(
            scores.len(),
            |i| scores[i],
            Some(2.0),
            2,
            4,
            |i| {
                passed.push(i);
                true
            },
            |_| {},
            |_| panic!("min_count should force acceptance"),
        );
        assert_eq!(passed, vec![0, 1]);
    }

    #[test]
    fn rejected_pass_does_not_consume_the_cap() {
        let scores = [4.0, 3.0, 2.0];
        let mut passed = Vec::new();
        process_until_threshold(
            scores.len(),
            |i| scores[i],
            None,
            0,
            1,
            |i| {
                if i == 0 {
                    false // retract
                } else {
                    passed.push(i);
                    true
                }
            },
            |_| {},
            |_| {},
        );
        assert_eq!(passed, vec![1]);
    }
}
