//! The online fragment-length model.
//!
//! Rolling deques hold the most recent observed insert lengths, relative
//! orientations, and directions. A cached snapshot of the statistics is
//! recomputed every few observations; readers copy the snapshot under the
//! lock so writers never block them for long.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::debug;

use crate::utils::{deque_mean, deque_stdev, normal_pdf};

/// A point-in-time copy of the model statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentStats {
    pub mean: f64,
    pub stdev: f64,
    /// Whether mates tend to map on the same strand.
    pub same_orientation: bool,
    /// Whether the second mate tends to lie forward of the first.
    pub same_direction: bool,
    /// `mean + sigma * stdev`; 0 until the model has trained.
    pub size_cap: i64,
    pub observations: usize,
}

impl FragmentStats {
    pub fn is_trained(&self) -> bool {
        self.size_cap > 0
    }
}

struct ModelState {
    lengths: VecDeque<i64>,
    orientations: VecDeque<bool>,
    directions: VecDeque<bool>,
    since_last_estimate: usize,
    cached: FragmentStats,
}

/// Shared, internally synchronized fragment model.
pub struct FragmentModel {
    cache_size: usize,
    estimate_interval: usize,
    sigma: f64,
    state: Mutex<ModelState>,
}

impl FragmentModel {
    pub fn new(cache_size: usize, estimate_interval: usize, sigma: f64) -> Self {
        FragmentModel {
            cache_size: cache_size.max(1),
            estimate_interval: estimate_interval.max(1),
            sigma,
            state: Mutex::new(ModelState {
                lengths: VecDeque::new(),
                orientations: VecDeque::new(),
                directions: VecDeque::new(),
                since_last_estimate: 0,
                cached: FragmentStats::default(),
            }),
        }
    }

    /// Record one observed fragment configuration.
    pub fn observe(&self, length: i64, same_orientation: bool, same_direction: bool) {
        let mut state = self.state.lock().unwrap();
        state.lengths.push_front(length.abs());
        state.orientations.push_front(same_orientation);
        state.directions.push_front(same_direction);
        while state.lengths.len() > self.cache_size {
            state.lengths.pop_back();
        }
        while state.orientations.len() > self.cache_size {
            state.orientations.pop_back();
        }
        while state.directions.len() > self.cache_size {
            state.directions.pop_back();
        }
        state.since_last_estimate += 1;
        if state.since_last_estimate >= self.estimate_interval {
            let mean = deque_mean(&state.lengths);
            let stdev = deque_stdev(&state.lengths);
            let same_orientation =
                state.orientations.iter().filter(|&&o| o).count() * 2 > state.orientations.len();
            let same_direction =
                state.directions.iter().filter(|&&d| d).count() * 2 > state.directions.len();
            state.cached = FragmentStats {
                mean,
                stdev,
                same_orientation,
                same_direction,
                size_cap: (mean + self.sigma * stdev).round() as i64,
                observations: state.lengths.len(),
            };
            state.since_last_estimate = 0;
            debug!(
                "fragment model: mean {:.1}, stdev {:.1}, cap {}, same_orientation {}",
                mean, stdev, state.cached.size_cap, same_orientation
            );
        }
    }

    /// Copy of the cached statistics.
    pub fn snapshot(&self) -> FragmentStats {
        self.state.lock().unwrap().cached
    }

    pub fn is_trained(&self) -> bool {
        self.snapshot().is_trained()
    }

    /// Likelihood of a fragment length under the trained model.
    pub fn pdf(&self, length: f64) -> f64 {
        let stats = self.snapshot();
        normal_pdf(length, stats.mean, stats.stdev)
    }
}
