//! Clustering: the Markov chain model over MEM hits and the distance-based
//! clusterer for minimizer seeds.

pub mod chain;
pub mod distance;

pub use chain::{cluster_coverage, clusters_to_drop, ChainModel};
pub use distance::cluster_seeds;
