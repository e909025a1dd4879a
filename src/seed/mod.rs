//! Seed finding: the SMEM front-end over the graph FM-index and the
//! minimizer front-end over the minimizer index.

pub mod mem;
pub mod minimizer_seeds;

pub use mem::{Mem, MemFinder, SubMem};
pub use minimizer_seeds::{find_minimizer_seeds, Seed, SeedSelection};
