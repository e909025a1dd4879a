//! Index oracles: the graph FM-index and the minimizer index.

pub mod fm;
pub mod minimizers;

pub use fm::{FmIndex, FmRange, WalkIndex};
pub use minimizers::{
    minimizers_of, MemoryMinimizerIndex, Minimizer, MinimizerIndex, NO_KEY,
};
