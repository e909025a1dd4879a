//! Gapless extension of seed hits and tail alignment of the leftover ends.

pub mod gapless;
pub mod tail;

pub use gapless::{estimate_extension_set_score, GaplessExtender, GaplessExtension};
pub use tail::{align_tails, TreeSubgraph};
