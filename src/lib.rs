//! graphite-align: a seed-cluster-extend-align core for mapping short reads
//! onto sequence variation graphs.
//!
//! The crate maps reads against a graph through two interchangeable
//! front-ends: a super-maximal-exact-match pipeline over a graph FM-index
//! ([`mapper::Mapper`]) and a minimizer pipeline with gapless extension
//! ([`minimizer_mapper::MinimizerMapper`]). The graph, FM-index, and
//! minimizer index are read-only oracles behind traits; in-memory
//! implementations back the test suite and small deployments.

pub mod align;
pub mod cache;
pub mod cluster;
pub mod extend;
pub mod graph;
pub mod index;
pub mod map_opt;
pub mod mapper;
pub mod mapq;
pub mod minimizer_mapper;
pub mod multimap;
pub mod paired;
pub mod seed;
pub mod utils;

pub use align::aligners::{Aligner, AlignerCaps, QualAdjAligner, Scoring};
pub use align::alignment::{Alignment, Edit, Mapping};
pub use graph::{Edge, GraphIndex, GraphPos, MemoryGraph, Subgraph};
pub use index::{FmIndex, FmRange, MemoryMinimizerIndex, Minimizer, MinimizerIndex, WalkIndex};
pub use map_opt::{MapOpt, MappingQualityMethod, PairingMode};
pub use mapper::{Mapper, MapperError, Read};
pub use minimizer_mapper::MinimizerMapper;
pub use paired::{FragmentModel, FragmentStats};
