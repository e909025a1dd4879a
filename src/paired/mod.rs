//! Paired-end resolution: the online fragment model, pairing strategies,
//! and mate rescue.

pub mod fragment;
pub mod pairing;
pub mod rescue;

pub use fragment::{FragmentModel, FragmentStats};
