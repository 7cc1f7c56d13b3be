//! AYB: statistical base calling for Illumina-style sequencer tiles.
//!
//! Given per-cluster per-cycle fluorescence intensities, the model
//! jointly estimates the instrument's crosstalk, phasing and per-cycle
//! noise, and emits per-cluster nucleotide sequences with per-base
//! quality scores.

pub mod blockspec;
pub mod calling;
pub mod config;
pub mod covariance;
pub mod input;
pub mod intensities;
pub mod lambda;
pub mod linalg;
pub mod matrix;
pub mod model;
pub mod mpn;
pub mod nuc;
pub mod output;
pub mod stats;
pub mod tile;
