//! Experiment domain: records, storage keys and the bucketing engine

pub mod engine;
pub mod keys;
pub mod model;

pub use engine::{Engine, VariantStats};
pub use model::{Experiment, Variant};
