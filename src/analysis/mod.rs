//! Analysis modules.
//!
//! Client-side folding of index rows into per-area aggregates.

pub mod aggregator;

pub use aggregator::*;
