//! Declared views and their synchronization into the store.

pub mod definitions;
pub mod sync;

pub use definitions::ViewRegistry;
pub use sync::{SyncReport, Synchronizer, VerifiedViews};
