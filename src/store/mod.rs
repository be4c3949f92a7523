//! Document store access.
//!
//! This module defines the [`DocumentStore`] seam used by every engine
//! component, and the CouchDB implementation used in production.

pub mod couch;
#[cfg(test)]
pub mod memory;

use crate::error::StoreError;
use crate::models::{DesignDocument, IndexRow, QueryOptions, Revision};
use async_trait::async_trait;
use serde_json::Value;

pub use couch::CouchStore;

/// Operations the engine needs from a CouchDB-style document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names (without `_design/`) of the design documents in a database.
    async fn list_design_documents(&self, database: &str) -> Result<Vec<String>, StoreError>;

    /// Fetch one design document, `None` if it does not exist.
    async fn get_design_document(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<DesignDocument>, StoreError>;

    /// Write a design document.
    ///
    /// The document's `rev` is the compare-and-swap token: a stale or missing
    /// revision for an existing document yields [`StoreError::Conflict`].
    async fn put_design_document(
        &self,
        database: &str,
        doc: &DesignDocument,
    ) -> Result<Revision, StoreError>;

    /// Query a view.
    async fn query_index(
        &self,
        database: &str,
        design: &str,
        view: &str,
        options: &QueryOptions,
    ) -> Result<Vec<IndexRow>, StoreError>;

    /// Every document of a database, bodies included.
    async fn list_all_documents(&self, database: &str) -> Result<Vec<Value>, StoreError>;
}
