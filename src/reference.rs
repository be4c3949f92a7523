//! Reference data cache.
//!
//! Reference datasets (socioeconomic scores per area) and area boundary
//! geometry are bulk-loaded from the store on first use and kept for the
//! life of the process. Concurrent first requests for the same dataset
//! share a single fetch. A failed fetch is not cached.

use crate::config::{BoundariesConfig, ReferenceConfig};
use crate::error::{ReferenceError, StoreError};
use crate::models::{ReferenceEntry, ReferenceSeries};
use crate::store::DocumentStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

const BOUNDARIES_KEY: &str = "boundaries";

/// At most one in-flight load per key; successful loads are kept.
struct SingleFlight<T> {
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<T>>>>>,
}

impl<T> SingleFlight<T> {
    fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_try_load<F, Fut, E>(&self, key: &str, load: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            Arc::clone(cells.entry(key.to_string()).or_default())
        };

        // Waiters block on the cell; if the load fails the next one retries.
        cell.get_or_try_init(|| async move { load().await.map(Arc::new) })
            .await
            .cloned()
    }
}

/// Process-lifetime cache of reference series and area boundaries.
pub struct ReferenceCache {
    store: Arc<dyn DocumentStore>,
    references: BTreeMap<String, ReferenceConfig>,
    boundaries_config: BoundariesConfig,
    series: SingleFlight<ReferenceSeries>,
    boundaries: SingleFlight<Vec<Value>>,
}

impl ReferenceCache {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        references: BTreeMap<String, ReferenceConfig>,
        boundaries_config: BoundariesConfig,
    ) -> Self {
        Self {
            store,
            references,
            boundaries_config,
            series: SingleFlight::new(),
            boundaries: SingleFlight::new(),
        }
    }

    /// A reference series, loaded on first use.
    pub async fn series(&self, name: &str) -> Result<Arc<ReferenceSeries>, ReferenceError> {
        let config = self
            .references
            .get(name)
            .ok_or_else(|| ReferenceError::UnknownSeries(name.to_string()))?;

        self.series
            .get_or_try_load(name, || async {
                let documents = self.load(name, &config.database).await?;
                let series = parse_series(name, config, &documents);
                info!(
                    "Loaded reference series '{}' ({} areas)",
                    name,
                    series.entries.len()
                );
                Ok(series)
            })
            .await
    }

    /// Area boundary features, loaded on first use.
    pub async fn boundaries(&self) -> Result<Arc<Vec<Value>>, ReferenceError> {
        self.boundaries
            .get_or_try_load(BOUNDARIES_KEY, || async {
                let documents = self
                    .load(BOUNDARIES_KEY, &self.boundaries_config.database)
                    .await?;
                let features: Vec<Value> = documents
                    .into_iter()
                    .filter(|doc| {
                        !is_excluded(document_id(doc), &self.boundaries_config.excluded_areas)
                    })
                    .collect();
                info!("Loaded {} area boundaries", features.len());
                Ok(features)
            })
            .await
    }

    async fn load(&self, name: &str, database: &str) -> Result<Vec<Value>, ReferenceError> {
        debug!("Fetching all documents of {} for '{}'", database, name);
        self.store
            .list_all_documents(database)
            .await
            .map_err(|source: StoreError| ReferenceError::Fetch {
                name: name.to_string(),
                source,
            })
    }
}

fn document_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

fn is_excluded(area: Option<&str>, excluded: &[String]) -> bool {
    match area {
        Some(area) => area.starts_with("_design/") || excluded.iter().any(|e| e == area),
        None => false,
    }
}

/// A finite number, or a string holding one.
fn numeric_field(doc: &Value, field: &str) -> Option<f64> {
    let value = match doc.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

fn area_field(doc: &Value, field: &str) -> Option<String> {
    match doc.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => document_id(doc).map(str::to_string),
    }
}

/// Build a series from raw documents.
///
/// Documents without a usable score are skipped, as are sentinel areas.
fn parse_series(name: &str, config: &ReferenceConfig, documents: &[Value]) -> ReferenceSeries {
    let mut entries = BTreeMap::new();
    let mut skipped = 0usize;

    for doc in documents {
        if document_id(doc).is_some_and(|id| id.starts_with("_design/")) {
            continue;
        }
        let Some(area) = area_field(doc, &config.area_field) else {
            skipped += 1;
            continue;
        };
        if is_excluded(Some(&area), &config.excluded_areas) {
            continue;
        }
        let Some(score) = numeric_field(doc, &config.score_field) else {
            skipped += 1;
            continue;
        };

        entries.insert(
            area,
            ReferenceEntry {
                score,
                population: numeric_field(doc, &config.population_field),
            },
        );
    }

    if skipped > 0 {
        debug!("Skipped {} unusable document(s) in '{}'", skipped, name);
    }

    ReferenceSeries {
        name: name.to_string(),
        entries,
    }
}
