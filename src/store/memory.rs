//! In-memory document store for tests.
//!
//! Emulates the parts of CouchDB the engine relies on: design document
//! revisions, key collation and ranges, grouping with `_count`/`_sum`
//! reducers, partitions, `limit` and `include_docs`. View rows are seeded
//! directly with [`MemoryStore::emit`] instead of running map functions.

use crate::error::StoreError;
use crate::models::{DesignDocument, IndexRow, QueryOptions, Revision, ViewId};
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    designs: HashMap<(String, String), DesignDocument>,
    generations: HashMap<(String, String), u64>,
    emitted: HashMap<ViewId, Vec<IndexRow>>,
    documents: HashMap<String, Vec<Value>>,
    pending_conflicts: HashMap<(String, String), usize>,
    pending_list_failures: HashMap<String, usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    list_delay: Option<Duration>,
    leak_partitions: bool,
    pub put_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `list_all_documents` call, to widen race windows.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Ignore the partition of partitioned queries and return every row.
    pub fn leaking_partitions(mut self) -> Self {
        self.leak_partitions = true;
        self
    }

    /// Store a design document as if someone else had written it.
    pub fn seed_design(&self, database: &str, mut doc: DesignDocument) {
        let mut state = self.state.lock().unwrap();
        let key = (database.to_string(), doc.name().to_string());
        let generation = state.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        doc.rev = Some(format!("{}-seed", generation));
        state.designs.insert(key, doc);
    }

    pub fn design(&self, database: &str, name: &str) -> Option<DesignDocument> {
        let state = self.state.lock().unwrap();
        state
            .designs
            .get(&(database.to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next `count` writes to a design document fail with a conflict.
    pub fn inject_conflicts(&self, database: &str, name: &str, count: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .pending_conflicts
            .insert((database.to_string(), name.to_string()), count);
    }

    /// Make the next `count` bulk loads of a database fail.
    pub fn fail_listings(&self, database: &str, count: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .pending_list_failures
            .insert(database.to_string(), count);
    }

    /// Add one emitted row to a view. The document body is `{"_id": id}`.
    pub fn emit(&self, view: &ViewId, id: &str, key: Value, value: Value) {
        self.emit_doc(view, id, key, value, json!({ "_id": id }));
    }

    pub fn emit_doc(&self, view: &ViewId, id: &str, key: Value, value: Value, doc: Value) {
        let mut state = self.state.lock().unwrap();
        state.emitted.entry(view.clone()).or_default().push(IndexRow {
            id: Some(id.to_string()),
            key,
            value,
            doc: Some(doc),
        });
    }

    pub fn insert_documents(&self, database: &str, docs: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state
            .documents
            .entry(database.to_string())
            .or_default()
            .extend(docs);
    }

    pub fn puts(&self) -> usize {
        self.put_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn listings(&self) -> usize {
        self.list_calls.load(AtomicOrdering::SeqCst)
    }
}

/// Rank of a JSON type in CouchDB collation order.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// CouchDB view collation, with plain code-point ordering for strings.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ordering = collate(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ordering = lk.cmp(rk).then_with(|| collate(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Group key for a row at the requested grouping.
fn group_key(key: &Value, options: &QueryOptions) -> Value {
    if options.group.unwrap_or(false) {
        key.clone()
    } else {
        Value::Null
    }
}

fn add_values(acc: &Value, value: &Value) -> Result<Value, StoreError> {
    match (acc, value) {
        (Value::Null, v) => Ok(v.clone()),
        (Value::Number(a), Value::Number(b)) => {
            let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
            Ok(number(sum))
        }
        (Value::Array(a), Value::Array(b)) => {
            let len = a.len().max(b.len());
            let summed = (0..len)
                .map(|i| {
                    let x = a.get(i).and_then(Value::as_f64).unwrap_or(0.0);
                    let y = b.get(i).and_then(Value::as_f64).unwrap_or(0.0);
                    number(x + y)
                })
                .collect();
            Ok(Value::Array(summed))
        }
        _ => Err(StoreError::Http {
            status: 500,
            body: format!("_sum cannot add {} and {}", acc, value),
        }),
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value >= 0.0 {
        json!(value as u64)
    } else {
        json!(value)
    }
}

fn reduce_group(reducer: &str, rows: &[IndexRow]) -> Result<Value, StoreError> {
    match reducer {
        "_count" => Ok(json!(rows.len())),
        "_sum" => rows
            .iter()
            .try_fold(Value::Null, |acc, row| add_values(&acc, &row.value)),
        other => Err(StoreError::Http {
            status: 500,
            body: format!("reducer {} is not supported in memory", other),
        }),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_design_documents(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .designs
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_design_document(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<DesignDocument>, StoreError> {
        Ok(self.design(database, name))
    }

    async fn put_design_document(
        &self,
        database: &str,
        doc: &DesignDocument,
    ) -> Result<Revision, StoreError> {
        self.put_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let key = (database.to_string(), doc.name().to_string());

        let injected = match state.pending_conflicts.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if injected {
            // Someone else wrote in between: bump the stored revision.
            let generation = state.generations.entry(key.clone()).or_insert(0);
            *generation += 1;
            let rev = format!("{}-other", generation);
            if let Some(stored) = state.designs.get_mut(&key) {
                stored.rev = Some(rev);
            }
            return Err(StoreError::Conflict(format!("{}/{}", database, doc.id)));
        }

        let current_rev = state.designs.get(&key).and_then(|d| d.rev.clone());
        if current_rev != doc.rev {
            return Err(StoreError::Conflict(format!("{}/{}", database, doc.id)));
        }

        let generation = state.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        let rev = format!("{}-mem", generation);

        let mut stored = doc.clone();
        stored.rev = Some(rev.clone());
        state.designs.insert(key, stored);

        Ok(rev)
    }

    async fn query_index(
        &self,
        database: &str,
        design: &str,
        view: &str,
        options: &QueryOptions,
    ) -> Result<Vec<IndexRow>, StoreError> {
        self.query_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let state = self.state.lock().unwrap();
        let id = ViewId::new(database, design, view);

        let spec = state
            .designs
            .get(&(database.to_string(), design.to_string()))
            .and_then(|doc| doc.views.get(view))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut rows = state.emitted.get(&id).cloned().unwrap_or_default();

        if let Some(partition) = options.partition.as_ref().filter(|_| !self.leak_partitions) {
            rows.retain(|row| row.partition() == Some(partition.as_str()));
        }
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));

        if let Some(key) = &options.key {
            rows.retain(|row| collate(&row.key, key) == Ordering::Equal);
        }
        if let Some(start) = &options.start_key {
            rows.retain(|row| collate(&row.key, start) != Ordering::Less);
        }
        if let Some(end) = &options.end_key {
            rows.retain(|row| collate(&row.key, end) != Ordering::Greater);
        }

        let reduce = spec.reduce.is_some() && options.reduce.unwrap_or(true);
        let mut result = if reduce {
            let reducer = spec.reduce.as_deref().unwrap_or_default();
            let mut groups: Vec<(Value, Vec<IndexRow>)> = Vec::new();
            for row in rows {
                let key = group_key(&row.key, options);
                match groups.last_mut() {
                    Some((last, members)) if collate(last, &key) == Ordering::Equal => {
                        members.push(row)
                    }
                    _ => groups.push((key, vec![row])),
                }
            }
            groups
                .into_iter()
                .map(|(key, members)| {
                    reduce_group(reducer, &members).map(|value| IndexRow::new(key, value))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            if !options.include_docs {
                for row in &mut rows {
                    row.doc = None;
                }
            }
            rows
        };

        if let Some(limit) = options.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn list_all_documents(&self, database: &str) -> Result<Vec<Value>, StoreError> {
        self.list_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let fail = match state.pending_list_failures.get_mut(database) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(StoreError::Transport(format!("{} is unreachable", database)));
        }

        state
            .documents
            .get(database)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(database.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndexSpec;

    fn keyword_store() -> (MemoryStore, ViewId) {
        let store = MemoryStore::new();
        let mut doc = DesignDocument::new("api-global");
        doc.views.insert(
            "keyword".to_string(),
            IndexSpec::new("function (doc) {}", Some("_count".to_string())),
        );
        store.seed_design("statuses", doc);

        let view = ViewId::new("statuses", "api-global", "keyword");
        store.emit(&view, "A:1", json!(["storm", "A"]), json!(1));
        store.emit(&view, "A:2", json!(["storm", "A"]), json!(1));
        store.emit(&view, "B:3", json!(["storm", "B"]), json!(1));
        store.emit(&view, "B:3", json!(["stormy", "B"]), json!(1));
        (store, view)
    }

    #[test]
    fn test_collation_order() {
        assert_eq!(collate(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(collate(&json!(10), &json!("1")), Ordering::Less);
        assert_eq!(collate(&json!(["storm"]), &json!(["storm", "A"])), Ordering::Less);
        assert_eq!(collate(&json!(["storm", "zzz"]), &json!(["storm", {}])), Ordering::Less);
        assert_eq!(collate(&json!(["stormy"]), &json!(["storm", {}])), Ordering::Greater);
    }

    #[tokio::test]
    async fn test_grouped_range_query() {
        let (store, _) = keyword_store();
        let options = QueryOptions::grouped().range(json!(["storm"]), json!(["storm", {}]));

        let rows = store
            .query_index("statuses", "api-global", "keyword", &options)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, json!(["storm", "A"]));
        assert_eq!(rows[0].value, json!(2));
        assert_eq!(rows[1].value, json!(1));
    }

    #[tokio::test]
    async fn test_missing_view_is_not_found() {
        let (store, _) = keyword_store();
        let result = store
            .query_index("statuses", "api-global", "hashtags", &QueryOptions::default())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = MemoryStore::new();
        store.seed_design("statuses", DesignDocument::new("api"));

        let mut stale = store.design("statuses", "api").unwrap();
        stale.rev = Some("0-stale".to_string());

        let result = store.put_design_document("statuses", &stale).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }
}
