//! Data models for views, index rows and area aggregates.
//!
//! This module contains the core data structures shared by the
//! synchronizer, the query layer and the correlation pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Area code to count.
pub type AreaCounts = BTreeMap<String, u64>;

/// Area code to numeric value.
pub type AreaSeries = BTreeMap<String, f64>;

/// Opaque revision token managed by the store.
pub type Revision = String;

/// The map/reduce source of a single view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Map function source.
    pub map: String,
    /// Reduce function source or built-in reducer name (`_count`, `_sum`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

impl IndexSpec {
    pub fn new(map: impl Into<String>, reduce: Option<String>) -> Self {
        Self {
            map: map.into(),
            reduce,
        }
    }
}

/// Fully qualified name of a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId {
    pub database: String,
    pub design: String,
    pub view: String,
}

impl ViewId {
    pub fn new(
        database: impl Into<String>,
        design: impl Into<String>,
        view: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            design: design.into(),
            view: view.into(),
        }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/_design/{}/_view/{}", self.database, self.design, self.view)
    }
}

/// A declared view, as loaded from the definitions directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub id: ViewId,
    pub spec: IndexSpec,
}

/// Design document options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignOptions {
    pub partitioned: bool,
}

/// A design document as stored by CouchDB.
///
/// Fields this crate does not manage (`validate_doc_update`, `filters`, ...)
/// are kept in `extra` so a write never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub views: BTreeMap<String, IndexSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<DesignOptions>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_language() -> String {
    "javascript".to_string()
}

impl DesignDocument {
    /// Creates an empty, never-written design document.
    pub fn new(name: &str) -> Self {
        Self {
            id: format!("_design/{}", name),
            rev: None,
            language: default_language(),
            views: BTreeMap::new(),
            options: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Design document name without the `_design/` prefix.
    pub fn name(&self) -> &str {
        self.id.strip_prefix("_design/").unwrap_or(&self.id)
    }
}

/// One row of a view query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl IndexRow {
    pub fn new(key: Value, value: Value) -> Self {
        Self {
            id: None,
            key,
            value,
            doc: None,
        }
    }

    /// Partition of the emitting document (`<partition>:<doc id>`).
    pub fn partition(&self) -> Option<&str> {
        self.id
            .as_deref()
            .and_then(|id| id.split_once(':'))
            .map(|(partition, _)| partition)
    }
}

/// Options for a single view query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub key: Option<Value>,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub group: Option<bool>,
    pub reduce: Option<bool>,
    pub partition: Option<String>,
    pub include_docs: bool,
    pub limit: Option<usize>,
    /// Accept a view that has not caught up with the latest writes.
    pub stale_ok: bool,
}

impl QueryOptions {
    /// Reduced and grouped by full key.
    pub fn grouped() -> Self {
        Self {
            group: Some(true),
            reduce: Some(true),
            ..Self::default()
        }
    }

    /// Raw emitted rows, reducer bypassed.
    pub fn unreduced() -> Self {
        Self {
            reduce: Some(false),
            ..Self::default()
        }
    }

    pub fn range(mut self, start: Value, end: Value) -> Self {
        self.start_key = Some(start);
        self.end_key = Some(end);
        self
    }

    pub fn key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn partition(mut self, partition: Option<&str>) -> Self {
        self.partition = partition.map(str::to_string);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn stale(mut self, stale_ok: bool) -> Self {
        self.stale_ok = stale_ok;
        self
    }
}

/// Sentiment class of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentClass {
    Positive,
    Negative,
    Neutral,
}

impl SentimentClass {
    /// Parses the second key component of a sentiment row.
    ///
    /// Accepts class names or polarity numbers (`1`, `-1`, `0`).
    pub fn from_key(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => match s.to_lowercase().as_str() {
                "positive" | "pos" => Some(Self::Positive),
                "negative" | "neg" => Some(Self::Negative),
                "neutral" => Some(Self::Neutral),
                _ => None,
            },
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(Self::Positive),
                Some(-1) => Some(Self::Negative),
                Some(0) => Some(Self::Neutral),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Per-area sentiment buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentCounts {
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

impl SentimentCounts {
    pub fn add(&mut self, class: SentimentClass, count: u64) {
        match class {
            SentimentClass::Positive => self.positive += count,
            SentimentClass::Negative => self.negative += count,
            SentimentClass::Neutral => self.neutral += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.positive + self.negative + self.neutral
    }

    /// `positive / (positive + negative)`, NaN when both are zero.
    pub fn positivity_ratio(&self) -> f64 {
        let denominator = self.positive + self.negative;
        if denominator == 0 {
            f64::NAN
        } else {
            self.positive as f64 / denominator as f64
        }
    }
}

/// Activity categories, in the order of the reduced value vector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Cricket,
    Tennis,
    Footy,
    Motorsports,
    Soccer,
    Exercise,
}

impl ActivityCategory {
    pub const ALL: [ActivityCategory; 6] = [
        ActivityCategory::Cricket,
        ActivityCategory::Tennis,
        ActivityCategory::Footy,
        ActivityCategory::Motorsports,
        ActivityCategory::Soccer,
        ActivityCategory::Exercise,
    ];

    /// Position of this category in the reduced vector.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ActivityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityCategory::Cricket => write!(f, "Cricket"),
            ActivityCategory::Tennis => write!(f, "Tennis"),
            ActivityCategory::Footy => write!(f, "Footy"),
            ActivityCategory::Motorsports => write!(f, "Motorsports"),
            ActivityCategory::Soccer => write!(f, "Soccer"),
            ActivityCategory::Exercise => write!(f, "Exercise"),
        }
    }
}

/// A hashtag and how often it was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtagCount {
    pub hashtag: String,
    pub frequency: u64,
}

/// One labelled bucket of a distribution (weekday, hour).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub label: String,
    pub count: u64,
}

/// Corpus-wide activity summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusSummary {
    pub total_statuses: u64,
    pub weekday: Vec<Bucket>,
    pub hours: Vec<Bucket>,
}

/// One area of a reference dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population: Option<f64>,
}

/// An externally indexed, area-keyed numeric dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSeries {
    pub name: String,
    pub entries: BTreeMap<String, ReferenceEntry>,
}

impl ReferenceSeries {
    /// The score column as a plain series.
    pub fn scores(&self) -> AreaSeries {
        self.entries
            .iter()
            .map(|(area, entry)| (area.clone(), entry.score))
            .collect()
    }
}

/// Outcome class of a correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    Computed,
    InsufficientData,
    Degraded,
}

/// Areas dropped while aligning two series, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionCounts {
    /// Present only in the right-hand series.
    pub missing_left: usize,
    /// Present only in the left-hand series.
    pub missing_right: usize,
    /// Either value is zero.
    pub zero: usize,
    /// Either value is NaN or infinite (includes zero-denominator ratios).
    pub non_finite: usize,
}

impl ExclusionCounts {
    pub fn total(&self) -> usize {
        self.missing_left + self.missing_right + self.zero + self.non_finite
    }
}

/// Result of correlating two area series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub status: CorrelationStatus,
    pub coefficient: Option<f64>,
    pub p_value: Option<f64>,
    pub sample_size: usize,
    pub excluded: ExclusionCounts,
}

impl CorrelationResult {
    pub fn is_computed(&self) -> bool {
        self.status == CorrelationStatus::Computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_design_document_round_trip_keeps_unknown_fields() {
        let raw = json!({
            "_id": "_design/api",
            "_rev": "3-abc",
            "language": "javascript",
            "views": {"doc": {"map": "function (doc) { emit(doc._id, 1); }"}},
            "validate_doc_update": "function () {}"
        });

        let doc: DesignDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.name(), "api");
        assert_eq!(doc.rev.as_deref(), Some("3-abc"));
        assert!(doc.views["doc"].reduce.is_none());

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["validate_doc_update"], json!("function () {}"));
        assert!(back["views"]["doc"].get("reduce").is_none());
    }

    #[test]
    fn test_row_partition() {
        let mut row = IndexRow::new(json!("storm"), json!(1));
        assert_eq!(row.partition(), None);

        row.id = Some("20605:1262563".to_string());
        assert_eq!(row.partition(), Some("20605"));
    }

    #[test]
    fn test_sentiment_class_from_key() {
        assert_eq!(SentimentClass::from_key(&json!("Positive")), Some(SentimentClass::Positive));
        assert_eq!(SentimentClass::from_key(&json!(-1)), Some(SentimentClass::Negative));
        assert_eq!(SentimentClass::from_key(&json!(0)), Some(SentimentClass::Neutral));
        assert_eq!(SentimentClass::from_key(&json!("angry")), None);
        assert_eq!(SentimentClass::from_key(&json!(null)), None);
    }

    #[test]
    fn test_positivity_ratio() {
        let counts = SentimentCounts {
            positive: 3,
            negative: 1,
            neutral: 10,
        };
        assert_eq!(counts.positivity_ratio(), 0.75);
        assert_eq!(counts.total(), 14);

        let only_neutral = SentimentCounts {
            neutral: 4,
            ..SentimentCounts::default()
        };
        assert!(only_neutral.positivity_ratio().is_nan());
    }

    #[test]
    fn test_activity_category_index() {
        assert_eq!(ActivityCategory::Cricket.index(), 0);
        assert_eq!(ActivityCategory::Exercise.index(), 5);
        assert_eq!(ActivityCategory::ALL.len(), 6);
    }
}
