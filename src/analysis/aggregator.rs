//! Row aggregation utilities.
//!
//! Index rows come back from the store as loosely typed JSON. This module
//! turns them into typed per-key aggregates with a single fold, skipping
//! rows whose shape does not match and counting them as malformed.

use crate::models::{HashtagCount, IndexRow, ViewId};
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Counts rows skipped because their key or value had an unexpected shape.
#[derive(Debug, Default)]
pub struct RowDiagnostics {
    malformed: AtomicU64,
}

impl RowDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and count one malformed row.
    pub fn record(&self, view: &ViewId, row: &IndexRow, reason: &str) {
        warn!(
            "Skipping malformed row from {} (key {}, value {}): {}",
            view, row.key, row.value, reason
        );
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed rows seen so far.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Fold rows into one aggregate per key.
///
/// `split` extracts the grouping key and the contribution of a row, or
/// explains why the row is malformed. `merge` adds a contribution to the
/// key's aggregate, starting from `A::default()`. Keys are returned in the
/// order they were first seen.
pub fn group_and_merge<K, V, A, S, M>(
    rows: impl IntoIterator<Item = IndexRow>,
    diagnostics: &RowDiagnostics,
    view: &ViewId,
    mut split: S,
    mut merge: M,
) -> Vec<(K, A)>
where
    K: Eq + Hash + Clone,
    A: Default,
    S: FnMut(&IndexRow) -> Result<(K, V), String>,
    M: FnMut(&mut A, V),
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut grouped: Vec<(K, A)> = Vec::new();

    for row in rows {
        let (key, contribution) = match split(&row) {
            Ok(parts) => parts,
            Err(reason) => {
                diagnostics.record(view, &row, &reason);
                continue;
            }
        };

        let position = *positions.entry(key.clone()).or_insert_with(|| {
            grouped.push((key, A::default()));
            grouped.len() - 1
        });
        merge(&mut grouped[position].1, contribution);
    }

    grouped
}

/// An area code key. Numeric codes are accepted and rendered as strings.
pub fn area_key(key: &Value) -> Result<String, String> {
    match key {
        Value::String(area) if !area.is_empty() => Ok(area.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("expected an area code, got {}", other)),
    }
}

/// A composite array key with exactly `arity` components.
pub fn composite_key(key: &Value, arity: usize) -> Result<&[Value], String> {
    match key {
        Value::Array(parts) if parts.len() == arity => Ok(parts),
        other => Err(format!("expected an array key of {} components, got {}", arity, other)),
    }
}

/// A reduced count: a non-negative integer.
pub fn count_value(value: &Value) -> Result<u64, String> {
    if let Some(count) = value.as_u64() {
        return Ok(count);
    }
    value
        .as_f64()
        .ok_or_else(|| format!("expected a count, got {}", value))
        .and_then(as_count)
}

/// A float that must hold a whole, non-negative count.
pub fn as_count(value: f64) -> Result<u64, String> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Ok(value as u64)
    } else {
        Err(format!("expected a count, got {}", value))
    }
}

/// A numeric vector of exactly `len` elements.
pub fn vector_value(value: &Value, len: usize) -> Result<Vec<f64>, String> {
    let items = value
        .as_array()
        .filter(|items| items.len() == len)
        .ok_or_else(|| format!("expected a vector of {} numbers, got {}", len, value))?;

    items
        .iter()
        .map(|item| {
            item.as_f64()
                .ok_or_else(|| format!("non-numeric vector element {}", item))
        })
        .collect()
}

/// The `k` most frequent entries, ties kept in input order.
pub fn top_k(counts: Vec<(String, u64)>, k: usize) -> Vec<HashtagCount> {
    let mut counts = counts;
    // sort_by is stable.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(k)
        .map(|(hashtag, frequency)| HashtagCount { hashtag, frequency })
        .collect()
}
