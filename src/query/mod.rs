//! Aggregation query layer.
//!
//! Every operation queries one declared view and folds its rows into a
//! plain serializable mapping or sequence. Queries are only possible once
//! the views have been verified by a synchronization run.

use crate::analysis::{
    area_key, as_count, composite_key, count_value, group_and_merge, top_k, vector_value,
    RowDiagnostics,
};
use crate::config::{QueryConfig, ViewsConfig};
use crate::error::{QueryError, StoreError};
use crate::models::{
    ActivityCategory, AreaCounts, Bucket, CorpusSummary, HashtagCount, IndexRow, QueryOptions,
    SentimentClass, SentimentCounts, ViewId,
};
use crate::store::DocumentStore;
use crate::views::VerifiedViews;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Trim and lower-case a keyword. Blank and absent keywords both become `None`.
pub fn normalize_keyword(keyword: Option<&str>) -> Option<String> {
    keyword
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
}

/// Read-only analytical queries over the verified views.
pub struct AggregationQueries {
    store: Arc<dyn DocumentStore>,
    verified: VerifiedViews,
    views: ViewsConfig,
    config: QueryConfig,
    diagnostics: RowDiagnostics,
}

impl AggregationQueries {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        verified: VerifiedViews,
        views: ViewsConfig,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            verified,
            views,
            config,
            diagnostics: RowDiagnostics::new(),
        }
    }

    /// Malformed rows skipped by any query so far.
    pub fn diagnostics(&self) -> &RowDiagnostics {
        &self.diagnostics
    }

    fn global_view(&self, view: &str) -> ViewId {
        ViewId::new(&self.views.database, &self.views.global_design, view)
    }

    fn partitioned_view(&self, view: &str) -> ViewId {
        ViewId::new(&self.views.database, &self.views.partitioned_design, view)
    }

    async fn query(
        &self,
        view: &ViewId,
        options: QueryOptions,
    ) -> Result<Vec<IndexRow>, QueryError> {
        if !self.verified.contains(view) {
            return Err(QueryError::IndexUnavailable(view.clone()));
        }

        let options = options.stale(self.config.stale_ok);
        debug!("Querying {} with {:?}", view, options);

        self.store
            .query_index(&view.database, &view.design, &view.view, &options)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => QueryError::IndexUnavailable(view.clone()),
                other => QueryError::Store(other),
            })
    }

    /// Number of statuses per area. Areas with a zero count are omitted.
    pub async fn count_by_area(&self) -> Result<AreaCounts, QueryError> {
        let view = self.global_view(&self.views.count);
        let rows = self.query(&view, QueryOptions::grouped()).await?;

        let grouped = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| Ok((area_key(&row.key)?, count_value(&row.value)?)),
            |total: &mut u64, n| *total += n,
        );

        Ok(grouped.into_iter().filter(|(_, n)| *n > 0).collect())
    }

    /// Number of statuses mentioning `keyword`, per area.
    pub async fn keyword_count_all_areas(&self, keyword: &str) -> Result<AreaCounts, QueryError> {
        let keyword = normalize_keyword(Some(keyword)).ok_or(QueryError::EmptyKeyword)?;
        let view = self.global_view(&self.views.keyword);
        let options =
            QueryOptions::grouped().range(json!([keyword]), json!([keyword, {}]));
        let rows = self.query(&view, options).await?;

        let grouped = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| {
                let parts = composite_key(&row.key, 2)?;
                if parts[0].as_str() != Some(keyword.as_str()) {
                    return Err(format!("row outside the range of '{}'", keyword));
                }
                Ok((area_key(&parts[1])?, count_value(&row.value)?))
            },
            |total: &mut u64, n| *total += n,
        );

        Ok(grouped.into_iter().collect())
    }

    /// Up to `limit` statuses of one area, optionally filtered by keyword.
    ///
    /// Without a keyword the unfiltered document index of the partition is
    /// used. Documents from any other partition are never returned.
    pub async fn keyword_documents_in_area(
        &self,
        keyword: Option<&str>,
        area: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, QueryError> {
        let area = area.trim();
        if area.is_empty() {
            return Err(QueryError::MissingArea);
        }
        let limit = limit.unwrap_or(self.config.documents_limit);

        let (view, options) = match normalize_keyword(keyword) {
            Some(keyword) => (
                self.partitioned_view(&self.views.keyword),
                QueryOptions::unreduced().key(json!(keyword)),
            ),
            None => (
                self.partitioned_view(&self.views.documents),
                QueryOptions::unreduced(),
            ),
        };
        let options = options.partition(Some(area)).include_docs().limit(limit);
        let rows = self.query(&view, options).await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            if row.partition() != Some(area) {
                debug!("Dropping row {:?} outside partition {}", row.id, area);
                continue;
            }
            match row.doc {
                Some(doc) => documents.push(doc),
                None => self.diagnostics.record(&view, &row, "row has no document"),
            }
        }
        documents.truncate(limit);

        Ok(documents)
    }

    /// Most frequent hashtags, overall or within one area.
    pub async fn top_hashtags(&self, area: Option<&str>) -> Result<Vec<HashtagCount>, QueryError> {
        let area = area.map(str::trim).filter(|a| !a.is_empty());
        let (view, k) = match area {
            Some(_) => (self.partitioned_view(&self.views.hashtags), self.config.top_k_area),
            None => (self.global_view(&self.views.hashtags), self.config.top_k_global),
        };
        let rows = self
            .query(&view, QueryOptions::unreduced().partition(area))
            .await?;

        let tallied = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| match row.key.as_str() {
                Some(tag) if !tag.is_empty() => Ok((tag.to_string(), ())),
                _ => Err("expected a hashtag key".to_string()),
            },
            |frequency: &mut u64, ()| *frequency += 1,
        );

        Ok(top_k(tallied, k))
    }

    /// Positive, negative and neutral status counts per area.
    pub async fn sentiment_by_area(&self) -> Result<BTreeMap<String, SentimentCounts>, QueryError> {
        let view = self.global_view(&self.views.sentiment);
        let rows = self.query(&view, QueryOptions::grouped()).await?;

        let grouped = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| {
                let parts = composite_key(&row.key, 2)?;
                let area = area_key(&parts[0])?;
                let class = SentimentClass::from_key(&parts[1])
                    .ok_or_else(|| format!("unknown sentiment class {}", parts[1]))?;
                Ok((area, (class, count_value(&row.value)?)))
            },
            |record: &mut SentimentCounts, (class, n)| record.add(class, n),
        );

        Ok(grouped.into_iter().collect())
    }

    /// Activity mentions per area, for one category or all of them.
    pub async fn activity_by_area(
        &self,
        category: Option<ActivityCategory>,
    ) -> Result<AreaCounts, QueryError> {
        let view = self.global_view(&self.views.activity);
        let rows = self.query(&view, QueryOptions::grouped()).await?;

        let grouped = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| {
                let area = area_key(&row.key)?;
                let vector = vector_value(&row.value, ActivityCategory::ALL.len())?;
                let count = match category {
                    Some(category) => vector[category.index()],
                    None => vector.iter().sum(),
                };
                Ok((area, as_count(count)?))
            },
            |total: &mut u64, n| *total += n,
        );

        Ok(grouped.into_iter().collect())
    }

    /// Corpus-wide totals with weekday and hour distributions.
    pub async fn summary(&self) -> Result<CorpusSummary, QueryError> {
        let (total_statuses, weekday, hours) =
            futures::try_join!(self.total_statuses(), self.weekday(), self.hours())?;

        Ok(CorpusSummary {
            total_statuses,
            weekday,
            hours,
        })
    }

    async fn total_statuses(&self) -> Result<u64, QueryError> {
        let view = self.global_view(&self.views.count);
        let options = QueryOptions {
            reduce: Some(true),
            ..QueryOptions::default()
        };
        let rows = self.query(&view, options).await?;

        let mut total = 0;
        for row in rows {
            match count_value(&row.value) {
                Ok(n) => total += n,
                Err(reason) => self.diagnostics.record(&view, &row, &reason),
            }
        }
        Ok(total)
    }

    async fn weekday(&self) -> Result<Vec<Bucket>, QueryError> {
        let view = self.global_view(&self.views.weekday);
        let rows = self.query(&view, QueryOptions::grouped()).await?;

        let mut days = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| {
                let day = row
                    .key
                    .as_str()
                    .and_then(|day| WEEKDAYS.iter().position(|d| *d == day))
                    .ok_or_else(|| format!("unknown weekday {}", row.key))?;
                Ok((day, count_value(&row.value)?))
            },
            |total: &mut u64, n| *total += n,
        );
        days.sort_by_key(|(day, _)| *day);

        Ok(days
            .into_iter()
            .map(|(day, count)| Bucket {
                label: WEEKDAYS[day].to_string(),
                count,
            })
            .collect())
    }

    async fn hours(&self) -> Result<Vec<Bucket>, QueryError> {
        let view = self.global_view(&self.views.hour);
        let rows = self.query(&view, QueryOptions::grouped()).await?;

        let mut hours = group_and_merge(
            rows,
            &self.diagnostics,
            &view,
            |row| {
                let hour = row
                    .key
                    .as_u64()
                    .filter(|h| *h < 24)
                    .ok_or_else(|| format!("expected an hour of the day, got {}", row.key))?;
                Ok((hour, count_value(&row.value)?))
            },
            |total: &mut u64, n| *total += n,
        );
        hours.sort_by_key(|(hour, _)| *hour);

        Ok(hours
            .into_iter()
            .map(|(hour, count)| Bucket {
                label: hour.to_string(),
                count,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{IndexDefinition, IndexSpec};
    use crate::store::memory::MemoryStore;
    use crate::views::{Synchronizer, ViewRegistry};

    const DB: &str = "statuses";

    fn definition(design: &str, view: &str, reduce: Option<&str>) -> IndexDefinition {
        IndexDefinition {
            id: ViewId::new(DB, design, view),
            spec: IndexSpec::new(
                format!("function (doc) {{ /* {} */ }}", view),
                reduce.map(str::to_string),
            ),
        }
    }

    /// Every view the query layer uses, with the default names.
    pub(crate) fn registry() -> ViewRegistry {
        ViewRegistry::from_definitions(vec![
            definition("api-global", "count-area", Some("_count")),
            definition("api-global", "keyword", Some("_count")),
            definition("api-global", "hashtags", None),
            definition("api-global", "sentiment", Some("_count")),
            definition("api-global", "sports-exercise", Some("_sum")),
            definition("api-global", "weekday", Some("_count")),
            definition("api-global", "hour", Some("_count")),
            definition("api", "keyword", Some("_count")),
            definition("api", "doc", None),
            definition("api", "hashtags", None),
        ])
        .unwrap()
    }

    /// Synchronize `registry` into `store` and build the query layer on top.
    pub(crate) async fn queries_for(
        store: Arc<MemoryStore>,
        registry: &ViewRegistry,
    ) -> AggregationQueries {
        let report = Synchronizer::new(store.as_ref(), registry).run().await;
        assert!(report.is_clean());
        AggregationQueries::new(
            store,
            report.into_verified(),
            ViewsConfig::default(),
            QueryConfig::default(),
        )
    }

    fn global(view: &str) -> ViewId {
        ViewId::new(DB, "api-global", view)
    }

    fn partitioned(view: &str) -> ViewId {
        ViewId::new(DB, "api", view)
    }

    #[test]
    fn test_normalize_keyword() {
        assert_eq!(normalize_keyword(Some("  Storm ")), Some("storm".to_string()));
        assert_eq!(normalize_keyword(Some("   ")), None);
        assert_eq!(normalize_keyword(Some("")), None);
        assert_eq!(normalize_keyword(None), None);
    }

    #[tokio::test]
    async fn test_count_by_area() {
        let store = Arc::new(MemoryStore::new());
        store.emit(&global("count-area"), "A:1", json!("A"), json!(1));
        store.emit(&global("count-area"), "A:2", json!("A"), json!(1));
        store.emit(&global("count-area"), "B:3", json!("B"), json!(1));
        let queries = queries_for(store, &registry()).await;

        let counts = queries.count_by_area().await.unwrap();

        assert_eq!(counts, AreaCounts::from([("A".to_string(), 2), ("B".to_string(), 1)]));
    }

    #[tokio::test]
    async fn test_keyword_count_all_areas() {
        let store = Arc::new(MemoryStore::new());
        let view = global("keyword");
        store.emit(&view, "A:1", json!(["storm", "A"]), json!(1));
        store.emit(&view, "A:2", json!(["storm", "A"]), json!(1));
        store.emit(&view, "B:3", json!(["storm", "B"]), json!(1));
        store.emit(&view, "B:3", json!(["stormy", "B"]), json!(1));
        store.emit(&view, "C:4", json!(["rain", "C"]), json!(1));
        store.emit(&view, "C:5", json!(["storm"]), json!(1));
        store.emit(&view, "A:6", json!(["storm", "A", "junk"]), json!(1));
        let queries = queries_for(store, &registry()).await;

        let counts = queries.keyword_count_all_areas(" Storm").await.unwrap();

        assert_eq!(counts, AreaCounts::from([("A".to_string(), 2), ("B".to_string(), 1)]));
        // Keys that are too short or too long are malformed and skipped.
        assert_eq!(queries.diagnostics().malformed(), 2);
    }

    #[tokio::test]
    async fn test_keyword_count_rejects_blank_keyword() {
        let store = Arc::new(MemoryStore::new());
        let queries = queries_for(store, &registry()).await;

        let result = queries.keyword_count_all_areas("  ").await;
        assert!(matches!(result, Err(QueryError::EmptyKeyword)));
    }

    #[tokio::test]
    async fn test_keyword_documents_stay_in_partition() {
        let store = Arc::new(MemoryStore::new());
        let view = partitioned("keyword");
        for (id, area) in [("A:1", "A"), ("B:2", "B"), ("A:3", "A"), ("A:4", "A")] {
            store.emit_doc(&view, id, json!("storm"), json!(1), json!({ "_id": id, "area": area }));
        }
        store.emit(&partitioned("doc"), "A:9", json!("A:9"), json!(null));
        store.emit(&partitioned("doc"), "B:8", json!("B:8"), json!(null));
        let queries = queries_for(store, &registry()).await;

        let docs = queries
            .keyword_documents_in_area(Some("storm"), "A", Some(2))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|doc| doc["area"] == json!("A")));

        // A blank keyword falls back to the unfiltered document index.
        let docs = queries
            .keyword_documents_in_area(Some(" "), "B", None)
            .await
            .unwrap();
        assert_eq!(docs, vec![json!({ "_id": "B:8" })]);
    }

    #[tokio::test]
    async fn test_rows_from_other_partitions_dropped() {
        // The store ignores the partition and returns every row.
        let store = Arc::new(MemoryStore::new().leaking_partitions());
        let view = partitioned("keyword");
        store.emit(&view, "A:1", json!("storm"), json!(1));
        store.emit(&view, "B:2", json!("storm"), json!(1));
        store.emit(&view, "A:3", json!("storm"), json!(1));
        let queries = queries_for(store, &registry()).await;

        let docs = queries
            .keyword_documents_in_area(Some("storm"), "A", None)
            .await
            .unwrap();

        assert_eq!(docs, vec![json!({ "_id": "A:1" }), json!({ "_id": "A:3" })]);
        assert_eq!(queries.diagnostics().malformed(), 0);
    }

    #[tokio::test]
    async fn test_keyword_documents_requires_area() {
        let store = Arc::new(MemoryStore::new());
        let queries = queries_for(store, &registry()).await;

        let result = queries.keyword_documents_in_area(Some("storm"), " ", None).await;
        assert!(matches!(result, Err(QueryError::MissingArea)));
    }

    #[tokio::test]
    async fn test_top_hashtags_ties_and_truncation() {
        let store = Arc::new(MemoryStore::new());
        let view = global("hashtags");
        // Keys collate alphabetically, so first-seen order is alphabetical.
        for (id, tag) in [
            ("A:1", "#afl"),
            ("A:2", "#ashes"),
            ("A:3", "#ashes"),
            ("B:4", "#bbl"),
            ("B:5", "#covid"),
            ("B:6", "#covid"),
            ("B:7", "#footy"),
        ] {
            store.emit(&view, id, json!(tag), json!(1));
        }
        for (id, tag) in [
            ("A:1", "#afl"),
            ("A:2", "#ashes"),
            ("A:3", "#ashes"),
            ("A:8", "#bbl"),
            ("A:9", "#cats"),
        ] {
            store.emit(&partitioned("hashtags"), id, json!(tag), json!(1));
        }
        let queries = queries_for(store, &registry()).await;

        let global = queries.top_hashtags(None).await.unwrap();
        let tags: Vec<(&str, u64)> = global
            .iter()
            .map(|h| (h.hashtag.as_str(), h.frequency))
            .collect();
        assert_eq!(
            tags,
            vec![("#ashes", 2), ("#covid", 2), ("#afl", 1), ("#bbl", 1), ("#footy", 1)]
        );

        let area = queries.top_hashtags(Some("A")).await.unwrap();
        let tags: Vec<&str> = area.iter().map(|h| h.hashtag.as_str()).collect();
        assert_eq!(tags, vec!["#ashes", "#afl", "#bbl"]);
    }

    #[tokio::test]
    async fn test_sentiment_by_area() {
        let store = Arc::new(MemoryStore::new());
        let view = global("sentiment");
        store.emit(&view, "A:1", json!(["A", 1]), json!(1));
        store.emit(&view, "A:2", json!(["A", 1]), json!(1));
        store.emit(&view, "A:3", json!(["A", -1]), json!(1));
        store.emit(&view, "B:4", json!(["B", 0]), json!(1));
        store.emit(&view, "B:5", json!(["B", "negative"]), json!(1));
        store.emit(&view, "A:6", json!(["A", "positive", "junk"]), json!(1));
        let queries = queries_for(store, &registry()).await;

        let sentiment = queries.sentiment_by_area().await.unwrap();

        assert_eq!(sentiment["A"], SentimentCounts { positive: 2, negative: 1, neutral: 0 });
        assert_eq!(sentiment["B"], SentimentCounts { positive: 0, negative: 1, neutral: 1 });
        assert_eq!(queries.diagnostics().malformed(), 1);
    }

    #[tokio::test]
    async fn test_activity_by_area() {
        let store = Arc::new(MemoryStore::new());
        let view = global("sports-exercise");
        store.emit(&view, "A:1", json!("A"), json!([1, 0, 0, 0, 0, 1]));
        store.emit(&view, "A:2", json!("A"), json!([0, 0, 2, 0, 0, 0]));
        store.emit(&view, "B:3", json!("B"), json!([0, 0, 0, 0, 3, 0]));
        let queries = queries_for(store, &registry()).await;

        let all = queries.activity_by_area(None).await.unwrap();
        assert_eq!(all, AreaCounts::from([("A".to_string(), 4), ("B".to_string(), 3)]));

        let footy = queries.activity_by_area(Some(ActivityCategory::Footy)).await.unwrap();
        assert_eq!(footy, AreaCounts::from([("A".to_string(), 2), ("B".to_string(), 0)]));
    }

    #[tokio::test]
    async fn test_summary_orders_buckets() {
        let store = Arc::new(MemoryStore::new());
        for (id, area) in [("A:1", "A"), ("A:2", "A"), ("B:3", "B")] {
            store.emit(&global("count-area"), id, json!(area), json!(1));
        }
        store.emit(&global("weekday"), "A:1", json!("Sun"), json!("Sun"));
        store.emit(&global("weekday"), "A:2", json!("Mon"), json!("Mon"));
        store.emit(&global("weekday"), "B:3", json!("Mon"), json!("Mon"));
        store.emit(&global("hour"), "A:1", json!(23), json!(23));
        store.emit(&global("hour"), "A:2", json!(7), json!(7));
        store.emit(&global("hour"), "B:3", json!(7), json!(7));
        let queries = queries_for(store, &registry()).await;

        let summary = queries.summary().await.unwrap();

        assert_eq!(summary.total_statuses, 3);
        let days: Vec<(&str, u64)> = summary
            .weekday
            .iter()
            .map(|b| (b.label.as_str(), b.count))
            .collect();
        assert_eq!(days, vec![("Mon", 2), ("Sun", 1)]);
        let hours: Vec<(&str, u64)> = summary
            .hours
            .iter()
            .map(|b| (b.label.as_str(), b.count))
            .collect();
        assert_eq!(hours, vec![("7", 2), ("23", 1)]);
    }

    #[tokio::test]
    async fn test_unverified_index_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let registry = ViewRegistry::from_definitions(vec![definition(
            "api-global",
            "count-area",
            Some("_count"),
        )])
        .unwrap();
        let queries = queries_for(store, &registry).await;

        let result = queries.sentiment_by_area().await;
        assert!(matches!(
            result,
            Err(QueryError::IndexUnavailable(id)) if id == global("sentiment")
        ));
    }

    #[tokio::test]
    async fn test_index_removed_from_store_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let queries = queries_for(store.clone(), &registry()).await;

        // Someone replaced the design document after the sync pass.
        store.seed_design(DB, crate::models::DesignDocument::new("api-global"));

        let result = queries.count_by_area().await;
        assert!(matches!(result, Err(QueryError::IndexUnavailable(_))));
    }
}
