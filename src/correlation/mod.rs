//! Correlation pipeline.
//!
//! Two area-keyed series are intersected, cleaned of unusable pairs,
//! min-max normalised and handed to a [`Correlator`]. Every dropped area is
//! counted by reason in the result.

pub mod backend;

use crate::error::{ReferenceError, ReportError};
use crate::models::{
    ActivityCategory, AreaCounts, AreaSeries, CorrelationResult, CorrelationStatus,
    ExclusionCounts, SentimentCounts,
};
use crate::query::AggregationQueries;
use crate::reference::ReferenceCache;
use clap::ValueEnum;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

pub use backend::{Correlator, SubprocessCorrelator};

/// Fewest aligned areas worth correlating.
pub const MIN_SAMPLE_SIZE: usize = 2;

/// Two series restricted to the areas usable in both, in area order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Alignment {
    pub areas: Vec<String>,
    pub left: Vec<f64>,
    pub right: Vec<f64>,
    pub excluded: ExclusionCounts,
}

/// Intersect two series and drop pairs that cannot be correlated.
pub fn align(left: &AreaSeries, right: &AreaSeries) -> Alignment {
    let mut alignment = Alignment::default();

    for (area, &l) in left {
        let Some(&r) = right.get(area) else {
            alignment.excluded.missing_right += 1;
            continue;
        };

        if !l.is_finite() || !r.is_finite() {
            alignment.excluded.non_finite += 1;
        } else if l == 0.0 || r == 0.0 {
            alignment.excluded.zero += 1;
        } else {
            alignment.areas.push(area.clone());
            alignment.left.push(l);
            alignment.right.push(r);
        }
    }

    alignment.excluded.missing_left = right.keys().filter(|area| !left.contains_key(*area)).count();
    alignment
}

/// Scale values into `[0, 1]`; a constant series maps to all zeros.
pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    values
        .iter()
        .map(|v| if range > 0.0 { (v - min) / range } else { 0.0 })
        .collect()
}

/// Correlates series through an external [`Correlator`].
pub struct CorrelationPipeline {
    correlator: Arc<dyn Correlator>,
    retries: usize,
}

impl CorrelationPipeline {
    /// `retries` is the number of extra attempts after a timeout.
    pub fn new(correlator: Arc<dyn Correlator>, retries: usize) -> Self {
        Self {
            correlator,
            retries,
        }
    }

    pub async fn correlate(&self, left: &AreaSeries, right: &AreaSeries) -> CorrelationResult {
        self.correlate_aligned(&align(left, right)).await
    }

    /// Correlate an existing alignment.
    ///
    /// Never fails: a collaborator that keeps timing out or errors yields a
    /// degraded result without coefficient or p-value.
    pub async fn correlate_aligned(&self, alignment: &Alignment) -> CorrelationResult {
        let result = |status, coefficient: Option<f64>, p_value: Option<f64>| CorrelationResult {
            status,
            coefficient,
            p_value,
            sample_size: alignment.areas.len(),
            excluded: alignment.excluded,
        };

        if alignment.areas.len() < MIN_SAMPLE_SIZE {
            debug!(
                "Only {} aligned area(s), not correlating ({} excluded)",
                alignment.areas.len(),
                alignment.excluded.total()
            );
            return result(CorrelationStatus::InsufficientData, None, None);
        }

        let left = min_max_normalize(&alignment.left);
        let right = min_max_normalize(&alignment.right);

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            match self.correlator.pearson(&left, &right).await {
                Ok((coefficient, p_value)) if coefficient.is_finite() => {
                    let p_value = p_value.is_finite().then_some(p_value);
                    return result(CorrelationStatus::Computed, Some(coefficient), p_value);
                }
                Ok(_) => {
                    // A constant side has no defined coefficient.
                    debug!("Correlation undefined for {} areas", alignment.areas.len());
                    return result(CorrelationStatus::InsufficientData, None, None);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("{} (attempt {}/{}), retrying", e, attempt, attempts);
                }
                Err(e) => {
                    warn!("Correlation degraded: {}", e);
                    break;
                }
            }
        }

        result(CorrelationStatus::Degraded, None, None)
    }
}

/// Sentiment of one area with its normalised reference scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentAreaRecord {
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub total: u64,
    /// `positive / (positive + negative)`, absent when both are zero.
    pub ratio: Option<f64>,
    /// Reference name to the area's normalised score, for areas that were aligned.
    pub normalised: BTreeMap<String, f64>,
}

/// Sentiment per area correlated against each reference series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentReport {
    pub areas: BTreeMap<String, SentimentAreaRecord>,
    pub correlations: BTreeMap<String, CorrelationResult>,
    /// References that could not be fetched, with the reason.
    pub unavailable: BTreeMap<String, String>,
}

/// Positivity ratio per area; NaN where an area has no polar statuses.
pub fn positivity_ratios(sentiment: &BTreeMap<String, SentimentCounts>) -> AreaSeries {
    sentiment
        .iter()
        .map(|(area, counts)| (area.clone(), counts.positivity_ratio()))
        .collect()
}

/// Fetch sentiment and the reference series concurrently, then correlate
/// the positivity ratio against each reference.
///
/// A reference that fails to load is listed in `unavailable` and left out of
/// the correlations; the sentiment counts are still returned.
pub async fn sentiment_report(
    queries: &AggregationQueries,
    cache: &ReferenceCache,
    pipeline: &CorrelationPipeline,
    references: &[String],
) -> Result<SentimentReport, ReportError> {
    let (sentiment, loaded) = futures::join!(
        queries.sentiment_by_area(),
        join_all(references.iter().map(|name| cache.series(name))),
    );
    let sentiment = sentiment?;

    let mut series = Vec::new();
    let mut unavailable = BTreeMap::new();
    for (name, result) in references.iter().zip(loaded) {
        match result {
            Ok(reference) => series.push(reference),
            Err(e @ ReferenceError::Fetch { .. }) => {
                warn!("Reference '{}' unavailable: {}", name, e);
                unavailable.insert(name.clone(), e.to_string());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let ratios = positivity_ratios(&sentiment);
    let mut areas: BTreeMap<String, SentimentAreaRecord> = sentiment
        .iter()
        .map(|(area, counts)| {
            let ratio = counts.positivity_ratio();
            (
                area.clone(),
                SentimentAreaRecord {
                    positive: counts.positive,
                    negative: counts.negative,
                    neutral: counts.neutral,
                    total: counts.total(),
                    ratio: ratio.is_finite().then_some(ratio),
                    normalised: BTreeMap::new(),
                },
            )
        })
        .collect();

    let mut correlations = BTreeMap::new();
    for reference in &series {
        let alignment = align(&ratios, &reference.scores());

        for (area, score) in alignment.areas.iter().zip(min_max_normalize(&alignment.right)) {
            if let Some(record) = areas.get_mut(area) {
                record.normalised.insert(reference.name.clone(), score);
            }
        }

        let result = pipeline.correlate_aligned(&alignment).await;
        correlations.insert(reference.name.clone(), result);
    }

    Ok(SentimentReport {
        areas,
        correlations,
        unavailable,
    })
}

/// One side of a correlation, as named on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesSource {
    /// Positivity ratio per area.
    Sentiment,
    Counts,
    Activity(Option<ActivityCategory>),
    Keyword(String),
    /// A configured reference dataset.
    Reference(String),
}

impl FromStr for SeriesSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s, None),
        };

        match (kind, arg) {
            ("", _) => Err("series name cannot be empty".to_string()),
            ("sentiment", None) => Ok(SeriesSource::Sentiment),
            ("counts", None) => Ok(SeriesSource::Counts),
            ("activity", None) => Ok(SeriesSource::Activity(None)),
            ("activity", Some(category)) => {
                <ActivityCategory as ValueEnum>::from_str(category, true)
                    .map(|c| SeriesSource::Activity(Some(c)))
                    .map_err(|_| format!("unknown activity category '{}'", category))
            }
            ("keyword", Some(word)) if !word.trim().is_empty() => {
                Ok(SeriesSource::Keyword(word.to_string()))
            }
            ("keyword", _) => Err("keyword series need a word, e.g. keyword:storm".to_string()),
            (name, None) => Ok(SeriesSource::Reference(name.to_string())),
            (name, Some(_)) => Err(format!("series '{}' takes no argument", name)),
        }
    }
}

impl fmt::Display for SeriesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesSource::Sentiment => write!(f, "sentiment"),
            SeriesSource::Counts => write!(f, "counts"),
            SeriesSource::Activity(None) => write!(f, "activity"),
            SeriesSource::Activity(Some(category)) => {
                write!(f, "activity:{}", category.to_string().to_lowercase())
            }
            SeriesSource::Keyword(word) => write!(f, "keyword:{}", word),
            SeriesSource::Reference(name) => write!(f, "{}", name),
        }
    }
}

/// Resolve a [`SeriesSource`] to an area series.
pub async fn load_series(
    source: &SeriesSource,
    queries: &AggregationQueries,
    cache: &ReferenceCache,
) -> Result<AreaSeries, ReportError> {
    let as_series = |counts: AreaCounts| -> AreaSeries {
        counts.into_iter().map(|(area, n)| (area, n as f64)).collect()
    };

    let series = match source {
        SeriesSource::Sentiment => positivity_ratios(&queries.sentiment_by_area().await?),
        SeriesSource::Counts => as_series(queries.count_by_area().await?),
        SeriesSource::Activity(category) => as_series(queries.activity_by_area(*category).await?),
        SeriesSource::Keyword(word) => as_series(queries.keyword_count_all_areas(word).await?),
        SeriesSource::Reference(name) => cache.series(name).await?.scores(),
    };
    Ok(series)
}

/// A correlation between two named series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairCorrelation {
    pub left: String,
    pub right: String,
    #[serde(flatten)]
    pub result: CorrelationResult,
}

/// Load both series concurrently and correlate them.
pub async fn correlate_sources(
    left: &SeriesSource,
    right: &SeriesSource,
    queries: &AggregationQueries,
    cache: &ReferenceCache,
    pipeline: &CorrelationPipeline,
) -> Result<PairCorrelation, ReportError> {
    let (left_series, right_series) = futures::try_join!(
        load_series(left, queries, cache),
        load_series(right, queries, cache),
    )?;

    Ok(PairCorrelation {
        left: left.to_string(),
        right: right.to_string(),
        result: pipeline.correlate(&left_series, &right_series).await,
    })
}
