//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.areascope.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".areascope.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Document store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// View synchronization settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Names of the views the query layer reads.
    #[serde(default)]
    pub views: ViewsConfig,

    /// Query behaviour.
    #[serde(default)]
    pub query: QueryConfig,

    /// Area boundary geometry.
    #[serde(default)]
    pub boundaries: BoundariesConfig,

    /// Reference datasets, keyed by series name.
    #[serde(default = "default_references")]
    pub reference: BTreeMap<String, ReferenceConfig>,

    /// External correlation process.
    #[serde(default)]
    pub correlation: CorrelationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            views: ViewsConfig::default(),
            query: QueryConfig::default(),
            boundaries: BoundariesConfig::default(),
            reference: default_references(),
            correlation: CorrelationConfig::default(),
        }
    }
}

/// CouchDB connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Server URL, e.g. `http://localhost:5984`.
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            username: None,
            password: None,
            timeout_seconds: default_store_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:5984".to_string()
}

fn default_store_timeout() -> u64 {
    60
}

/// View synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root of the `<database>/<design>/<view>/map.js` tree.
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            definitions_dir: default_definitions_dir(),
        }
    }
}

fn default_definitions_dir() -> PathBuf {
    PathBuf::from("couch")
}

/// Database, design document and view names used by the query layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(default = "default_database")]
    pub database: String,

    /// Partitioned design document.
    #[serde(default = "default_partitioned_design")]
    pub partitioned_design: String,

    /// Global (non-partitioned) design document.
    #[serde(default = "default_global_design")]
    pub global_design: String,

    #[serde(default = "default_count_view")]
    pub count: String,

    #[serde(default = "default_keyword_view")]
    pub keyword: String,

    #[serde(default = "default_documents_view")]
    pub documents: String,

    #[serde(default = "default_hashtags_view")]
    pub hashtags: String,

    #[serde(default = "default_sentiment_view")]
    pub sentiment: String,

    #[serde(default = "default_activity_view")]
    pub activity: String,

    #[serde(default = "default_weekday_view")]
    pub weekday: String,

    #[serde(default = "default_hour_view")]
    pub hour: String,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            partitioned_design: default_partitioned_design(),
            global_design: default_global_design(),
            count: default_count_view(),
            keyword: default_keyword_view(),
            documents: default_documents_view(),
            hashtags: default_hashtags_view(),
            sentiment: default_sentiment_view(),
            activity: default_activity_view(),
            weekday: default_weekday_view(),
            hour: default_hour_view(),
        }
    }
}

fn default_database() -> String {
    "statuses".to_string()
}

fn default_partitioned_design() -> String {
    "api".to_string()
}

fn default_global_design() -> String {
    "api-global".to_string()
}

fn default_count_view() -> String {
    "count-area".to_string()
}

fn default_keyword_view() -> String {
    "keyword".to_string()
}

fn default_documents_view() -> String {
    "doc".to_string()
}

fn default_hashtags_view() -> String {
    "hashtags".to_string()
}

fn default_sentiment_view() -> String {
    "sentiment".to_string()
}

fn default_activity_view() -> String {
    "sports-exercise".to_string()
}

fn default_weekday_view() -> String {
    "weekday".to_string()
}

fn default_hour_view() -> String {
    "hour".to_string()
}

/// Query behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Accept views that lag behind recent writes.
    #[serde(default = "default_true")]
    pub stale_ok: bool,

    /// Hashtags returned corpus-wide.
    #[serde(default = "default_top_k_global")]
    pub top_k_global: usize,

    /// Hashtags returned for a single area.
    #[serde(default = "default_top_k_area")]
    pub top_k_area: usize,

    /// Default number of documents returned for an area.
    #[serde(default = "default_documents_limit")]
    pub documents_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_ok: true,
            top_k_global: default_top_k_global(),
            top_k_area: default_top_k_area(),
            documents_limit: default_documents_limit(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_top_k_global() -> usize {
    10
}

fn default_top_k_area() -> usize {
    3
}

fn default_documents_limit() -> usize {
    5
}

/// Area codes that stand for "somewhere" or "nowhere" rather than a real area.
pub fn default_sentinel_areas() -> Vec<String> {
    vec!["0", "1", "australia", "out_of_australia"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Area boundary geometry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundariesConfig {
    #[serde(default = "default_boundaries_database")]
    pub database: String,

    #[serde(default = "default_sentinel_areas")]
    pub excluded_areas: Vec<String>,
}

impl Default for BoundariesConfig {
    fn default() -> Self {
        Self {
            database: default_boundaries_database(),
            excluded_areas: default_sentinel_areas(),
        }
    }
}

fn default_boundaries_database() -> String {
    "areas".to_string()
}

/// One reference dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub database: String,

    #[serde(default = "default_area_field")]
    pub area_field: String,

    pub score_field: String,

    #[serde(default = "default_population_field")]
    pub population_field: String,

    #[serde(default = "default_sentinel_areas")]
    pub excluded_areas: Vec<String>,
}

impl ReferenceConfig {
    pub fn new(database: &str, score_field: &str) -> Self {
        Self {
            database: database.to_string(),
            area_field: default_area_field(),
            score_field: score_field.to_string(),
            population_field: default_population_field(),
            excluded_areas: default_sentinel_areas(),
        }
    }
}

fn default_area_field() -> String {
    "SA2_id".to_string()
}

fn default_population_field() -> String {
    "population".to_string()
}

fn default_references() -> BTreeMap<String, ReferenceConfig> {
    let mut references = BTreeMap::new();
    references.insert("ieo".to_string(), ReferenceConfig::new("aurin_ieo", "ieo_score"));
    references.insert("ier".to_string(), ReferenceConfig::new("aurin_ier", "ier_score"));
    references
}

/// External correlation process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Program to run.
    #[serde(default = "default_correlation_command")]
    pub command: String,

    /// Arguments passed to the program.
    #[serde(default = "default_correlation_args")]
    pub args: Vec<String>,

    /// Time allowed per attempt, in seconds.
    #[serde(default = "default_correlation_timeout")]
    pub timeout_seconds: u64,

    /// Extra attempts after a timeout.
    #[serde(default = "default_correlation_retries")]
    pub retries: usize,

    /// Reference series correlated against the sentiment ratio.
    #[serde(default = "default_sentiment_references")]
    pub sentiment_references: Vec<String>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            command: default_correlation_command(),
            args: default_correlation_args(),
            timeout_seconds: default_correlation_timeout(),
            retries: default_correlation_retries(),
            sentiment_references: default_sentiment_references(),
        }
    }
}

fn default_correlation_command() -> String {
    "python3".to_string()
}

fn default_correlation_args() -> Vec<String> {
    vec!["analysis/corr.py".to_string()]
}

fn default_correlation_timeout() -> u64 {
    30
}

fn default_correlation_retries() -> usize {
    1
}

fn default_sentiment_references() -> Vec<String> {
    vec!["ieo".to_string(), "ier".to_string()]
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments (and their environment variables) take precedence over
    /// config file settings, but only when they were actually provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref url) = args.store_url {
            self.store.url = url.clone();
        }
        if let Some(ref user) = args.user {
            self.store.username = Some(user.clone());
        }
        if let Some(ref password) = args.password {
            self.store.password = Some(password.clone());
        }
        if let Some(ref dir) = args.definitions {
            self.sync.definitions_dir = dir.clone();
        }
        if let Some(timeout) = args.correlation_timeout {
            self.correlation.timeout_seconds = timeout;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
