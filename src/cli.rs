//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::correlation::SeriesSource;
use crate::models::ActivityCategory;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// areascope - view synchronization and area aggregates over CouchDB
///
/// Keeps the declared map/reduce views in sync with their definitions on
/// disk, then answers per-area aggregate queries over them.
///
/// Examples:
///   areascope sync
///   areascope counts --format json
///   areascope keyword storm
///   areascope keyword-docs --area 20605 --keyword storm --limit 5
///   areascope correlate sentiment ieo
///   areascope init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .areascope.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// CouchDB server URL
    #[arg(long, value_name = "URL", env = "AREASCOPE_STORE_URL", global = true)]
    pub store_url: Option<String>,

    /// CouchDB user name
    #[arg(long, env = "AREASCOPE_STORE_USER", global = true)]
    pub user: Option<String>,

    /// CouchDB password
    #[arg(long, env = "AREASCOPE_STORE_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Directory holding the view definitions
    ///
    /// Laid out as <database>/<design>/<view>/map.js with an optional reduce.js
    #[arg(long, value_name = "DIR", global = true)]
    pub definitions: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT", global = true)]
    pub format: OutputFormat,

    /// Write the result to a file instead of stdout
    #[arg(short, long, value_name = "FILE", global = true)]
    pub output: Option<PathBuf>,

    /// Correlation process timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub correlation_timeout: Option<u64>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Subcommands. Every query synchronizes the views first.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Synchronize declared views into the store
    Sync,

    /// Status count per area
    Counts,

    /// Count of statuses mentioning a keyword, per area
    Keyword {
        /// Keyword to count (case-insensitive)
        keyword: String,
    },

    /// Statuses of one area, optionally filtered by keyword
    KeywordDocs {
        /// Area code (partition key)
        #[arg(long)]
        area: String,

        /// Keyword to filter by; omit for any status
        #[arg(long)]
        keyword: Option<String>,

        /// Maximum number of statuses to return
        #[arg(long, value_name = "COUNT")]
        limit: Option<usize>,
    },

    /// Most frequent hashtags, overall or for one area
    Hashtags {
        /// Area code; omit for all areas
        #[arg(long)]
        area: Option<String>,
    },

    /// Sentiment per area correlated with the reference datasets
    Sentiment,

    /// Sport and exercise mentions per area
    Activity {
        /// Single category; omit to sum all categories
        #[arg(long)]
        category: Option<ActivityCategory>,
    },

    /// Correlate two area series
    ///
    /// A series is one of: sentiment, counts, activity[:<category>],
    /// keyword:<word>, or the name of a reference dataset.
    Correlate {
        left: SeriesSource,
        right: SeriesSource,
    },

    /// Corpus totals with weekday and hour distributions
    Summary,

    /// Area boundary features
    Boundaries,

    /// Generate a default .areascope.toml configuration file
    InitConfig,
}

impl Command {
    /// Name used in report titles.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Sync => "sync",
            Command::Counts => "counts",
            Command::Keyword { .. } => "keyword",
            Command::KeywordDocs { .. } => "keyword-docs",
            Command::Hashtags { .. } => "hashtags",
            Command::Sentiment => "sentiment",
            Command::Activity { .. } => "activity",
            Command::Correlate { .. } => "correlate",
            Command::Summary => "summary",
            Command::Boundaries => "boundaries",
            Command::InitConfig => "init-config",
        }
    }
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        // Validate store URL format
        if let Some(ref url) = self.store_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Store URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.correlation_timeout == Some(0) {
            return Err("Correlation timeout must be at least 1 second".to_string());
        }

        match &self.command {
            Command::KeywordDocs { area, limit, .. } => {
                if area.trim().is_empty() {
                    return Err("--area cannot be empty".to_string());
                }
                if *limit == Some(0) {
                    return Err("--limit must be at least 1".to_string());
                }
            }
            Command::Keyword { keyword } if keyword.trim().is_empty() => {
                return Err("Keyword cannot be empty".to_string());
            }
            _ => {}
        }

        // Validate definitions directory if provided
        if let Some(ref dir) = self.definitions {
            if !dir.is_dir() {
                return Err(format!(
                    "Definitions directory does not exist: {}",
                    dir.display()
                ));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
