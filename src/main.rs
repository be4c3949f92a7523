//! areascope - view synchronization and per-area aggregates over CouchDB
//!
//! Keeps declared map/reduce views in sync with their definitions on disk
//! and answers aggregate queries over them, merged per area and correlated
//! against reference datasets.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (connection, config, unavailable index, etc.)
//!   2 - At least one database failed to synchronize

mod analysis;
mod cli;
mod config;
mod correlation;
mod error;
mod models;
mod query;
mod reference;
mod report;
mod store;
mod views;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, Command, OutputFormat};
use config::{Config, DEFAULT_CONFIG_FILE};
use correlation::{CorrelationPipeline, SubprocessCorrelator};
use query::AggregationQueries;
use reference::ReferenceCache;
use report::{Report, ReportMetadata};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use store::{CouchStore, DocumentStore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use views::{SyncReport, Synchronizer, ViewRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if args.command == Command::InitConfig {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args)?;

    info!("areascope v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args.command);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .areascope.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to point at your store, views and reference datasets.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Synchronize the views, then run the requested command. Returns the exit code.
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let registry = ViewRegistry::load_dir(&config.sync.definitions_dir).with_context(|| {
        format!(
            "Failed to load view definitions from {}",
            config.sync.definitions_dir.display()
        )
    })?;
    if registry.is_empty() {
        warn!(
            "No view definitions found under {}",
            config.sync.definitions_dir.display()
        );
    } else {
        info!(
            "Loaded {} view definition(s) from {}",
            registry.len(),
            config.sync.definitions_dir.display()
        );
    }

    let store: Arc<dyn DocumentStore> =
        Arc::new(CouchStore::new(&config.store).context("Failed to create store client")?);

    // Step 1: the startup barrier
    if !args.quiet {
        eprintln!("🔄 Synchronizing views at {}", config.store.url);
    }
    let sync_report = Synchronizer::new(store.as_ref(), &registry)
        .with_progress(!args.quiet)
        .run()
        .await;
    report_sync_failures(&sync_report);
    let sync_clean = sync_report.is_clean();
    info!(
        "{} view(s) verified, {} design document(s) written",
        sync_report.verified().len(),
        sync_report.writes()
    );

    let output = Output {
        args: &args,
        store_url: &config.store.url,
        start_time,
    };

    if args.command == Command::Sync {
        output.emit(&sync_report.summary(), 0)?;
        return Ok(if sync_clean { 0 } else { 2 });
    }

    // Step 2: the engines, built from what sync verified
    if sync_report.verified().is_empty() {
        warn!("No views were verified; every query will be refused");
    }
    let queries = AggregationQueries::new(
        Arc::clone(&store),
        sync_report.into_verified(),
        config.views.clone(),
        config.query.clone(),
    );
    let cache = ReferenceCache::new(
        Arc::clone(&store),
        config.reference.clone(),
        config.boundaries.clone(),
    );
    let pipeline = CorrelationPipeline::new(
        Arc::new(SubprocessCorrelator::new(&config.correlation)),
        config.correlation.retries,
    );

    // Step 3: the command itself
    let engine = Engine {
        queries: &queries,
        cache: &cache,
        pipeline: &pipeline,
        config: &config,
    };

    match engine.execute(&args.command, &output).await {
        Ok(()) => Ok(0),
        Err(e) if !sync_clean => {
            error!("{:#}", e);
            eprintln!(
                "\n⛔ {:#}\n   Some databases failed to synchronize (exit code 2).",
                e
            );
            Ok(2)
        }
        Err(e) => Err(e),
    }
}

fn report_sync_failures(sync_report: &SyncReport) {
    for (database, e) in sync_report.failures() {
        warn!("Database {} was not synchronized: {}", database, e);
        eprintln!("⚠️  {}: {}", database, e);
    }
}

/// The engines a query command runs against.
struct Engine<'a> {
    queries: &'a AggregationQueries,
    cache: &'a ReferenceCache,
    pipeline: &'a CorrelationPipeline,
    config: &'a Config,
}

impl Engine<'_> {
    async fn execute(&self, command: &Command, output: &Output<'_>) -> Result<()> {
        let queries = self.queries;
        let malformed = || queries.diagnostics().malformed();

        match command {
            Command::Counts => {
                let counts = queries.count_by_area().await?;
                output.emit(&counts, malformed())
            }
            Command::Keyword { keyword } => {
                let counts = queries.keyword_count_all_areas(keyword).await?;
                output.emit(&counts, malformed())
            }
            Command::KeywordDocs {
                area,
                keyword,
                limit,
            } => {
                let documents = queries
                    .keyword_documents_in_area(keyword.as_deref(), area, *limit)
                    .await?;
                output.emit(&documents, malformed())
            }
            Command::Hashtags { area } => {
                let hashtags = queries.top_hashtags(area.as_deref()).await?;
                output.emit(&hashtags, malformed())
            }
            Command::Sentiment => {
                let report = correlation::sentiment_report(
                    queries,
                    self.cache,
                    self.pipeline,
                    &self.config.correlation.sentiment_references,
                )
                .await?;
                output.emit(&report, malformed())
            }
            Command::Activity { category } => {
                let counts = queries.activity_by_area(*category).await?;
                output.emit(&counts, malformed())
            }
            Command::Correlate { left, right } => {
                let pair = correlation::correlate_sources(
                    left,
                    right,
                    queries,
                    self.cache,
                    self.pipeline,
                )
                .await?;
                if !pair.result.is_computed() {
                    warn!(
                        "Correlation of {} and {} not computed: {:?}",
                        pair.left, pair.right, pair.result.status
                    );
                }
                output.emit(&pair, malformed())
            }
            Command::Summary => {
                let summary = queries.summary().await?;
                output.emit(&summary, malformed())
            }
            Command::Boundaries => {
                let boundaries = self.cache.boundaries().await?;
                output.emit(boundaries.as_slice(), malformed())
            }
            Command::Sync | Command::InitConfig => Ok(()),
        }
    }
}

/// Renders results in the requested format to stdout or a file.
struct Output<'a> {
    args: &'a Args,
    store_url: &'a str,
    start_time: Instant,
}

impl Output<'_> {
    fn emit<T: Serialize + ?Sized>(&self, result: &T, malformed_rows: u64) -> Result<()> {
        if malformed_rows > 0 {
            warn!("Skipped {} malformed index row(s)", malformed_rows);
        }

        let report = Report {
            metadata: ReportMetadata {
                command: self.args.command.name().to_string(),
                generated_at: Utc::now(),
                store_url: self.store_url.to_string(),
                malformed_rows,
                duration_seconds: self.start_time.elapsed().as_secs_f64(),
            },
            result,
        };

        let rendered = match self.args.format {
            OutputFormat::Json => report::generate_json_report(&report)?,
            OutputFormat::Markdown => report::generate_markdown_report(&report)?,
        };

        match self.args.output {
            Some(ref path) => {
                std::fs::write(path, &rendered)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                if !self.args.quiet {
                    eprintln!("✅ Report saved to: {}", path.display());
                }
            }
            None => println!("{}", rendered),
        }

        Ok(())
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
