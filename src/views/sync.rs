//! View synchronization.
//!
//! Brings the design documents stored in each database in line with the
//! declared [`ViewRegistry`]. Each design document is written at most once
//! per pass, with every mismatched view batched into that write. A write
//! that loses the revision race is retried once against a fresh copy.

use crate::error::{StoreError, SyncError};
use crate::models::{DesignDocument, DesignOptions, IndexSpec, ViewId};
use crate::store::DocumentStore;
use crate::views::definitions::ViewRegistry;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Design documents whose name ends in this suffix are not partitioned.
pub const GLOBAL_SUFFIX: &str = "-global";

const MAX_WRITE_ATTEMPTS: usize = 2;

/// Views that are known to exist in the store with their declared definition.
///
/// Only a completed [`Synchronizer::run`] produces one, so holding a
/// `VerifiedViews` means the startup barrier has been passed.
#[derive(Debug, Clone, Default)]
pub struct VerifiedViews {
    views: BTreeSet<ViewId>,
}

impl VerifiedViews {
    pub fn contains(&self, view: &ViewId) -> bool {
        self.views.contains(view)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Per-database counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub designs_checked: usize,
    pub designs_written: usize,
    pub views_updated: usize,
}

/// Outcome of synchronizing one database.
#[derive(Debug)]
pub struct DatabaseSync {
    pub database: String,
    pub outcome: Result<DatabaseStats, SyncError>,
}

/// Printable row for one database of a [`SyncReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSummary {
    pub database: String,
    pub status: &'static str,
    pub designs_checked: usize,
    pub designs_written: usize,
    pub views_updated: usize,
    pub error: Option<String>,
}

/// Result of a full synchronization pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub databases: Vec<DatabaseSync>,
    verified: VerifiedViews,
}

impl SyncReport {
    /// Views of every database that synchronized successfully.
    pub fn verified(&self) -> &VerifiedViews {
        &self.verified
    }

    pub fn into_verified(self) -> VerifiedViews {
        self.verified
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &SyncError)> {
        self.databases.iter().filter_map(|db| match &db.outcome {
            Ok(_) => None,
            Err(e) => Some((db.database.as_str(), e)),
        })
    }

    /// Total design document writes performed.
    pub fn writes(&self) -> usize {
        self.databases
            .iter()
            .filter_map(|db| db.outcome.as_ref().ok())
            .map(|stats| stats.designs_written)
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// One row per database, in synchronization order.
    pub fn summary(&self) -> Vec<DatabaseSummary> {
        self.databases
            .iter()
            .map(|db| {
                let (status, stats, error) = match &db.outcome {
                    Ok(stats) => ("ok", *stats, None),
                    Err(e) => ("failed", DatabaseStats::default(), Some(e.to_string())),
                };
                DatabaseSummary {
                    database: db.database.clone(),
                    status,
                    designs_checked: stats.designs_checked,
                    designs_written: stats.designs_written,
                    views_updated: stats.views_updated,
                    error,
                }
            })
            .collect()
    }
}

/// Reconciles stored design documents with the declared views.
pub struct Synchronizer<'a> {
    store: &'a dyn DocumentStore,
    registry: &'a ViewRegistry,
    show_progress: bool,
}

impl<'a> Synchronizer<'a> {
    pub fn new(store: &'a dyn DocumentStore, registry: &'a ViewRegistry) -> Self {
        Self {
            store,
            registry,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Synchronize every database with declared views.
    ///
    /// A failing database is reported and does not stop the others.
    pub async fn run(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for database in self.registry.databases() {
            let progress = self.spinner(database);
            let outcome = self.sync_database(database, &progress).await;

            match &outcome {
                Ok(stats) => {
                    progress.finish_with_message(format!(
                        "{}: {} design document(s) checked, {} written",
                        database, stats.designs_checked, stats.designs_written
                    ));
                    info!(
                        "Database {} synchronized ({} views updated)",
                        database, stats.views_updated
                    );
                    report.verified.views.extend(
                        self.registry
                            .iter()
                            .map(|(id, _)| id)
                            .filter(|id| id.database == database)
                            .cloned(),
                    );
                }
                Err(e) => {
                    progress.abandon_with_message(format!("{}: failed", database));
                    warn!("Database {} failed to synchronize: {}", database, e);
                }
            }

            report.databases.push(DatabaseSync {
                database: database.to_string(),
                outcome,
            });
        }

        report
    }

    fn spinner(&self, database: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("{}: listing design documents", database));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    async fn sync_database(
        &self,
        database: &str,
        progress: &ProgressBar,
    ) -> Result<DatabaseStats, SyncError> {
        let store_error = |source: StoreError| SyncError::Store {
            database: database.to_string(),
            source,
        };

        let existing: BTreeSet<String> = self
            .store
            .list_design_documents(database)
            .await
            .map_err(store_error)?
            .into_iter()
            .collect();
        debug!("{} has {} design document(s)", database, existing.len());

        let mut stats = DatabaseStats::default();

        for design in self.registry.designs(database) {
            progress.set_message(format!("{}: checking _design/{}", database, design));
            stats.designs_checked += 1;

            let updated = self
                .sync_design(database, design, existing.contains(design))
                .await?;
            if updated > 0 {
                stats.designs_written += 1;
                stats.views_updated += updated;
            }
        }

        Ok(stats)
    }

    /// Returns the number of views written (0 when already in sync).
    async fn sync_design(
        &self,
        database: &str,
        design: &str,
        listed: bool,
    ) -> Result<usize, SyncError> {
        let declared: Vec<(&str, &IndexSpec)> = self.registry.views_in(database, design).collect();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            // An unlisted document is only assumed absent on the first try.
            let current = if listed || attempt > 1 {
                self.store
                    .get_design_document(database, design)
                    .await
                    .map_err(|source| SyncError::Store {
                        database: database.to_string(),
                        source,
                    })?
            } else {
                None
            };

            let (doc, changed) = reconcile(current, design, &declared);
            if changed.is_empty() {
                debug!("{}/_design/{} is up to date", database, design);
                return Ok(0);
            }

            match self.store.put_design_document(database, &doc).await {
                Ok(rev) => {
                    info!(
                        "Updated {}/_design/{} to {} ({})",
                        database,
                        design,
                        rev,
                        changed.join(", ")
                    );
                    return Ok(changed.len());
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(
                        "Revision conflict on {}/_design/{}, retrying",
                        database, design
                    );
                }
                Err(StoreError::Conflict(_)) => break,
                Err(source) => {
                    return Err(SyncError::Store {
                        database: database.to_string(),
                        source,
                    })
                }
            }
        }

        Err(SyncError::Conflict {
            database: database.to_string(),
            design: design.to_string(),
        })
    }
}

/// Merge the declared views into `current`.
///
/// Returns the document to write and the names of the views that differed.
/// Views present in the store but not declared are left alone.
fn reconcile(
    current: Option<DesignDocument>,
    design: &str,
    declared: &[(&str, &IndexSpec)],
) -> (DesignDocument, Vec<String>) {
    let mut doc = current.unwrap_or_else(|| {
        let mut doc = DesignDocument::new(design);
        if design.ends_with(GLOBAL_SUFFIX) {
            doc.options = Some(DesignOptions { partitioned: false });
        }
        doc
    });

    let mut changed = Vec::new();
    for (view, spec) in declared {
        if doc.views.get(*view) != Some(*spec) {
            doc.views.insert(view.to_string(), (*spec).clone());
            changed.push(view.to_string());
        }
    }

    (doc, changed)
}
