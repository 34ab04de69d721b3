//! Feed import orchestration: seeding, filtering, hierarchy ordering and
//! chunked loading of one archive per run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tfi_adapters::{parse_table, AdapterError, FeedArchive, RecordNormalizer};
use tfi_core::{EntityKind, ImportPlan, PlanError, RunScope};
use tfi_storage::{
    FeedFetcher, FeedStore, MemoryFeedStore, PgFeedStore, RunLogStore, StoredRunLog,
};
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

mod config;
mod loader;
mod report;
mod tracker;

pub use config::{HierarchyStrategy, ImportConfig};
pub use loader::{ChunkedLoader, LoadOutcome};
pub use report::{ImportRunSummary, LogLevel, LogLine, RunLog, TableReport, TableStatus};
pub use tracker::{filter_dependencies, FilterOutcome, ReferenceTracker};

pub const CRATE_NAME: &str = "tfi-sync";

/// Failures that end a run before any table is attempted.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("feed archive is unreadable: {0}")]
    ArchiveCorrupt(String),
}

pub struct ImportPipeline {
    store: Arc<dyn FeedStore>,
    config: ImportConfig,
    plan: ImportPlan,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn FeedStore>, config: ImportConfig) -> Result<Self, PlanError> {
        Ok(Self {
            store,
            config,
            plan: ImportPlan::derive()?,
        })
    }

    /// Replaces the derived table order.
    pub fn with_plan(mut self, plan: ImportPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn plan(&self) -> &ImportPlan {
        &self.plan
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub async fn run(
        &self,
        scope: RunScope,
        archive_bytes: &[u8],
    ) -> Result<ImportRunSummary, ImportError> {
        let archive = FeedArchive::from_zip_bytes(archive_bytes).map_err(|err| {
            tracing::error!(project_id = %scope.project_id, error = %err, "feed archive rejected");
            match err {
                AdapterError::ArchiveCorrupt(reason) => ImportError::ArchiveCorrupt(reason),
                other => ImportError::ArchiveCorrupt(other.to_string()),
            }
        })?;
        Ok(self.run_archive(scope, &archive).await)
    }

    /// Attempts every table of the plan in order. Table and chunk failures
    /// end up in the summary, never as an error.
    pub async fn run_archive(&self, scope: RunScope, archive: &FeedArchive) -> ImportRunSummary {
        self.run_archive_with_log(scope, archive, RunLog::new()).await
    }

    /// Like [`run_archive`](Self::run_archive), continuing a log that already
    /// holds lines about how the archive was obtained.
    pub async fn run_archive_with_log(
        &self,
        scope: RunScope,
        archive: &FeedArchive,
        log: RunLog,
    ) -> ImportRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("feed_import", %run_id, project_id = %scope.project_id);
        self.run_archive_inner(run_id, scope, archive, log)
            .instrument(span)
            .await
    }

    async fn run_archive_inner(
        &self,
        run_id: Uuid,
        scope: RunScope,
        archive: &FeedArchive,
        mut log: RunLog,
    ) -> ImportRunSummary {
        let started_at = Utc::now();
        log.info(format!(
            "import {run_id} started for project {} by {} ({} archive entries)",
            scope.project_id,
            scope.actor_id,
            archive.len()
        ));
        for name in archive.names() {
            if !self.plan.order().iter().any(|k| k.file_name() == name) {
                log.info(format!("ignoring archive entry {name}"));
            }
        }

        let mut tracker =
            ReferenceTracker::load(self.store.as_ref(), scope.project_id, &mut log).await;
        let loader = ChunkedLoader::new(
            self.store.as_ref(),
            self.config.chunk_size,
            self.config.chunk_concurrency,
        );
        let normalizer = RecordNormalizer::new(scope);

        let mut tables = Vec::with_capacity(self.plan.order().len());
        for &kind in self.plan.order() {
            let report = self
                .import_table(kind, archive, &normalizer, &loader, &mut tracker, &mut log)
                .await;
            tables.push(report);
        }

        let names_with = |status: TableStatus| -> Vec<String> {
            tables
                .iter()
                .filter(|t| t.status == status)
                .map(|t| t.table.clone())
                .collect()
        };
        let loaded_tables = names_with(TableStatus::Loaded);
        let failed_tables = names_with(TableStatus::Failed);
        let skipped_tables = names_with(TableStatus::Skipped);

        log.info(format!(
            "import {run_id} finished: loaded [{}], failed [{}], skipped [{}]",
            loaded_tables.join(", "),
            failed_tables.join(", "),
            skipped_tables.join(", ")
        ));

        ImportRunSummary {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            loaded_tables,
            failed_tables,
            skipped_tables,
            tables,
            log,
            log_path: None,
        }
    }

    async fn import_table(
        &self,
        kind: EntityKind,
        archive: &FeedArchive,
        normalizer: &RecordNormalizer,
        loader: &ChunkedLoader<'_>,
        tracker: &mut ReferenceTracker,
        log: &mut RunLog,
    ) -> TableReport {
        let spec = kind.spec();
        let mut report = TableReport::new(kind);

        let Some(bytes) = archive.entry(spec.file_name) else {
            if spec.required {
                report.fail(format!("required file {} is missing", spec.file_name));
                log.error(format!("{}: required file {} is missing", spec.table, spec.file_name));
            } else {
                report.status = TableStatus::Skipped;
                log.info(format!("{}: {} not present, skipped", spec.table, spec.file_name));
            }
            return report;
        };
        report.status = TableStatus::Read;

        let raw_rows = match parse_table(spec.table, bytes)
            .and_then(|rows| rows.collect::<Result<Vec<_>, AdapterError>>())
        {
            Ok(rows) => rows,
            Err(err) => {
                log.error(format!("{}: {err}", spec.table));
                report.fail(err.to_string());
                return report;
            }
        };
        report.status = TableStatus::Parsed;
        report.rows_read = raw_rows.len();

        let mut records = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let normalized = normalizer.normalize(Some(kind), raw);
            report.coerced_nulls += normalized.coerced_nulls;
            records.push(normalized.record);
        }
        report.status = TableStatus::Normalized;
        if report.coerced_nulls > 0 {
            log.warn(format!(
                "{}: {} numeric fields could not be parsed and were set to null",
                spec.table, report.coerced_nulls
            ));
        }

        let filtered = filter_dependencies(kind, records, tracker);
        report.dependency_dropped = filtered.dropped;
        report.status = TableStatus::Filtered;
        if filtered.dropped > 0 {
            log.warn(format!(
                "{}: {} rows dropped for unknown references",
                spec.table, filtered.dropped
            ));
        }

        let outcome = if spec.parent_key.is_some() {
            loader
                .load_hierarchy(kind, filtered.kept, self.config.hierarchy, tracker, log)
                .await
        } else {
            loader.load(kind, filtered.kept, tracker, log).await
        };
        report.rows_accepted = outcome.accepted;
        report.failed_chunks = outcome.failed_chunks;
        report.keyless_dropped = outcome.keyless_dropped;
        report.dependency_dropped += outcome.unresolved;
        report.status = TableStatus::Loaded;

        log.info(format!(
            "{}: read {}, accepted {}, dropped {}, failed chunks {}",
            spec.table,
            report.rows_read,
            report.rows_accepted,
            report.dependency_dropped + report.keyless_dropped,
            report.failed_chunks
        ));
        report
    }
}

impl ImportRunSummary {
    /// Writes the rendered run log and records where it went.
    pub async fn persist_log(&mut self, store: &RunLogStore) -> Result<StoredRunLog> {
        let stored = store
            .store_log(self.started_at, self.scope.actor_id, &self.log.render())
            .await?;
        self.log_path = Some(stored.absolute_path.clone());
        Ok(stored)
    }
}

/// Where the archive of an import comes from.
#[derive(Debug, Clone)]
pub enum FeedSource {
    File(PathBuf),
    Dir(PathBuf),
    Url(String),
}

impl FeedSource {
    /// Reads or downloads the archive, noting where it came from in `log`.
    pub async fn load(&self, config: &ImportConfig, log: &mut RunLog) -> Result<FeedArchive> {
        let bytes = match self {
            FeedSource::Dir(path) => {
                let archive = FeedArchive::from_dir(path)?;
                log.info(format!(
                    "read {} feed files from directory {}",
                    archive.len(),
                    path.display()
                ));
                return Ok(archive);
            }
            FeedSource::File(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                log.info(format!(
                    "read {} bytes from {} (sha256 {})",
                    bytes.len(),
                    path.display(),
                    RunLogStore::sha256_hex(&bytes)
                ));
                bytes
            }
            FeedSource::Url(url) => {
                let fetcher = FeedFetcher::new(config.fetch_config())?;
                let fetched = match fetcher.fetch_archive(url).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        log.error(format!("download failed: {err}"));
                        return Err(err.into());
                    }
                };
                log.info(format!(
                    "downloaded {} bytes from {} in {} attempt(s) (sha256 {})",
                    fetched.body.len(),
                    fetched.final_url,
                    fetched.attempts,
                    fetched.content_hash
                ));
                fetched.body
            }
        };
        Ok(FeedArchive::from_zip_bytes(&bytes)?)
    }
}

/// Imports one feed with configuration from the environment. Dry runs
/// load into an in-memory store instead of the database.
pub async fn run_import_from_env(
    scope: RunScope,
    source: FeedSource,
    dry_run: bool,
) -> Result<ImportRunSummary> {
    let config = ImportConfig::load()?;
    let mut log = RunLog::new();
    let archive = source.load(&config, &mut log).await?;

    let store: Arc<dyn FeedStore> = if dry_run {
        Arc::new(MemoryFeedStore::new())
    } else {
        Arc::new(
            PgFeedStore::connect(&config.database_url)
                .await
                .context("connecting to feed database")?,
        )
    };

    let log_store = RunLogStore::new(config.log_dir.clone());
    let pipeline = ImportPipeline::new(store, config)?;
    let mut summary = pipeline.run_archive_with_log(scope, &archive, log).await;
    if let Err(err) = summary.persist_log(&log_store).await {
        tracing::warn!(error = %err, "could not write run log");
    }
    Ok(summary)
}

/// Deletes every imported row of a project.
pub async fn reset_project_from_env(project_id: Uuid) -> Result<u64> {
    let config = ImportConfig::load()?;
    let store = PgFeedStore::connect(&config.database_url)
        .await
        .context("connecting to feed database")?;
    let removed = store.purge_project(project_id).await?;
    tracing::info!(%project_id, removed, "project feed data reset");
    Ok(removed)
}
