//! Data access, run-log persistence and feed download utilities for TFI.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tfi_core::{EntityKind, FeedRecord, ReferenceKind};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod fetch;
mod memory;
mod postgres;

pub use fetch::{FeedFetcher, FetchConfig, FetchError, FetchedFeed, RetryPolicy};
pub use memory::MemoryFeedStore;
pub use postgres::PgFeedStore;

pub const CRATE_NAME: &str = "tfi-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Rejected(String),
}

/// Relational store the pipeline reads seed keys from and writes feed rows into.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Natural keys already present for `project_id` in the given key space.
    async fn known_keys(
        &self,
        kind: ReferenceKind,
        project_id: Uuid,
    ) -> Result<HashSet<String>, StoreError>;

    /// Inserts `records`, silently skipping rows whose unique key already
    /// exists. Returns the number of rows actually written.
    async fn insert_ignore_duplicates(
        &self,
        kind: EntityKind,
        records: &[FeedRecord],
    ) -> Result<u64, StoreError>;

    /// Removes every imported feed row of a project, dependents first.
    async fn purge_project(&self, project_id: Uuid) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoredRunLog {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub appended: bool,
}

/// Line-oriented run logs, one file per run timestamp and actor.
#[derive(Debug, Clone)]
pub struct RunLogStore {
    root: PathBuf,
}

impl RunLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn log_relative_path(&self, started_at: DateTime<Utc>, actor_id: Uuid) -> PathBuf {
        let stamp = started_at.format("%Y%m%dT%H%M%S").to_string();
        PathBuf::from(format!("gtfs_import_{actor_id}_{stamp}.log"))
    }

    /// Writes a new log via temp-file + rename, or appends when a log with
    /// the same stamp and actor already exists.
    pub async fn store_log(
        &self,
        started_at: DateTime<Utc>,
        actor_id: Uuid,
        text: &str,
    ) -> anyhow::Result<StoredRunLog> {
        let bytes = text.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.log_relative_path(started_at, actor_id);
        let absolute_path = self.root.join(&relative_path);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating log directory {}", self.root.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking log path {}", absolute_path.display()))?
        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&absolute_path)
                .await
                .with_context(|| format!("opening run log {}", absolute_path.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("appending run log {}", absolute_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing run log {}", absolute_path.display()))?;
            return Ok(StoredRunLog {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                appended: true,
            });
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp log file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp log file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp log file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp log {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredRunLog {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            appended: false,
        })
    }
}
