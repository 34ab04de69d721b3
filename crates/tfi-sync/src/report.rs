use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tfi_core::{EntityKind, RunScope};
use uuid::Uuid;

/// Per-table progress through one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    Read,
    Parsed,
    Normalized,
    Filtered,
    Loaded,
    Skipped,
    Failed,
}

impl TableStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TableStatus::Loaded | TableStatus::Skipped | TableStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Human-readable run log kept alongside the summary. Every line is also
/// emitted as a `tracing` event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunLog {
    lines: Vec<LogLine>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.push(LogLevel::Error, message);
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.lines.push(LogLine {
            at: Utc::now(),
            level,
            message,
        });
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.message.contains(needle))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&format!(
                "[{}] {:<5} {}\n",
                line.at.to_rfc3339(),
                line.level,
                line.message
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub kind: EntityKind,
    pub status: TableStatus,
    pub rows_read: usize,
    pub coerced_nulls: usize,
    pub dependency_dropped: usize,
    pub keyless_dropped: usize,
    pub rows_accepted: u64,
    pub failed_chunks: usize,
    pub error: Option<String>,
}

impl TableReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            table: kind.table_name().to_string(),
            kind,
            status: TableStatus::Pending,
            rows_read: 0,
            coerced_nulls: 0,
            dependency_dropped: 0,
            keyless_dropped: 0,
            rows_accepted: 0,
            failed_chunks: 0,
            error: None,
        }
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = TableStatus::Failed;
        self.error = Some(reason.into());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub scope: RunScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub loaded_tables: Vec<String>,
    pub failed_tables: Vec<String>,
    pub skipped_tables: Vec<String>,
    pub tables: Vec<TableReport>,
    pub log: RunLog,
    pub log_path: Option<PathBuf>,
}

impl ImportRunSummary {
    pub fn table(&self, table: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub fn accepted(&self, kind: EntityKind) -> u64 {
        self.tables
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.rows_accepted)
            .sum()
    }

    pub fn total_accepted(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_accepted).sum()
    }

    /// True when not a single table reached `Loaded`.
    pub fn is_total_failure(&self) -> bool {
        self.loaded_tables.is_empty()
    }
}
