use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tfi_core::{ColumnType, EntityKind, FeedRecord, ReferenceKind, Value};
use tracing::info;
use uuid::Uuid;

use crate::{FeedStore, StoreError};

/// Postgres caps one statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Scope columns written ahead of the table's own columns.
const SCOPE_COLUMNS: usize = 2;

#[derive(Debug, Clone)]
pub struct PgFeedStore {
    pool: PgPool,
}

impl PgFeedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn seed_query(kind: ReferenceKind) -> String {
    kind.providers()
        .into_iter()
        .filter_map(|provider| {
            let spec = provider.spec();
            spec.provides.map(|p| {
                format!(
                    r#"SELECT "{}" AS key FROM "{}" WHERE project_id = $1"#,
                    p.field, spec.store_table
                )
            })
        })
        .collect::<Vec<_>>()
        .join(" UNION ")
}

fn bind_value(b: &mut Separated<'_, '_, Postgres, &'static str>, ty: ColumnType, value: &Value) {
    match ty {
        ColumnType::Text => {
            b.push_bind(value.as_key());
        }
        ColumnType::Int => {
            b.push_bind(value.as_i64());
        }
        ColumnType::Float | ColumnType::Coordinate => {
            b.push_bind(value.as_f64());
        }
    }
}

/// Rows of `kind` that fit into one statement under the bind-parameter cap.
pub(crate) fn rows_per_statement(kind: EntityKind) -> usize {
    MAX_BIND_PARAMS / (kind.spec().columns.len() + SCOPE_COLUMNS)
}

fn insert_query(kind: EntityKind, records: &[FeedRecord]) -> QueryBuilder<'static, Postgres> {
    let spec = kind.spec();
    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        r#"INSERT INTO "{}" (project_id, created_by"#,
        spec.store_table
    ));
    for column in spec.columns {
        query_builder.push(format!(r#", "{}""#, column.name));
    }
    query_builder.push(") ");

    query_builder.push_values(records, |mut b, record| {
        b.push_bind(record.project_id).push_bind(record.created_by);
        for column in spec.columns {
            bind_value(&mut b, column.ty, record.get(column.name));
        }
    });
    query_builder.push(" ON CONFLICT DO NOTHING");
    query_builder
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn known_keys(
        &self,
        kind: ReferenceKind,
        project_id: Uuid,
    ) -> Result<HashSet<String>, StoreError> {
        let sql = seed_query(kind);
        let rows: Vec<Option<String>> = sqlx::query_scalar(&sql)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn insert_ignore_duplicates(
        &self,
        kind: EntityKind,
        records: &[FeedRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        // Chunks past the bind-parameter cap are split into several
        // statements that commit or roll back together.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for rows in records.chunks(rows_per_statement(kind)) {
            let result = insert_query(kind, rows).build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn purge_project(&self, project_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        // Reverse declaration order deletes dependents before their targets.
        for kind in EntityKind::ALL.into_iter().rev() {
            let sql = format!(
                r#"DELETE FROM "{}" WHERE project_id = $1"#,
                kind.spec().store_table
            );
            let result = sqlx::query(&sql).bind(project_id).execute(&mut *tx).await?;
            info!(table = kind.table_name(), rows = result.rows_affected(), "purged project rows");
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}
