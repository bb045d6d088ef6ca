// PostgreSQL telemetry sink

//! # PostgreSQL Sink
//!
//! Tables live in their own schema and are created on demand:
//!
//! ```sql
//! CREATE SCHEMA IF NOT EXISTS "test";
//! CREATE TABLE IF NOT EXISTS "test"."quality_checks" (
//!     "part_id" TEXT NOT NULL,
//!     "quality_value" INTEGER NOT NULL,
//!     ...
//! );
//! ```
//!
//! Batches are written with one parameterised multi-row `INSERT`. Values are
//! bound with the Rust type matching the column; dates, timestamps, UUIDs and
//! JSON travel as text and are cast on the server side.

use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use super::sink::Sink;
use crate::models::{ColumnDefinition, ColumnType, Record, TableDefinition};
use crate::{FactoryError, Result};

/// Bind parameters PostgreSQL accepts in one statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Relational implementation of [`Sink`]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Connect a small pool to `database_url`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Double-quoted SQL identifier
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(table: &TableDefinition) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

fn create_table_sql(table: &TableDefinition) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut column = format!("{} {}", quote_ident(&c.name), c.column_type.sql_type());
            if !c.nullable {
                column.push_str(" NOT NULL");
            }
            column
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(table),
        columns.join(", ")
    )
}

fn insert_prefix(table: &TableDefinition) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(&c.name)).collect();
    format!("INSERT INTO {} ({}) ", qualified(table), columns.join(", "))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reject integers that do not fit their column before anything is sent
fn check_ranges(table: &TableDefinition, records: &[Record]) -> Result<()> {
    for record in records {
        for column in table.columns.iter().filter(|c| c.column_type == ColumnType::Int) {
            if let Some(v) = record.get(&column.name).and_then(Value::as_i64) {
                if i32::try_from(v).is_err() {
                    return Err(FactoryError::Sink(anyhow::anyhow!(
                        "Value {} does not fit INTEGER column {}.{}",
                        v,
                        table.qualified_name(),
                        column.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn push_value(
    row: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    column: &ColumnDefinition,
    value: Option<&Value>,
) {
    let value = value.filter(|v| !v.is_null());
    match column.column_type {
        ColumnType::Int => {
            row.push_bind(value.and_then(Value::as_i64).and_then(|v| i32::try_from(v).ok()));
        }
        ColumnType::BigInt => {
            row.push_bind(value.and_then(Value::as_i64));
        }
        ColumnType::Float => {
            row.push_bind(value.and_then(Value::as_f64));
        }
        ColumnType::Boolean => {
            row.push_bind(value.and_then(Value::as_bool));
        }
        ColumnType::Text | ColumnType::Varchar => {
            row.push_bind(value.map(as_text));
        }
        ColumnType::Json => {
            row.push_bind(value.map(Value::to_string));
            row.push_unseparated("::jsonb");
        }
        ColumnType::Uuid => {
            row.push_bind(value.map(as_text));
            row.push_unseparated("::uuid");
        }
        ColumnType::Date => {
            row.push_bind(value.map(as_text));
            row.push_unseparated("::timestamptz::date");
        }
        ColumnType::Timestamp => {
            row.push_bind(value.map(as_text));
            row.push_unseparated("::timestamptz");
        }
    }
}

#[async_trait::async_trait]
impl Sink for PostgresSink {
    async fn ensure_schema(&self, table: &TableDefinition) -> Result<()> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&table.schema)
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&create_table_sql(table))
            .execute(&self.pool)
            .await?;
        debug!(table = %table.qualified_name(), "PostgreSQL table ready");
        Ok(())
    }

    async fn append(&self, table: &TableDefinition, records: &[Record]) -> Result<()> {
        if records.is_empty() || table.columns.is_empty() {
            return Ok(());
        }
        check_ranges(table, records)?;

        let rows_per_statement = (MAX_BIND_PARAMS / table.columns.len()).max(1);
        for chunk in records.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(table));
            builder.push_values(chunk, |mut row, record| {
                for column in &table.columns {
                    push_value(&mut row, column, record.get(&column.name));
                }
            });
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn purge(&self, table: &TableDefinition) -> Result<()> {
        sqlx::query(&format!("TRUNCATE TABLE {}", qualified(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
