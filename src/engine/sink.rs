// Sink abstraction for telemetry backends
// This defines the interface every telemetry target implements

//! # Sink Abstraction Layer
//!
//! Node behaviors never talk to a database, a file or a message broker
//! directly. They hand records to the [`Recorder`](super::telemetry::Recorder),
//! which forwards them to a [`Sink`] looked up by identifier in a
//! [`SinkRegistry`].
//!
//! ## Implementations
//!
//! - [`InMemorySink`]: rows kept in memory, for tests and dry runs
//! - [`DelimitedFileSink`](super::file_sink::DelimitedFileSink): one file per table
//! - [`PostgresSink`](super::postgres_sink::PostgresSink): schema-qualified tables
//! - [`NatsSink`](super::nats_sink::NatsSink): one JetStream message per record
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! The `async-trait` crate rewrites `async fn` in traits into methods that
//! return boxed futures, so `Arc<dyn Sink>` trait objects work.
//!
//! ### Trait Bounds
//! `Send + Sync` lets one sink be shared by every worker task.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::models::{Record, TableDefinition};
use crate::Result;

/// Default registry identifiers for the built-in sinks
pub mod ids {
    pub const POSTGRES: &str = "postgres";
    pub const CSV: &str = "csv";
    pub const NATS: &str = "nats";
    pub const MEMORY: &str = "memory";
}

/// A telemetry backend
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Make sure `table` can receive records (create table, stream, file...)
    async fn ensure_schema(&self, table: &TableDefinition) -> Result<()>;

    /// Append a batch of records to `table`
    async fn append(&self, table: &TableDefinition, records: &[Record]) -> Result<()>;

    /// Remove every record of `table`
    async fn purge(&self, table: &TableDefinition) -> Result<()>;

    /// Release connections and flush buffers
    async fn close(&self) -> Result<()>;
}

/// In-memory sink for development and testing
///
/// Rows are grouped by qualified table name.
#[derive(Default)]
pub struct InMemorySink {
    tables: RwLock<HashMap<String, Vec<Record>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row appended to `table`
    pub async fn rows(&self, table: &TableDefinition) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(&table.qualified_name())
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of rows across all tables
    pub async fn total_rows(&self) -> usize {
        self.tables.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait::async_trait]
impl Sink for InMemorySink {
    async fn ensure_schema(&self, table: &TableDefinition) -> Result<()> {
        self.tables
            .write()
            .await
            .entry(table.qualified_name())
            .or_default();
        Ok(())
    }

    async fn append(&self, table: &TableDefinition, records: &[Record]) -> Result<()> {
        self.tables
            .write()
            .await
            .entry(table.qualified_name())
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn purge(&self, table: &TableDefinition) -> Result<()> {
        if let Some(rows) = self.tables.write().await.get_mut(&table.qualified_name()) {
            rows.clear();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sinks by identifier, shared by the recorder and the driver
///
/// Passed explicitly to whoever needs it; there is no process-wide registry.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: DashMap<String, Arc<dyn Sink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the sink for `id`
    pub fn register<S: Into<String>>(&self, id: S, sink: Arc<dyn Sink>) {
        self.sinks.insert(id.into(), sink);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Sink>> {
        self.sinks.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sinks.contains_key(id)
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Snapshot of every registered sink
    pub fn all(&self) -> Vec<(String, Arc<dyn Sink>)> {
        self.sinks
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDefinition, ColumnType};
    use serde_json::json;

    fn table() -> TableDefinition {
        TableDefinition::new(
            "rejected_parts",
            "test",
            vec![ColumnDefinition::required("part_id", ColumnType::Text)],
        )
    }

    fn record(id: &str) -> Record {
        let mut r = Record::new();
        r.insert("part_id".into(), json!(id));
        r
    }

    #[tokio::test]
    async fn test_in_memory_append_and_purge() {
        let sink = InMemorySink::new();
        let table = table();

        sink.ensure_schema(&table).await.unwrap();
        assert!(sink.rows(&table).await.is_empty());

        sink.append(&table, &[record("part1"), record("part2")]).await.unwrap();
        assert_eq!(sink.rows(&table).await.len(), 2);
        assert_eq!(sink.total_rows().await, 2);

        sink.purge(&table).await.unwrap();
        assert!(sink.rows(&table).await.is_empty());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = SinkRegistry::new();
        let sink = Arc::new(InMemorySink::new());
        registry.register(ids::MEMORY, sink.clone());

        assert!(registry.contains(ids::MEMORY));
        assert!(registry.get(ids::CSV).is_none());
        assert_eq!(registry.ids(), vec![ids::MEMORY.to_string()]);

        let found = registry.get(ids::MEMORY).unwrap();
        found.append(&table(), &[record("part9")]).await.unwrap();
        assert_eq!(sink.total_rows().await, 1);
    }

    #[test]
    fn test_in_memory_purge_of_unknown_table() {
        let sink = InMemorySink::new();
        tokio_test::block_on(async {
            sink.purge(&table()).await.unwrap();
            sink.close().await.unwrap();
            assert_eq!(sink.total_rows().await, 0);
        });
    }
}
