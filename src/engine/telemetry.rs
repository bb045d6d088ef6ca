// Telemetry recorder - conditional forwarding of node events to sinks

//! # Telemetry Recorder
//!
//! A [`DataSource`] describes one telemetry stream: which sink it goes to,
//! the table it fills, a predicate deciding whether a given (node, part) pair
//! is interesting and a mapper building the record.
//!
//! [`Recorder::record`] is called by node behaviors while they process a
//! part. It never fails: every outcome, including sink errors, is logged and
//! reported back as a [`RecordOutcome`] so the worker can carry on with the
//! part.
//!
//! ## Record Pipeline
//!
//! ```text
//! predicate ──false──► Skipped
//!     │true
//! mapper ──► required columns present? ──no──► Dropped (warn, nothing sent)
//!     │yes
//! project onto table columns ──► sink.append([record]) ──► Delivered | Failed
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Closures as Trait Objects
//! Predicates and mappers are stored as `Arc<dyn Fn(..) + Send + Sync>`, so
//! sources can be cloned cheaply and called from any worker task.
//!
//! ### Atomics for Counters
//! Per-source counters are `AtomicU64`s. Recording only needs `&self`, so one
//! `Arc<Recorder>` is shared by every worker without a lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::sink::{ids, SinkRegistry};
use crate::models::{
    ColumnDefinition, ColumnType, NodeId, Part, Record, TableDefinition, COMPLETE_NODE,
    REJECT_NODE,
};
use crate::{FactoryError, Result};

/// Default source names
pub mod sources {
    pub const CUTTING: &str = "cutting";
    pub const SENSOR: &str = "sensor";
    pub const STATION_METRICS: &str = "station_metrics";
    pub const REJECT: &str = "reject";
    pub const COMPLETE: &str = "complete";
}

/// What a behavior knows about the node it is running on
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryContext {
    pub node: NodeId,
    /// [`NodeKind::name`](crate::models::NodeKind::name) of the node
    pub kind: &'static str,
    /// Parts waiting in the node's queue
    pub queue_depth: usize,
}

impl TelemetryContext {
    pub fn new(node: &NodeId, kind: &'static str, queue_depth: usize) -> Self {
        Self {
            node: node.clone(),
            kind,
            queue_depth,
        }
    }
}

pub type Predicate = Arc<dyn Fn(&TelemetryContext, &Part) -> bool + Send + Sync>;
pub type Mapper = Arc<dyn Fn(&TelemetryContext, &Part) -> Record + Send + Sync>;

/// One telemetry stream
#[derive(Clone)]
pub struct DataSource {
    pub name: String,
    /// Registry identifier of the target sink
    pub sink_id: String,
    pub table: TableDefinition,
    pub predicate: Predicate,
    pub mapper: Mapper,
}

impl DataSource {
    pub fn new<N, S, P, M>(name: N, sink_id: S, table: TableDefinition, predicate: P, mapper: M) -> Self
    where
        N: Into<String>,
        S: Into<String>,
        P: Fn(&TelemetryContext, &Part) -> bool + Send + Sync + 'static,
        M: Fn(&TelemetryContext, &Part) -> Record + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            sink_id: sink_id.into(),
            table,
            predicate: Arc::new(predicate),
            mapper: Arc::new(mapper),
        }
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("sink_id", &self.sink_id)
            .field("table", &self.table.qualified_name())
            .finish()
    }
}

/// Result of a single [`Recorder::record`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Predicate was false, or the source is unknown
    Skipped,
    /// A required column was missing; nothing was sent
    Dropped,
    Delivered,
    /// The sink is missing or rejected the batch
    Failed,
}

#[derive(Debug, Default)]
struct SourceCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Listing entry for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub name: String,
    pub sink: String,
    pub table: String,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Forwards node events to sinks through named data sources
pub struct Recorder {
    sources: Vec<DataSource>,
    index: HashMap<String, usize>,
    counters: Vec<SourceCounters>,
    sinks: Arc<SinkRegistry>,
    purge_on_prepare: bool,
}

impl Recorder {
    pub fn new(sinks: Arc<SinkRegistry>) -> Self {
        Self {
            sources: Vec::new(),
            index: HashMap::new(),
            counters: Vec::new(),
            sinks,
            purge_on_prepare: false,
        }
    }

    /// Recorder with the five standard production-line sources
    ///
    /// Each source prefers a backend (`nats` for cutting and completions,
    /// `postgres` for quality checks and rejects, `csv` for station metrics).
    /// When the preferred backend is not registered the source falls back to
    /// `csv`, then `memory`.
    pub fn with_default_sources<S: Into<String>>(sinks: Arc<SinkRegistry>, schema: S) -> Self {
        let schema = schema.into();
        let mut recorder = Self::new(Arc::clone(&sinks));
        for source in default_sources(&sinks, &schema) {
            recorder.add_source(source);
        }
        recorder
    }

    /// Purge every table in [`prepare`](Self::prepare)
    pub fn purge_on_prepare(mut self, purge: bool) -> Self {
        self.purge_on_prepare = purge;
        self
    }

    /// Register (or replace) a source
    pub fn add_source(&mut self, source: DataSource) {
        match self.index.get(&source.name) {
            Some(&i) => self.sources[i] = source,
            None => {
                self.index.insert(source.name.clone(), self.sources.len());
                self.sources.push(source);
                self.counters.push(SourceCounters::default());
            }
        }
    }

    pub fn source(&self, name: &str) -> Option<&DataSource> {
        self.index.get(name).map(|&i| &self.sources[i])
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    /// Create every table, purging it first when configured
    ///
    /// Sources whose sink is not registered are skipped with a warning. A
    /// failing sink does not stop the others from being prepared; the error
    /// returned at the end names how many sources failed.
    pub async fn prepare(&self) -> Result<()> {
        let mut failed = 0usize;
        for source in &self.sources {
            let Some(sink) = self.sinks.get(&source.sink_id) else {
                warn!(source = %source.name, sink = %source.sink_id, "Sink not registered, source disabled");
                continue;
            };
            if let Err(e) = sink.ensure_schema(&source.table).await {
                warn!(source = %source.name, sink = %source.sink_id, error = %e, "Failed to prepare telemetry table");
                failed += 1;
                continue;
            }
            if self.purge_on_prepare {
                match sink.purge(&source.table).await {
                    Ok(()) => info!(table = %source.table.qualified_name(), "Purged telemetry table"),
                    Err(e) => {
                        warn!(source = %source.name, sink = %source.sink_id, error = %e, "Failed to purge telemetry table");
                        failed += 1;
                    }
                }
            }
        }
        self.summarize("prepare", failed)
    }

    /// Purge every table of every source, carrying on past failing sinks
    pub async fn purge_all(&self) -> Result<()> {
        let mut failed = 0usize;
        for source in &self.sources {
            let Some(sink) = self.sinks.get(&source.sink_id) else {
                continue;
            };
            let purged = match sink.ensure_schema(&source.table).await {
                Ok(()) => sink.purge(&source.table).await,
                Err(e) => Err(e),
            };
            match purged {
                Ok(()) => {
                    info!(table = %source.table.qualified_name(), sink = %source.sink_id, "Purged telemetry table")
                }
                Err(e) => {
                    warn!(source = %source.name, sink = %source.sink_id, error = %e, "Failed to purge telemetry table");
                    failed += 1;
                }
            }
        }
        self.summarize("purge", failed)
    }

    fn summarize(&self, action: &str, failed: usize) -> Result<()> {
        if failed == 0 {
            return Ok(());
        }
        Err(FactoryError::Sink(anyhow::anyhow!(
            "Failed to {} {} of {} telemetry sources",
            action,
            failed,
            self.sources.len()
        )))
    }

    /// Record one event through the source called `source_name`
    pub async fn record(&self, source_name: &str, ctx: &TelemetryContext, part: &Part) -> RecordOutcome {
        let Some(&i) = self.index.get(source_name) else {
            debug!(source = source_name, "Unknown telemetry source");
            return RecordOutcome::Skipped;
        };
        let source = &self.sources[i];
        let counters = &self.counters[i];

        if !(source.predicate)(ctx, part) {
            return RecordOutcome::Skipped;
        }

        let record = (source.mapper)(ctx, part);
        let missing = source.table.missing_columns(&record);
        if !missing.is_empty() {
            warn!(
                source = %source.name,
                part = %part.id,
                missing = ?missing,
                "Missing required columns, record dropped"
            );
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            return RecordOutcome::Dropped;
        }

        let Some(sink) = self.sinks.get(&source.sink_id) else {
            debug!(source = %source.name, sink = %source.sink_id, "Sink not registered");
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return RecordOutcome::Failed;
        };

        let row = source.table.project(&record);
        match sink.append(&source.table, std::slice::from_ref(&row)).await {
            Ok(()) => {
                debug!(source = %source.name, part = %part.id, node = %ctx.node, "Telemetry delivered");
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                RecordOutcome::Delivered
            }
            Err(e) => {
                warn!(source = %source.name, sink = %source.sink_id, error = %e, "Failed to add telemetry");
                counters.failed.fetch_add(1, Ordering::Relaxed);
                RecordOutcome::Failed
            }
        }
    }

    /// One entry per source, in registration order
    pub fn reports(&self) -> Vec<SourceReport> {
        self.sources
            .iter()
            .zip(&self.counters)
            .map(|(source, counters)| SourceReport {
                name: source.name.clone(),
                sink: source.sink_id.clone(),
                table: source.table.qualified_name(),
                delivered: counters.delivered.load(Ordering::Relaxed),
                dropped: counters.dropped.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Close every registered sink, logging failures
    pub async fn close(&self) {
        for (id, sink) in self.sinks.all() {
            if let Err(e) = sink.close().await {
                warn!(sink = %id, error = %e, "Failed to close sink");
            }
        }
    }
}

fn resolve_sink(sinks: &SinkRegistry, preferred: &str) -> String {
    [preferred, ids::CSV, ids::MEMORY]
        .into_iter()
        .find(|id| sinks.contains(id))
        .unwrap_or(preferred)
        .to_string()
}

fn timestamp() -> serde_json::Value {
    json!(Utc::now().to_rfc3339())
}

/// `max(0, 10 - |10 - cut|)`
pub fn quality_score(cut_value: i64) -> i64 {
    (10 - (10 - cut_value).abs()).max(0)
}

fn default_sources(sinks: &SinkRegistry, schema: &str) -> Vec<DataSource> {
    let cutting = DataSource::new(
        sources::CUTTING,
        resolve_sink(sinks, ids::NATS),
        TableDefinition::new(
            "cutting",
            schema,
            vec![
                ColumnDefinition::required("part_id", ColumnType::Text),
                ColumnDefinition::required("cut_attempts", ColumnType::Int),
                ColumnDefinition::required("cut_val", ColumnType::Int),
                ColumnDefinition::required("timestamp", ColumnType::Timestamp),
            ],
        ),
        |_, part| part.attributes.cut_attempts > 0,
        |_, part| {
            let mut r = Record::new();
            r.insert("part_id".into(), json!(part.id));
            r.insert("cut_attempts".into(), json!(part.attributes.cut_attempts));
            r.insert("cut_val".into(), json!(part.attributes.cut_value));
            r.insert("timestamp".into(), timestamp());
            r
        },
    );

    let sensor = DataSource::new(
        sources::SENSOR,
        resolve_sink(sinks, ids::POSTGRES),
        TableDefinition::new(
            "quality_checks",
            schema,
            vec![
                ColumnDefinition::required("part_id", ColumnType::Text),
                ColumnDefinition::required("quality_value", ColumnType::Int),
                ColumnDefinition::required("is_acceptable", ColumnType::Boolean),
                ColumnDefinition::required("sensor_id", ColumnType::Text),
                ColumnDefinition::required("timestamp", ColumnType::Timestamp),
            ],
        ),
        |ctx, _| ctx.kind == "Sensor",
        |ctx, part| {
            let value = part.attributes.cut_value;
            let mut r = Record::new();
            r.insert("part_id".into(), json!(part.id));
            r.insert("quality_value".into(), json!(value));
            r.insert("is_acceptable".into(), json!((8..=12).contains(&value)));
            r.insert("sensor_id".into(), json!(ctx.node));
            r.insert("timestamp".into(), timestamp());
            r
        },
    );

    let station_metrics = DataSource::new(
        sources::STATION_METRICS,
        resolve_sink(sinks, ids::CSV),
        TableDefinition::new(
            "station_throughput",
            schema,
            vec![
                ColumnDefinition::required("station_id", ColumnType::Text),
                ColumnDefinition::required("queue_size", ColumnType::Int),
                ColumnDefinition::required("station_type", ColumnType::Text),
                ColumnDefinition::required("timestamp", ColumnType::Timestamp),
            ],
        ),
        |ctx, _| ctx.kind == "Station",
        |ctx, _| {
            let mut r = Record::new();
            r.insert("station_id".into(), json!(ctx.node));
            r.insert("queue_size".into(), json!(ctx.queue_depth));
            r.insert("station_type".into(), json!(ctx.kind));
            r.insert("timestamp".into(), timestamp());
            r
        },
    );

    let reject = DataSource::new(
        sources::REJECT,
        resolve_sink(sinks, ids::POSTGRES),
        TableDefinition::new(
            "rejected_parts",
            schema,
            vec![
                ColumnDefinition::required("part_id", ColumnType::Text),
                ColumnDefinition::required("cut_val", ColumnType::Int),
                ColumnDefinition::required("cut_attempts", ColumnType::Int),
                ColumnDefinition::required("timestamp", ColumnType::Timestamp),
            ],
        ),
        |ctx, _| ctx.node.as_str() == REJECT_NODE,
        |_, part| {
            let mut r = Record::new();
            r.insert("part_id".into(), json!(part.id));
            r.insert("cut_val".into(), json!(part.attributes.cut_value));
            r.insert("cut_attempts".into(), json!(part.attributes.cut_attempts));
            r.insert("timestamp".into(), timestamp());
            r
        },
    );

    let complete = DataSource::new(
        sources::COMPLETE,
        resolve_sink(sinks, ids::NATS),
        TableDefinition::new(
            "completed_parts",
            schema,
            vec![
                ColumnDefinition::required("part_id", ColumnType::Text),
                ColumnDefinition::required("processing_time", ColumnType::Float),
                ColumnDefinition::required("quality_score", ColumnType::Int),
                ColumnDefinition::required("timestamp", ColumnType::Timestamp),
            ],
        ),
        |ctx, _| ctx.node.as_str() == COMPLETE_NODE,
        |_, part| {
            let mut r = Record::new();
            r.insert("part_id".into(), json!(part.id));
            r.insert("processing_time".into(), json!(part.history_len() as f64 * 1.5));
            r.insert("quality_score".into(), json!(quality_score(part.attributes.cut_value)));
            r.insert("timestamp".into(), timestamp());
            r
        },
    );

    vec![cutting, sensor, station_metrics, reject, complete]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sink::{InMemorySink, Sink};

    fn memory_recorder() -> (Recorder, Arc<InMemorySink>) {
        let registry = Arc::new(SinkRegistry::new());
        let sink = Arc::new(InMemorySink::new());
        registry.register(ids::MEMORY, sink.clone());
        (Recorder::with_default_sources(registry, "test"), sink)
    }

    fn ctx(node: &str, kind: &'static str) -> TelemetryContext {
        TelemetryContext::new(&NodeId::from(node), kind, 2)
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl Sink for FailingSink {
        async fn ensure_schema(&self, _table: &TableDefinition) -> Result<()> {
            Ok(())
        }
        async fn append(&self, _table: &TableDefinition, _records: &[Record]) -> Result<()> {
            Err(FactoryError::Sink(anyhow::anyhow!("connection refused")))
        }
        async fn purge(&self, _table: &TableDefinition) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// A backend that cannot be reached at all
    struct UnreachableSink;

    #[async_trait::async_trait]
    impl Sink for UnreachableSink {
        async fn ensure_schema(&self, table: &TableDefinition) -> Result<()> {
            Err(FactoryError::Sink(anyhow::anyhow!(
                "no route to {}",
                table.qualified_name()
            )))
        }
        async fn append(&self, _table: &TableDefinition, _records: &[Record]) -> Result<()> {
            Err(FactoryError::Sink(anyhow::anyhow!("no route")))
        }
        async fn purge(&self, _table: &TableDefinition) -> Result<()> {
            Err(FactoryError::Sink(anyhow::anyhow!("no route")))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_quality_score() {
        assert_eq!(quality_score(10), 10);
        assert_eq!(quality_score(8), 8);
        assert_eq!(quality_score(12), 8);
        assert_eq!(quality_score(0), 0);
        assert_eq!(quality_score(25), 0);
    }

    #[test]
    fn test_default_sources_fall_back_to_registered_sink() {
        let (recorder, _) = memory_recorder();
        assert_eq!(recorder.sources().len(), 5);
        for source in recorder.sources() {
            assert_eq!(source.sink_id, ids::MEMORY, "source {}", source.name);
        }
    }

    #[tokio::test]
    async fn test_predicate_false_skips() {
        let (recorder, sink) = memory_recorder();
        let part = Part::new(1, "steel");

        // no cut yet
        let outcome = recorder
            .record(sources::CUTTING, &ctx("cutting1", "Cutting Machine"), &part)
            .await;
        assert_eq!(outcome, RecordOutcome::Skipped);

        // not the complete node
        let outcome = recorder
            .record(sources::COMPLETE, &ctx("reject", "Reject"), &part)
            .await;
        assert_eq!(outcome, RecordOutcome::Skipped);
        assert_eq!(sink.total_rows().await, 0);
    }

    #[tokio::test]
    async fn test_record_delivers_projected_row() {
        let (recorder, sink) = memory_recorder();
        let mut part = Part::new(7, "steel");
        part.attributes.cut_value = 11;
        part.visit(&NodeId::from("start"));
        part.visit(&NodeId::from("cutting1"));

        let outcome = recorder
            .record(sources::COMPLETE, &ctx(COMPLETE_NODE, "Complete"), &part)
            .await;
        assert_eq!(outcome, RecordOutcome::Delivered);

        let table = &recorder.source(sources::COMPLETE).unwrap().table;
        let rows = sink.rows(table).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["part_id"], json!("part7"));
        assert_eq!(rows[0]["processing_time"], json!(3.0));
        assert_eq!(rows[0]["quality_score"], json!(9));
        assert_eq!(rows[0].len(), 4);
    }

    #[tokio::test]
    async fn test_missing_required_column_drops_event() {
        let registry = Arc::new(SinkRegistry::new());
        let sink = Arc::new(InMemorySink::new());
        registry.register(ids::MEMORY, sink.clone());

        let mut recorder = Recorder::new(registry);
        recorder.add_source(DataSource::new(
            "partial",
            ids::MEMORY,
            TableDefinition::new(
                "partial",
                "test",
                vec![
                    ColumnDefinition::required("part_id", ColumnType::Text),
                    ColumnDefinition::required("quality_value", ColumnType::Int),
                ],
            ),
            |_, _| true,
            |_, part| {
                let mut r = Record::new();
                r.insert("part_id".into(), json!(part.id));
                r
            },
        ));

        let outcome = recorder
            .record("partial", &ctx("sensor1", "Sensor"), &Part::new(1, "steel"))
            .await;

        assert_eq!(outcome, RecordOutcome::Dropped);
        assert_eq!(sink.total_rows().await, 0);
        assert_eq!(recorder.reports()[0].dropped, 1);
    }

    #[tokio::test]
    async fn test_null_required_column_drops_event() {
        let registry = Arc::new(SinkRegistry::new());
        let sink = Arc::new(InMemorySink::new());
        registry.register(ids::MEMORY, sink.clone());

        let mut recorder = Recorder::new(registry);
        recorder.add_source(DataSource::new(
            "nulls",
            ids::MEMORY,
            TableDefinition::new(
                "nulls",
                "test",
                vec![ColumnDefinition::required("part_id", ColumnType::Text)],
            ),
            |_, _| true,
            |_, _| {
                let mut r = Record::new();
                r.insert("part_id".into(), serde_json::Value::Null);
                r
            },
        ));

        let outcome = recorder
            .record("nulls", &ctx("sensor1", "Sensor"), &Part::new(1, "steel"))
            .await;

        assert_eq!(outcome, RecordOutcome::Dropped);
        assert_eq!(sink.total_rows().await, 0);
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported_not_raised() {
        let registry = Arc::new(SinkRegistry::new());
        registry.register(ids::MEMORY, Arc::new(FailingSink));
        let recorder = Recorder::with_default_sources(registry, "test");

        let outcome = recorder
            .record(sources::REJECT, &ctx(REJECT_NODE, "Reject"), &Part::new(3, "steel"))
            .await;

        assert_eq!(outcome, RecordOutcome::Failed);
        let report = recorder
            .reports()
            .into_iter()
            .find(|r| r.name == sources::REJECT)
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.table, "test.rejected_parts");
    }

    #[tokio::test]
    async fn test_unregistered_sink_fails() {
        let recorder = Recorder::with_default_sources(Arc::new(SinkRegistry::new()), "test");
        let outcome = recorder
            .record(sources::STATION_METRICS, &ctx("station1", "Station"), &Part::new(1, "steel"))
            .await;
        assert_eq!(outcome, RecordOutcome::Failed);
    }

    #[tokio::test]
    async fn test_prepare_purges_when_configured() {
        let (recorder, sink) = memory_recorder();
        let table = recorder.source(sources::REJECT).unwrap().table.clone();
        sink.append(&table, &[Record::new()]).await.unwrap();

        let recorder = recorder.purge_on_prepare(true);
        recorder.prepare().await.unwrap();

        assert!(sink.rows(&table).await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_carries_on_past_unreachable_sink() {
        let registry = Arc::new(SinkRegistry::new());
        let memory = Arc::new(InMemorySink::new());
        registry.register(ids::NATS, Arc::new(UnreachableSink));
        registry.register(ids::MEMORY, memory.clone());
        let recorder = Recorder::with_default_sources(registry, "test").purge_on_prepare(true);

        // cutting and complete prefer nats, the rest land in memory
        assert_eq!(recorder.source(sources::CUTTING).unwrap().sink_id, ids::NATS);
        let table = recorder.source(sources::REJECT).unwrap().table.clone();
        memory.append(&table, &[Record::new()]).await.unwrap();

        let err = recorder.prepare().await.unwrap_err();

        assert!(err.to_string().contains("2 of 5"), "{}", err);
        assert!(memory.rows(&table).await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_all_carries_on_past_unreachable_sink() {
        let registry = Arc::new(SinkRegistry::new());
        let memory = Arc::new(InMemorySink::new());
        registry.register(ids::NATS, Arc::new(UnreachableSink));
        registry.register(ids::MEMORY, memory.clone());
        let recorder = Recorder::with_default_sources(registry, "test");

        let table = recorder.source(sources::STATION_METRICS).unwrap().table.clone();
        memory.append(&table, &[Record::new()]).await.unwrap();

        assert!(recorder.purge_all().await.is_err());
        assert!(memory.rows(&table).await.is_empty());
    }
}
