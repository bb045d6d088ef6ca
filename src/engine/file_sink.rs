// Delimited-file telemetry sink

//! # Delimited File Sink
//!
//! Writes each table to `{dir}/{schema}.{table}.csv`. The header row is
//! written once, when the file is first created or found empty; every batch
//! is flushed before `append` returns.
//!
//! Values are rendered in column order. Missing (nullable) values become
//! empty fields, strings are written bare unless they contain the delimiter,
//! a quote or a line break, in which case they are quoted with doubled quotes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

use super::sink::Sink;
use crate::models::{Record, TableDefinition};
use crate::Result;

/// Delimited-file implementation of [`Sink`]
pub struct DelimitedFileSink {
    dir: PathBuf,
    delimiter: char,
    files: Mutex<HashMap<String, BufWriter<File>>>,
}

impl DelimitedFileSink {
    pub fn new<P: Into<PathBuf>>(dir: P, delimiter: char) -> Self {
        Self {
            dir: dir.into(),
            delimiter,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Comma-separated files in `dir`
    pub fn csv<P: Into<PathBuf>>(dir: P) -> Self {
        Self::new(dir, ',')
    }

    /// Path of the file backing `table`
    pub fn path_for(&self, table: &TableDefinition) -> PathBuf {
        self.dir.join(format!("{}.csv", table.qualified_name()))
    }

    fn header(&self, table: &TableDefinition) -> String {
        let fields: Vec<String> = table
            .column_names()
            .into_iter()
            .map(|name| self.escape(name))
            .collect();
        fields.join(&self.delimiter.to_string())
    }

    fn row(&self, table: &TableDefinition, record: &Record) -> String {
        let fields: Vec<String> = table
            .columns
            .iter()
            .map(|column| match record.get(&column.name) {
                None | Some(serde_json::Value::Null) => String::new(),
                Some(serde_json::Value::String(s)) => self.escape(s),
                Some(other) => self.escape(&other.to_string()),
            })
            .collect();
        fields.join(&self.delimiter.to_string())
    }

    fn escape(&self, value: &str) -> String {
        let needs_quotes = value.contains(self.delimiter)
            || value.contains('"')
            || value.contains('\n')
            || value.contains('\r');
        if needs_quotes {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }

    async fn open(&self, path: &Path, table: &TableDefinition) -> Result<BufWriter<File>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let is_empty = file.metadata().await?.len() == 0;
        let mut writer = BufWriter::new(file);
        if is_empty {
            writer.write_all(self.header(table).as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            debug!(path = %path.display(), "Wrote delimited header");
        }
        Ok(writer)
    }
}

#[async_trait::async_trait]
impl Sink for DelimitedFileSink {
    async fn ensure_schema(&self, table: &TableDefinition) -> Result<()> {
        let key = table.qualified_name();
        let mut files = self.files.lock().await;
        if !files.contains_key(&key) {
            let writer = self.open(&self.path_for(table), table).await?;
            files.insert(key, writer);
        }
        Ok(())
    }

    async fn append(&self, table: &TableDefinition, records: &[Record]) -> Result<()> {
        let key = table.qualified_name();
        let mut files = self.files.lock().await;
        if !files.contains_key(&key) {
            let writer = self.open(&self.path_for(table), table).await?;
            files.insert(key.clone(), writer);
        }
        let writer = files
            .get_mut(&key)
            .ok_or_else(|| anyhow::anyhow!("no open file for {}", key))?;

        for record in records {
            writer.write_all(self.row(table, record).as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn purge(&self, table: &TableDefinition) -> Result<()> {
        let key = table.qualified_name();
        let mut files = self.files.lock().await;
        if let Some(mut writer) = files.remove(&key) {
            writer.flush().await?;
        }

        let path = self.path_for(table);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let writer = self.open(&path, table).await?;
        files.insert(key, writer);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut files = self.files.lock().await;
        for (_, mut writer) in files.drain() {
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDefinition, ColumnType};
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("factory-csv-{}", uuid::Uuid::new_v4()))
    }

    fn table() -> TableDefinition {
        TableDefinition::new(
            "station_throughput",
            "test",
            vec![
                ColumnDefinition::required("station_id", ColumnType::Text),
                ColumnDefinition::required("queue_size", ColumnType::Int),
                ColumnDefinition::optional("note", ColumnType::Text),
            ],
        )
    }

    fn record(station: &str, depth: i64) -> Record {
        let mut r = Record::new();
        r.insert("station_id".into(), json!(station));
        r.insert("queue_size".into(), json!(depth));
        r
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = temp_dir();
        let sink = DelimitedFileSink::csv(&dir);
        let table = table();

        sink.ensure_schema(&table).await.unwrap();
        sink.append(&table, &[record("station1", 3)]).await.unwrap();
        sink.close().await.unwrap();

        // a second sink on the same directory must not repeat the header
        let reopened = DelimitedFileSink::csv(&dir);
        reopened.append(&table, &[record("station2", 0)]).await.unwrap();
        reopened.close().await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path_for(&table)).await.unwrap();
        assert_eq!(
            contents,
            "station_id,queue_size,note\nstation1,3,\nstation2,0,\n"
        );

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_values_with_delimiters_are_quoted() {
        let dir = temp_dir();
        let sink = DelimitedFileSink::csv(&dir);
        let table = table();

        let mut r = record("station,1", 1);
        r.insert("note".into(), json!("said \"hi\""));
        sink.append(&table, &[r]).await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path_for(&table)).await.unwrap();
        let line = contents.lines().nth(1).unwrap();
        assert_eq!(line, "\"station,1\",1,\"said \"\"hi\"\"\"");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_purge_keeps_only_header() {
        let dir = temp_dir();
        let sink = DelimitedFileSink::new(&dir, ';');
        let table = table();

        sink.append(&table, &[record("station1", 3)]).await.unwrap();
        sink.purge(&table).await.unwrap();
        sink.close().await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path_for(&table)).await.unwrap();
        assert_eq!(contents, "station_id;queue_size;note\n");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
