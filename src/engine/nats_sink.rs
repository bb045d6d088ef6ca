// NATS JetStream telemetry sink

//! # NATS Sink
//!
//! Publishes every record as one JSON message. Each table gets its own
//! JetStream stream (`{PREFIX}_{SCHEMA}_{TABLE}`, upper-cased) capturing the
//! subject named after the table, so consumers can subscribe to
//! `quality_checks`, `completed_parts` and so on directly.
//!
//! Streams are created on first use with a limits retention policy. Purging a
//! table purges its stream.

use std::collections::HashSet;
use std::time::Duration;

use async_nats::jetstream::{self, stream, Context};
use async_nats::Client;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::sink::Sink;
use crate::models::{Record, TableDefinition};
use crate::Result;

/// Connection and stream settings for [`NatsSink`]
#[derive(Debug, Clone)]
pub struct NatsSinkConfig {
    pub url: String,
    /// Prefix of every stream name
    pub stream_prefix: String,
    pub max_messages: i64,
    pub max_age: Duration,
}

impl Default for NatsSinkConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_prefix: "FACTORY".to_string(),
            max_messages: 1_000_000,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl NatsSinkConfig {
    pub fn with_url<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// JetStream implementation of [`Sink`]
pub struct NatsSink {
    client: Client,
    jetstream: Context,
    config: NatsSinkConfig,
    known_streams: RwLock<HashSet<String>>,
}

impl NatsSink {
    /// Connect to the server named in `config`
    pub async fn connect(config: NatsSinkConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to NATS at {}: {}", config.url, e))?;
        let jetstream = jetstream::new(client.clone());
        info!(url = %config.url, "Connected to NATS");

        Ok(Self {
            client,
            jetstream,
            config,
            known_streams: RwLock::new(HashSet::new()),
        })
    }

    /// Stream name for `table`
    pub fn stream_name(&self, table: &TableDefinition) -> String {
        stream_name(&self.config.stream_prefix, table)
    }

    async fn ensure_stream(&self, table: &TableDefinition) -> Result<()> {
        let name = self.stream_name(table);
        if self.known_streams.read().await.contains(&name) {
            return Ok(());
        }

        let stream_config = stream::Config {
            name: name.clone(),
            subjects: vec![table.name.clone()],
            max_messages: self.config.max_messages,
            max_age: self.config.max_age,
            storage: stream::StorageType::File,
            num_replicas: 1,
            retention: stream::RetentionPolicy::Limits,
            discard: stream::DiscardPolicy::Old,
            ..Default::default()
        };
        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create NATS stream {}: {}", name, e))?;

        debug!(stream = %name, subject = %table.name, "NATS stream ready");
        self.known_streams.write().await.insert(name);
        Ok(())
    }
}

fn stream_name(prefix: &str, table: &TableDefinition) -> String {
    format!("{}_{}_{}", prefix, table.schema, table.name)
        .to_uppercase()
        .replace(['.', ' ', '*', '>'], "_")
}

#[async_trait::async_trait]
impl Sink for NatsSink {
    async fn ensure_schema(&self, table: &TableDefinition) -> Result<()> {
        self.ensure_stream(table).await
    }

    async fn append(&self, table: &TableDefinition, records: &[Record]) -> Result<()> {
        self.ensure_stream(table).await?;

        for record in records {
            let payload = serde_json::to_vec(record)?;
            let ack = self
                .jetstream
                .publish(table.name.clone(), payload.into())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to publish to {}: {}", table.name, e))?;
            ack.await
                .map_err(|e| anyhow::anyhow!("No publish acknowledgment for {}: {}", table.name, e))?;
        }
        Ok(())
    }

    async fn purge(&self, table: &TableDefinition) -> Result<()> {
        self.ensure_stream(table).await?;
        let name = self.stream_name(table);
        let stream = self
            .jetstream
            .get_stream(&name)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get NATS stream {}: {}", name, e))?;
        stream
            .purge()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to purge NATS stream {}: {}", name, e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to flush NATS client: {}", e))?;
        Ok(())
    }
}
