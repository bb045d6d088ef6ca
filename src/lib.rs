// Factory Simulator
// A concurrent production-line engine for exercising telemetry pipelines

//! # Factory Simulator Library
//!
//! This crate models a production line as a directed graph of concurrently
//! running stations. Parts are generated at a configurable rate, flow through
//! the graph one bounded queue at a time and end up either completed or
//! rejected. Along the way node behaviors emit telemetry to pluggable sinks.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Part`]: the unit of work, with its processing history and attributes
//! - [`NodeId`] / [`NodeKind`] / [`MachineState`]: node identity, type and activity
//! - [`TableDefinition`]: the schema of a telemetry table
//!
//! ### Engine
//! - [`Factory`]: owns the node arena and the edge lists, answers snapshot queries
//! - [`Recorder`] / [`DataSource`]: conditional telemetry forwarding
//! - [`Sink`]: telemetry backend abstraction with relational, file,
//!   publish/subscribe and in-memory implementations
//! - [`Simulation`]: one worker task per node, the part generator and the
//!   cancel, drain, close shutdown sequence
//!
//! ## Usage Example:
//! ```rust,no_run
//! use std::sync::Arc;
//! use factory_sim::{Factory, Recorder, Simulation, SimulationConfig, SinkRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> factory_sim::Result<()> {
//! let config = SimulationConfig::default();
//! let factory = Arc::new(Factory::standard_line(config.queue_capacity)?);
//! let recorder = Arc::new(Recorder::with_default_sources(Arc::new(SinkRegistry::new()), "test"));
//! let simulation = Simulation::new(factory, recorder, config)?;
//!
//! let shutdown = CancellationToken::new();
//! let report = simulation.run(shutdown.clone()).await?;
//! println!("completed {} parts", report.completed);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod models;
pub mod settings;

pub use settings::{LineLayout, SimulationConfig, SinkSettings};

pub use models::{
    ColumnDefinition, ColumnType, HistoryEntry, MachineState, NodeId, NodeKind, Part,
    PartAttributes, Record, TableDefinition,
};

pub use engine::{
    behaviors::Route,
    events::{EventBus, EventLog, SimEvent},
    factory::{Factory, FactoryDefinition, NodeDefinition, NodeSnapshot, NodeUpdate},
    file_sink::DelimitedFileSink,
    nats_sink::{NatsSink, NatsSinkConfig},
    postgres_sink::PostgresSink,
    simulation::{SaturationPolicy, Simulation, SimulationPhase, SimulationReport},
    sink::{InMemorySink, Sink, SinkRegistry},
    telemetry::{DataSource, RecordOutcome, Recorder, SourceReport, TelemetryContext},
};

use thiserror::Error;

/// Errors raised by the factory engine
///
/// Configuration variants are fatal and only ever surface while a factory is
/// being built or a simulation is being set up. Sink variants surface from
/// [`Sink`] calls; the recorder logs them and carries on.
#[derive(Error, Debug)]
pub enum FactoryError {
    /// A non-reject node was added before the reject node existed
    #[error("Node '{node}' has no fallback: register '{}' first", models::REJECT_NODE)]
    MissingFallback { node: String },

    /// An edge or child referenced a node that was never registered
    #[error("Unknown node: {id}")]
    UnknownNode { id: String },

    /// Two nodes were registered under the same identifier
    #[error("Duplicate node: {id}")]
    DuplicateNode { id: String },

    /// Terminal nodes cannot have outgoing edges
    #[error("Terminal node '{from}' cannot have outgoing edges (attempted edge to '{to}')")]
    TerminalEdge { from: String, to: String },

    /// A node-type setting is out of range (probability outside `[0, 1]`, NaN...)
    #[error("Invalid setting for node '{node}': {reason}")]
    InvalidParameter { node: String, reason: String },

    /// The generator needs a start node to feed
    #[error("Factory has no '{}' node", models::START_NODE)]
    MissingStartNode,

    /// A run was requested but a node's queue receiver is already taken
    #[error("Queue for node '{node}' is not available (simulation already ran?)")]
    QueueUnavailable { node: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Telemetry sink failures (NATS, files, ...)
    #[error("Sink error: {0}")]
    Sink(#[from] anyhow::Error),

    /// Relational sink failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FactoryError {
    /// Whether this error should stop startup rather than be logged and skipped
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FactoryError::MissingFallback { .. }
                | FactoryError::UnknownNode { .. }
                | FactoryError::DuplicateNode { .. }
                | FactoryError::TerminalEdge { .. }
                | FactoryError::InvalidParameter { .. }
                | FactoryError::MissingStartNode
                | FactoryError::Config(_)
        )
    }
}

impl From<::config::ConfigError> for FactoryError {
    fn from(err: ::config::ConfigError) -> Self {
        FactoryError::Config(err.to_string())
    }
}

/// Type alias for Results that use our error type
pub type Result<T> = std::result::Result<T, FactoryError>;
