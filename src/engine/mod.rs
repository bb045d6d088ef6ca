// Factory Simulator Engine
// Everything that runs: the factory graph, node behaviors, telemetry and the driver

//! # Engine Module
//!
//! The engine is the layer between the domain models and the outside world.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: parts, node types and table definitions (in `models/`)
//! - **Engine Layer**: graph ownership, behaviors, telemetry, simulation (this module)
//! - **Binary**: configuration, sink wiring and signal handling (in `bin/`)
//!
//! ## Engine Components
//!
//! ### Factory (`factory` module)
//! - Flat node arena with bounded per-node queues
//! - Ordered child and successor lists, reverse lookups on demand
//! - Snapshot queries and administrative edits
//!
//! ### Behaviors (`behaviors` module)
//! - One routing decision per node type
//! - Station load balancing as a pure function
//!
//! ### Telemetry (`telemetry`, `sink`, `*_sink` modules)
//! - Data sources gated by predicates
//! - Relational, delimited-file, JetStream and in-memory sinks
//!
//! ### Events (`events` module)
//! - Broadcast bus of part state changes and hand-offs
//! - Optional line-oriented event log
//!
//! ### Simulation (`simulation` module)
//! - One worker per node plus a part generator
//! - Cancellation, bounded drain and queue closing
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for API Design
//! The `pub use` statements flatten the module hierarchy so callers can
//! write `engine::Factory` instead of `engine::factory::Factory`.

/// Node-type routing decisions
pub mod behaviors;

/// Event bus and event log
pub mod events;

/// Node arena, edges and snapshot queries
pub mod factory;

/// Delimited-file sink
pub mod file_sink;

/// NATS JetStream sink
pub mod nats_sink;

/// PostgreSQL sink
pub mod postgres_sink;

/// Simulation driver
pub mod simulation;

/// Sink trait, in-memory sink and registry
pub mod sink;

/// Data sources and the recorder
pub mod telemetry;

pub use behaviors::{balance, transition, ChildLoad, Route, TransitionContext};
pub use events::{EventBus, EventLog, SimEvent};
pub use factory::{
    EdgeDefinition, Factory, FactoryDefinition, Node, NodeDefinition, NodeRuntime, NodeSettings,
    NodeSnapshot, NodeUpdate,
};
pub use file_sink::DelimitedFileSink;
pub use nats_sink::{NatsSink, NatsSinkConfig};
pub use postgres_sink::PostgresSink;
pub use simulation::{SaturationPolicy, Simulation, SimulationPhase, SimulationReport};
pub use sink::{InMemorySink, Sink, SinkRegistry};
pub use telemetry::{DataSource, RecordOutcome, Recorder, SourceReport, TelemetryContext};

#[cfg(test)]
mod simulation_tests;
