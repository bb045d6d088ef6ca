// Core domain models for the factory simulator
// Plain data: parts, node identities and types, telemetry tables

//! # Domain Models Module
//!
//! This module holds the data the engine moves around. Nothing here spawns a
//! task or talks to a sink; behaviors and the driver live in `engine`.
//!
//! - [`part`]: the work item and its history
//! - [`node`]: node identifiers, activity states and the closed set of node types
//! - [`table`]: telemetry table definitions shared by every sink

pub mod node;
pub mod part;
pub mod table;

pub use node::{MachineState, NodeId, NodeKind, COMPLETE_NODE, REJECT_NODE, START_NODE};
pub use part::{HistoryEntry, Part, PartAttributes};
pub use table::{ColumnDefinition, ColumnType, Record, TableDefinition};
