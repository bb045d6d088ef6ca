// Part domain model - the unit of work flowing through the factory

//! # Part Models
//!
//! A [`Part`] is created by the generator, travels from queue to queue and is
//! dropped when it reaches a terminal node. Along the way it collects:
//! - a **history** of every node that processed it, in processing order
//! - **attributes** that node behaviors read and mutate (cut measurement,
//!   defects, material, weight, ...)
//!
//! ## Ownership
//!
//! A part is moved into a queue, moved out by exactly one worker and moved on
//! to the next queue. Nobody else ever holds it, so the history needs no lock:
//! its order is the order in which the part was actually processed.
//!
//! ## Rust Learning Notes:
//!
//! ### Move Semantics
//! `mpsc::Sender::send(part)` takes the `Part` by value. After the call the
//! sending worker can no longer touch it, which is exactly the "one node at a
//! time" rule the factory relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::NodeId;

/// One entry in a part's processing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The node that processed the part
    pub node: NodeId,

    /// When processing finished (UTC)
    pub timestamp: DateTime<Utc>,
}

/// Mutable process attributes carried by a part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartAttributes {
    /// How many times the part went through a cutting machine
    pub cut_attempts: u32,

    /// Last cut measurement, in `[0, 16)`
    pub cut_value: i64,

    /// Outstanding defects
    pub defects: u32,

    /// Material tag checked by inventories
    pub material: String,

    /// Accumulated weight
    pub weight: f64,

    /// Set by packaging
    pub packaged: bool,

    /// Every accepted sensor reading
    pub sensor_readings: Vec<i64>,

    /// Inventory the part was booked into, if any
    pub stored_in: Option<NodeId>,
}

impl PartAttributes {
    pub fn new<M: Into<String>>(material: M) -> Self {
        Self {
            cut_attempts: 0,
            cut_value: 0,
            defects: 0,
            material: material.into(),
            weight: 1.0,
            packaged: false,
            sensor_readings: Vec::new(),
            stored_in: None,
        }
    }
}

/// A work item moving through the factory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    /// Unique identifier, `part{serial}`
    pub id: String,

    /// Generator sequence number
    pub serial: u64,

    /// When the generator created the part
    pub created_at: DateTime<Utc>,

    /// Nodes that processed the part, oldest first. Append-only.
    history: Vec<HistoryEntry>,

    /// Attributes mutated by node behaviors
    pub attributes: PartAttributes,
}

impl Part {
    /// Create a fresh part with an empty history
    pub fn new<M: Into<String>>(serial: u64, material: M) -> Self {
        Part {
            id: format!("part{}", serial),
            serial,
            created_at: Utc::now(),
            history: Vec::new(),
            attributes: PartAttributes::new(material),
        }
    }

    /// Record that `node` processed this part
    pub fn visit(&mut self, node: &NodeId) {
        self.history.push(HistoryEntry {
            node: node.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// The node that most recently processed this part
    pub fn last_node(&self) -> Option<&NodeId> {
        self.history.last().map(|entry| &entry.node)
    }

    /// Whether the part visited `node` at any point
    pub fn visited(&self, node: &NodeId) -> bool {
        self.history.iter().any(|entry| &entry.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_part() {
        let part = Part::new(7, "steel");

        assert_eq!(part.id, "part7");
        assert_eq!(part.serial, 7);
        assert_eq!(part.history_len(), 0);
        assert_eq!(part.attributes.cut_attempts, 0);
        assert_eq!(part.attributes.material, "steel");
        assert!(part.last_node().is_none());
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let mut part = Part::new(1, "steel");

        part.visit(&NodeId::from("start"));
        part.visit(&NodeId::from("station1"));
        part.visit(&NodeId::from("cutting2"));

        let visited: Vec<&str> = part.history().iter().map(|e| e.node.as_str()).collect();
        assert_eq!(visited, vec!["start", "station1", "cutting2"]);
        assert_eq!(part.last_node(), Some(&NodeId::from("cutting2")));
        assert!(part.visited(&NodeId::from("station1")));
        assert!(!part.visited(&NodeId::from("reject")));

        let stamps: Vec<_> = part.history().iter().map(|e| e.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }
}
