// Node identity, activity state and node-type configuration

//! # Node Models
//!
//! A factory is a graph of **nodes**. Every node owns a bounded queue of parts
//! and one behavior, selected by its [`NodeKind`]. This module contains the
//! plain data side of a node:
//! - [`NodeId`]: the stable identifier used for every edge in the graph
//! - [`MachineState`]: what the node's worker is doing right now
//! - [`NodeKind`]: the closed set of node types and their per-instance settings
//!
//! ## Edges Are Identifiers
//!
//! Stations reference their children, children route back to stations, and
//! everything routes to the reject node. Holding those as object references
//! would create ownership cycles, so every edge in the factory is a `NodeId`
//! looked up in the factory's arena when it is needed.
//!
//! ## Rust Learning Notes:
//!
//! ### Tagged Enums with Serde
//! `#[serde(tag = "type")]` stores the variant name next to its fields:
//! `{"type": "worker", "skill": 0.8}`. That keeps factory definitions in JSON
//! or TOML flat and readable.

use serde::{Deserialize, Serialize};

/// Identifier of the node every non-terminal node falls back to.
pub const REJECT_NODE: &str = "reject";

/// Identifier of the node the part generator feeds.
pub const START_NODE: &str = "start";

/// Identifier of the node good parts finish in.
pub const COMPLETE_NODE: &str = "complete";

/// **Node identifier** - unique within a factory and immutable after creation
///
/// ```rust
/// # use factory_sim::NodeId;
/// let node = NodeId::from("cutting1");
/// assert_eq!(node.as_str(), "cutting1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Get the node identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Create a new node identifier from any string-like input
    pub fn new<S: Into<String>>(name: S) -> Self {
        NodeId(name.into())
    }

    /// The conventional reject node identifier
    pub fn reject() -> Self {
        NodeId::from(REJECT_NODE)
    }

    /// The conventional start node identifier
    pub fn start() -> Self {
        NodeId::from(START_NODE)
    }

    /// The conventional complete node identifier
    pub fn complete() -> Self {
        NodeId::from(COMPLETE_NODE)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Activity state of a node's worker
///
/// Stations read the state of their children to prefer idle ones, so the
/// state is stored as an atomic byte on the node (see [`MachineState::as_u8`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    /// Waiting for a part
    Idle,
    /// Holding a part for its processing time
    Processing,
    /// Finished with the part, deciding or handing it off
    Processed,
    /// The last part triggered a machine failure
    Faulty,
}

impl MachineState {
    pub fn as_u8(self) -> u8 {
        match self {
            MachineState::Idle => 0,
            MachineState::Processing => 1,
            MachineState::Processed => 2,
            MachineState::Faulty => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MachineState::Processing,
            2 => MachineState::Processed,
            3 => MachineState::Faulty,
            _ => MachineState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "Idle",
            MachineState::Processing => "Processing",
            MachineState::Processed => "Processed",
            MachineState::Faulty => "Faulty",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of node types
///
/// Each variant carries the per-instance settings its behavior needs. The
/// behavior itself lives in `engine::behaviors`, dispatched by a single
/// `match` so that adding a variant forces every routing decision to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; forwards to its single successor
    Start,
    /// Terminal sink for parts that failed somewhere
    Reject,
    /// Terminal sink for good parts
    Complete,
    /// Load-balancing router over its children
    Station,
    /// Cuts a part, producing a measurement in `[0, 16)`
    CuttingMachine {
        /// Probability that a cut breaks the machine and the part is rejected
        #[serde(default)]
        failure_rate: f64,
        /// Dullness added per cut, capped at 1.0
        #[serde(default)]
        wear_per_cut: f64,
        /// Defect probability of a perfectly sharp blade
        #[serde(default)]
        base_defect_rate: f64,
    },
    /// Quality gate on the cut measurement
    Sensor {
        /// Where out-of-band parts are sent for another cut. When unset the
        /// station feeding this sensor's station is used.
        #[serde(default)]
        retry_station: Option<NodeId>,
    },
    /// Manual rework of one defect per visit
    Worker {
        /// Probability of repairing a defect, in `[0, 1]`
        skill: f64,
    },
    /// Bounded store for allow-listed materials
    Inventory {
        materials: Vec<String>,
        capacity: usize,
    },
    /// Removes up to `capacity` defects per pass
    RepairStation { capacity: u32 },
    /// Adds sub-assemblies to the part
    AssemblyStation {
        #[serde(default = "default_added_weight")]
        added_weight: f64,
    },
    /// Marks the part as packaged
    Packaging,
}

fn default_added_weight() -> f64 {
    0.5
}

impl NodeKind {
    /// Baseline cutting machine with no wear and no failures
    pub fn cutting_machine() -> Self {
        NodeKind::CuttingMachine {
            failure_rate: 0.0,
            wear_per_cut: 0.0,
            base_defect_rate: 0.0,
        }
    }

    /// Sensor whose retry target is worked out from the graph
    pub fn sensor() -> Self {
        NodeKind::Sensor { retry_station: None }
    }

    /// Human-readable type name used in snapshots and telemetry
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::Reject => "Reject",
            NodeKind::Complete => "Complete",
            NodeKind::Station => "Station",
            NodeKind::CuttingMachine { .. } => "Cutting Machine",
            NodeKind::Sensor { .. } => "Sensor",
            NodeKind::Worker { .. } => "Worker",
            NodeKind::Inventory { .. } => "Inventory",
            NodeKind::RepairStation { .. } => "Repair Station",
            NodeKind::AssemblyStation { .. } => "Assembly Station",
            NodeKind::Packaging => "Packaging",
        }
    }

    /// Terminal nodes consume parts and have no outgoing edges
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Reject | NodeKind::Complete)
    }

    pub fn is_station(&self) -> bool {
        matches!(self, NodeKind::Station)
    }

    /// Describe the first setting that is out of range, if any
    ///
    /// Probabilities must lie in `[0, 1]`; weights must be finite.
    pub fn invalid_parameter(&self) -> Option<String> {
        let probabilities: Vec<(&str, f64)> = match self {
            NodeKind::CuttingMachine {
                failure_rate,
                wear_per_cut,
                base_defect_rate,
            } => vec![
                ("failure_rate", *failure_rate),
                ("wear_per_cut", *wear_per_cut),
                ("base_defect_rate", *base_defect_rate),
            ],
            NodeKind::Worker { skill } => vec![("skill", *skill)],
            NodeKind::AssemblyStation { added_weight } if !added_weight.is_finite() => {
                return Some(format!("added_weight must be finite, got {}", added_weight));
            }
            _ => Vec::new(),
        };
        probabilities
            .into_iter()
            .find(|(_, p)| !(0.0..=1.0).contains(p))
            .map(|(name, p)| format!("{} must be within [0, 1], got {}", name, p))
    }
}
