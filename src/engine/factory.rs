// Factory - node arena, edge lists and snapshot queries

//! # Factory
//!
//! The [`Factory`] owns every [`Node`] of a production line in a flat arena
//! indexed by [`NodeId`]. It is built once with `&mut self` methods
//! ([`add_node`](Factory::add_node), [`add_edge`](Factory::add_edge)), then
//! wrapped in an `Arc` and shared by the simulation workers.
//!
//! ## Building a Line
//!
//! ```rust
//! use std::time::Duration;
//! use factory_sim::{Factory, NodeId, NodeKind};
//!
//! # fn build() -> factory_sim::Result<Factory> {
//! let mut factory = Factory::new();
//! factory.add_node("reject", NodeKind::Reject, vec![], Duration::ZERO, 0)?;
//! factory.add_node("start", NodeKind::Start, vec![], Duration::ZERO, 0)?;
//! factory.add_node("complete", NodeKind::Complete, vec![], Duration::ZERO, 0)?;
//! factory.add_node("cutting1", NodeKind::cutting_machine(), vec![], Duration::from_secs(2), 0)?;
//! factory.add_node("station1", NodeKind::Station, vec![NodeId::from("cutting1")], Duration::ZERO, 0)?;
//! factory.add_edge("start", "station1")?;
//! factory.add_edge("station1", "complete")?;
//! # Ok(factory)
//! # }
//! ```
//!
//! The reject node must be registered first: every other node resolves its
//! fallback to it when it is added.
//!
//! ## Node Internals
//!
//! | Field | Type | Touched by |
//! |-------|------|------------|
//! | state | `AtomicU8` | its worker; read by stations |
//! | settings | `RwLock<NodeSettings>` | snapshotted by its worker, written by admin edits |
//! | runtime | `Mutex<NodeRuntime>` | its worker only |
//! | queue | bounded `mpsc` channel | any producer; one consumer |
//!
//! Workers copy their settings under a read lock and release it before
//! looking at any other node, so no task ever holds two node locks.
//!
//! ## Rust Learning Notes:
//!
//! ### Arena + Index
//! `Vec<Node>` plus `HashMap<NodeId, usize>` gives stable iteration order
//! (registration order) and O(1) lookup without reference cycles.
//!
//! ### `RwLock::get_mut`
//! While the factory is still being built we hold `&mut self`, so locks can
//! be bypassed entirely with `get_mut()`; no `.await` is needed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::models::{MachineState, NodeId, NodeKind, Part, REJECT_NODE};
use crate::settings::LineLayout;
use crate::{FactoryError, Result};

/// Queue capacity used when a node is added with capacity 0
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Configuration of a node that administrators may change at runtime
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub kind: NodeKind,
    /// Ordered child IDs (stations only)
    pub children: Vec<NodeId>,
    /// Ordered outgoing edges
    pub successors: Vec<NodeId>,
    pub processing_time: Duration,
}

/// Mutable state owned by a node's worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRuntime {
    /// Parts booked into an inventory
    pub stored_count: usize,
    /// Blade wear of a cutting machine, in `[0, 1]`
    pub dullness: f64,
    /// Parts processed so far
    pub uses: u64,
}

/// One vertex of the factory graph
pub struct Node {
    id: NodeId,
    state: AtomicU8,
    settings: RwLock<NodeSettings>,
    runtime: Mutex<NodeRuntime>,
    sender: mpsc::Sender<Part>,
    receiver: Mutex<Option<mpsc::Receiver<Part>>>,
    closed: AtomicBool,
    fallback: Option<NodeId>,
    capacity: usize,
}

impl Node {
    fn new(id: NodeId, settings: NodeSettings, fallback: Option<NodeId>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            id,
            state: AtomicU8::new(MachineState::Idle.as_u8()),
            settings: RwLock::new(settings),
            runtime: Mutex::new(NodeRuntime::default()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
            fallback,
            capacity,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The reject node, `None` only for the reject node itself
    pub fn fallback(&self) -> Option<&NodeId> {
        self.fallback.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> MachineState {
        MachineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: MachineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Parts currently waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn sender(&self) -> &mpsc::Sender<Part> {
        &self.sender
    }

    /// Whether the driver has closed this node's queue
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Copy of the current settings; the read lock is released on return
    pub async fn settings(&self) -> NodeSettings {
        self.settings.read().await.clone()
    }

    pub(crate) fn runtime(&self) -> &Mutex<NodeRuntime> {
        &self.runtime
    }

    /// Copy of the worker-owned runtime counters
    pub async fn runtime_snapshot(&self) -> NodeRuntime {
        self.runtime.lock().await.clone()
    }

    /// Hand the queue's consumer end to a worker. Only the first call succeeds.
    pub(crate) async fn take_receiver(&self) -> Option<mpsc::Receiver<Part>> {
        self.receiver.lock().await.take()
    }

    /// Give back a receiver taken by a run that never started
    pub(crate) async fn restore_receiver(&self, receiver: mpsc::Receiver<Part>) {
        *self.receiver.lock().await = Some(receiver);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Serializable view of a node, keyed the way dashboards expect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(rename = "childIDs")]
    pub child_ids: Vec<NodeId>,
    #[serde(rename = "nextIDs")]
    pub next_ids: Vec<NodeId>,
    #[serde(rename = "queueDepth")]
    pub queue_depth: usize,
    pub state: MachineState,
    #[serde(rename = "processingTimeSeconds")]
    pub processing_time_seconds: f64,
}

/// Administrative edit; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub kind: Option<NodeKind>,
    #[serde(default)]
    pub children: Option<Vec<NodeId>>,
    #[serde(default)]
    pub successors: Option<Vec<NodeId>>,
    #[serde(default)]
    pub processing_time: Option<Duration>,
}

/// Serde form of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub processing_time_ms: u64,
    /// 0 means the default capacity
    #[serde(default)]
    pub queue_capacity: usize,
}

/// Serde form of one edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: NodeId,
    pub to: NodeId,
}

/// A whole factory as data (JSON, TOML...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactoryDefinition {
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// The production line
#[derive(Debug, Default)]
pub struct Factory {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node
    ///
    /// `queue_capacity` 0 means [`DEFAULT_QUEUE_CAPACITY`]. Children must
    /// already exist. Every node except `reject` gets `reject` as fallback,
    /// so `reject` has to be added first.
    pub fn add_node<I: Into<NodeId>>(
        &mut self,
        id: I,
        kind: NodeKind,
        children: Vec<NodeId>,
        processing_time: Duration,
        queue_capacity: usize,
    ) -> Result<()> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(FactoryError::DuplicateNode { id: id.0 });
        }

        let fallback = if id.as_str() == REJECT_NODE {
            None
        } else {
            let reject = NodeId::reject();
            if !self.index.contains_key(&reject) {
                return Err(FactoryError::MissingFallback { node: id.0 });
            }
            Some(reject)
        };

        if let Some(unknown) = children.iter().find(|c| !self.index.contains_key(*c)) {
            return Err(FactoryError::UnknownNode {
                id: unknown.0.clone(),
            });
        }
        check_parameters(&id, &kind)?;

        let capacity = if queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            queue_capacity
        };

        debug!(node = %id, kind = kind.name(), capacity, "Adding node");
        let settings = NodeSettings {
            kind,
            children,
            successors: Vec::new(),
            processing_time,
        };
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(Node::new(id, settings, fallback, capacity));
        Ok(())
    }

    /// Add a forward edge; adding an existing edge again is a no-op
    pub fn add_edge<F: Into<NodeId>, T: Into<NodeId>>(&mut self, from: F, to: T) -> Result<()> {
        let from = from.into();
        let to = to.into();

        if !self.index.contains_key(&to) {
            return Err(FactoryError::UnknownNode { id: to.0 });
        }
        let i = *self
            .index
            .get(&from)
            .ok_or_else(|| FactoryError::UnknownNode { id: from.0.clone() })?;

        let settings = self.nodes[i].settings.get_mut();
        if settings.kind.is_terminal() {
            return Err(FactoryError::TerminalEdge {
                from: from.0,
                to: to.0,
            });
        }
        if !settings.successors.contains(&to) {
            settings.successors.push(to);
        }
        Ok(())
    }

    fn set_children(&mut self, id: &NodeId, children: Vec<NodeId>) -> Result<()> {
        if let Some(unknown) = children.iter().find(|c| !self.index.contains_key(*c)) {
            return Err(FactoryError::UnknownNode {
                id: unknown.0.clone(),
            });
        }
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| FactoryError::UnknownNode { id: id.0.clone() })?;
        self.nodes[i].settings.get_mut().children = children;
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn require(&self, id: &NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| FactoryError::UnknownNode { id: id.0.clone() })
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in registration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    async fn snapshot(node: &Node) -> NodeSnapshot {
        let settings = node.settings().await;
        NodeSnapshot {
            id: node.id.clone(),
            node_type: settings.kind.name().to_string(),
            child_ids: settings.children,
            next_ids: settings.successors,
            queue_depth: node.queue_depth(),
            state: node.state(),
            processing_time_seconds: settings.processing_time.as_secs_f64(),
        }
    }

    /// Snapshot of every node, keyed by ID
    pub async fn all_nodes(&self) -> BTreeMap<NodeId, NodeSnapshot> {
        let mut snapshots = BTreeMap::new();
        for node in &self.nodes {
            snapshots.insert(node.id.clone(), Self::snapshot(node).await);
        }
        snapshots
    }

    pub async fn node_data(&self, id: &NodeId) -> Option<NodeSnapshot> {
        match self.node(id) {
            Some(node) => Some(Self::snapshot(node).await),
            None => None,
        }
    }

    /// Apply an administrative edit under the node's write lock
    ///
    /// Referenced children and successors must exist, and terminal nodes
    /// cannot gain successors. The worker picks the change up with the next
    /// part it takes.
    pub async fn update_node(&self, id: &NodeId, update: NodeUpdate) -> Result<()> {
        let node = self.require(id)?;

        for referenced in update
            .children
            .iter()
            .flatten()
            .chain(update.successors.iter().flatten())
        {
            if !self.contains(referenced) {
                return Err(FactoryError::UnknownNode {
                    id: referenced.0.clone(),
                });
            }
        }

        if let Some(kind) = &update.kind {
            check_parameters(id, kind)?;
        }

        let mut settings = node.settings.write().await;
        let kind = update.kind.as_ref().unwrap_or(&settings.kind);
        if kind.is_terminal() {
            let successors = update.successors.as_ref().unwrap_or(&settings.successors);
            if let Some(first) = successors.first() {
                return Err(FactoryError::TerminalEdge {
                    from: id.0.clone(),
                    to: first.0.clone(),
                });
            }
        }

        if let Some(kind) = update.kind {
            settings.kind = kind;
        }
        if let Some(children) = update.children {
            settings.children = children;
        }
        if let Some(successors) = update.successors {
            settings.successors = successors;
        }
        if let Some(processing_time) = update.processing_time {
            settings.processing_time = processing_time;
        }
        info!(node = %id, kind = settings.kind.name(), "Node updated");
        Ok(())
    }

    /// Replace a node's children, successors and processing time
    pub async fn set_node_data(
        &self,
        id: &NodeId,
        children: Vec<NodeId>,
        successors: Vec<NodeId>,
        processing_time: Duration,
    ) -> Result<()> {
        self.update_node(
            id,
            NodeUpdate {
                kind: None,
                children: Some(children),
                successors: Some(successors),
                processing_time: Some(processing_time),
            },
        )
        .await
    }

    /// The first station (registration order) listing `id` as a child
    pub async fn parent_station(&self, id: &NodeId) -> Option<NodeId> {
        for node in &self.nodes {
            let settings = node.settings.read().await;
            if settings.kind.is_station() && settings.children.contains(id) {
                return Some(node.id.clone());
            }
        }
        None
    }

    /// The first station with an edge into `station`
    pub async fn upstream_station(&self, station: &NodeId) -> Option<NodeId> {
        for node in &self.nodes {
            let settings = node.settings.read().await;
            if settings.kind.is_station() && settings.successors.contains(station) {
                return Some(node.id.clone());
            }
        }
        None
    }

    /// Successors a node routes along: its own, or inherited from its parent station
    pub async fn effective_successors(&self, id: &NodeId, own: &[NodeId]) -> Vec<NodeId> {
        if !own.is_empty() {
            return own.to_vec();
        }
        match self.parent_station(id).await {
            Some(parent) if &parent != id => match self.node(&parent) {
                Some(node) => node.settings.read().await.successors.clone(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Build a factory from its serde definition
    ///
    /// Nodes may be listed in any order; `reject` is registered first and
    /// children are attached once every node exists.
    pub fn from_definition(definition: &FactoryDefinition) -> Result<Self> {
        let mut factory = Factory::new();

        let (rejects, others): (Vec<&NodeDefinition>, Vec<&NodeDefinition>) = definition
            .nodes
            .iter()
            .partition(|n| n.id.as_str() == REJECT_NODE);

        for node in rejects.iter().chain(others.iter()) {
            factory.add_node(
                node.id.clone(),
                node.kind.clone(),
                Vec::new(),
                Duration::from_millis(node.processing_time_ms),
                node.queue_capacity,
            )?;
        }
        for node in &definition.nodes {
            if !node.children.is_empty() {
                factory.set_children(&node.id, node.children.clone())?;
            }
        }
        for edge in &definition.edges {
            factory.add_edge(edge.from.clone(), edge.to.clone())?;
        }

        info!(nodes = factory.len(), edges = definition.edges.len(), "Factory built from definition");
        Ok(factory)
    }

    /// Parse a JSON factory definition and build it
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: FactoryDefinition = serde_json::from_str(json)?;
        Self::from_definition(&definition)
    }

    pub fn for_layout(layout: LineLayout, queue_capacity: usize) -> Result<Self> {
        match layout {
            LineLayout::Standard => Self::standard_line(queue_capacity),
            LineLayout::Extended => Self::extended_line(queue_capacity),
        }
    }

    fn add_terminals_and_cells(
        &mut self,
        queue_capacity: usize,
        cutting: impl Fn() -> NodeKind,
    ) -> Result<()> {
        self.add_node("reject", NodeKind::Reject, vec![], Duration::ZERO, queue_capacity)?;
        self.add_node("start", NodeKind::Start, vec![], Duration::ZERO, queue_capacity)?;
        self.add_node("complete", NodeKind::Complete, vec![], Duration::ZERO, queue_capacity)?;

        for i in 1..=3 {
            self.add_node(
                format!("cutting{}", i),
                cutting(),
                vec![],
                Duration::from_secs(2),
                queue_capacity,
            )?;
        }
        for i in 1..=3 {
            self.add_node(
                format!("sensor{}", i),
                NodeKind::sensor(),
                vec![],
                Duration::from_secs(1),
                queue_capacity,
            )?;
        }

        let cutters = (1..=3).map(|i| NodeId::new(format!("cutting{}", i))).collect();
        let sensors = (1..=3).map(|i| NodeId::new(format!("sensor{}", i))).collect();
        self.add_node("station1", NodeKind::Station, cutters, Duration::ZERO, queue_capacity)?;
        self.add_node("station2", NodeKind::Station, sensors, Duration::ZERO, queue_capacity)?;
        Ok(())
    }

    /// The reference line
    ///
    /// ```text
    /// start → station1{cutting1..3} → station2{sensor1..3} → complete / reject
    /// ```
    pub fn standard_line(queue_capacity: usize) -> Result<Self> {
        let mut factory = Factory::new();
        factory.add_terminals_and_cells(queue_capacity, NodeKind::cutting_machine)?;

        factory.add_edge("start", "station1")?;
        factory.add_edge("station1", "station2")?;
        factory.add_edge("station2", "complete")?;
        factory.add_edge("station2", "reject")?;
        Ok(factory)
    }

    /// The reference line with wearing cutters and a finishing section
    ///
    /// ```text
    /// start → station1{cutting1..3} → station2{sensor1..3}
    ///       → repair1 → worker1 → assembly1 → inventory1 → packaging1 → complete
    /// ```
    pub fn extended_line(queue_capacity: usize) -> Result<Self> {
        let mut factory = Factory::new();
        factory.add_terminals_and_cells(queue_capacity, || NodeKind::CuttingMachine {
            failure_rate: 0.01,
            wear_per_cut: 0.005,
            base_defect_rate: 0.05,
        })?;

        factory.add_node(
            "repair1",
            NodeKind::RepairStation { capacity: 1 },
            vec![],
            Duration::from_secs(1),
            queue_capacity,
        )?;
        factory.add_node(
            "worker1",
            NodeKind::Worker { skill: 0.8 },
            vec![],
            Duration::from_secs(1),
            queue_capacity,
        )?;
        factory.add_node(
            "assembly1",
            NodeKind::AssemblyStation { added_weight: 0.5 },
            vec![],
            Duration::from_secs(1),
            queue_capacity,
        )?;
        factory.add_node(
            "inventory1",
            NodeKind::Inventory {
                materials: vec!["steel".to_string(), "aluminium".to_string()],
                capacity: 10_000,
            },
            vec![],
            Duration::ZERO,
            queue_capacity,
        )?;
        factory.add_node(
            "packaging1",
            NodeKind::Packaging,
            vec![],
            Duration::from_millis(500),
            queue_capacity,
        )?;

        factory.add_edge("start", "station1")?;
        factory.add_edge("station1", "station2")?;
        factory.add_edge("station2", "repair1")?;
        factory.add_edge("station2", "reject")?;
        factory.add_edge("repair1", "worker1")?;
        factory.add_edge("worker1", "assembly1")?;
        factory.add_edge("assembly1", "inventory1")?;
        factory.add_edge("inventory1", "packaging1")?;
        factory.add_edge("packaging1", "complete")?;
        Ok(factory)
    }
}

fn check_parameters(id: &NodeId, kind: &NodeKind) -> Result<()> {
    match kind.invalid_parameter() {
        Some(reason) => Err(FactoryError::InvalidParameter {
            node: id.0.clone(),
            reason,
        }),
        None => Ok(()),
    }
}
