// Node-type behaviors - the routing decision made for every part

//! # Node Behaviors
//!
//! Every node type answers one question: *given this part, where does it go
//! next?* [`transition`] dispatches on the node's [`NodeKind`] and returns a
//! [`Route`]: forward the part to another node, or terminate it here.
//!
//! ## Forwarding "normally"
//!
//! Most behaviors end by forwarding along the node's first successor. Nodes
//! inside a station usually have no edges of their own, so they inherit the
//! successors of the station that owns them. If neither exists the part goes
//! to the fallback (reject) node.
//!
//! ## Summary
//!
//! | Kind | Decision |
//! |------|----------|
//! | Start | forward |
//! | Reject / Complete | record, terminate |
//! | Station | least-loaded child, or fallback |
//! | CuttingMachine | cut in `[0, 16)`, maybe fail or add a defect, forward |
//! | Sensor | accept `[8, 12]`, retry `[4, 14]`, otherwise reject |
//! | Worker | repair one defect with probability `skill` |
//! | Inventory | book allow-listed material while there is room |
//! | RepairStation | remove up to `capacity` defects |
//! | AssemblyStation / Packaging | add weight / mark packaged |
//!
//! ## Rust Learning Notes:
//!
//! ### Closed Enum Dispatch
//! A single `match` over [`NodeKind`] replaces a trait object per type. The
//! compiler refuses to build if a new variant is not handled here.
//!
//! ### Borrowed Context
//! [`TransitionContext`] bundles shared references to the factory and
//! recorder with `&mut` access to the worker's own runtime state and random
//! stream. Nothing in it outlives a single call.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::events::{states, EventBus};
use super::factory::{Factory, Node, NodeRuntime, NodeSettings};
use super::telemetry::{sources, Recorder, TelemetryContext};
use crate::models::{MachineState, NodeId, NodeKind, Part};

/// Lower bound of an acceptable cut
pub const ACCEPT_MIN: i64 = 8;
/// Upper bound of an acceptable cut
pub const ACCEPT_MAX: i64 = 12;
/// Lower bound of a cut worth another attempt
pub const RETRY_MIN: i64 = 4;
/// Upper bound of a cut worth another attempt
pub const RETRY_MAX: i64 = 14;
/// Cut attempts after which a part is rejected outright
pub const MAX_CUT_ATTEMPTS: u32 = 2;
/// Cut values are drawn from `0..CUT_RANGE`
pub const CUT_RANGE: i64 = 16;

/// Where a part goes after a node processed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Forward(NodeId),
    /// The part leaves the factory at this node
    Terminate,
}

/// Everything a behavior may look at or touch
pub struct TransitionContext<'a> {
    pub factory: &'a Factory,
    pub node: &'a Node,
    /// Settings snapshot taken when the part was dequeued
    pub settings: &'a NodeSettings,
    pub runtime: &'a mut NodeRuntime,
    pub recorder: &'a Recorder,
    pub events: &'a EventBus,
    pub rng: &'a mut StdRng,
}

impl TransitionContext<'_> {
    fn fallback(&self) -> Route {
        match self.node.fallback() {
            Some(fallback) => Route::Forward(fallback.clone()),
            None => Route::Terminate,
        }
    }

    async fn successors(&self) -> Vec<NodeId> {
        self.factory
            .effective_successors(self.node.id(), &self.settings.successors)
            .await
    }

    async fn forward_normally(&self) -> Route {
        match self.successors().await.into_iter().next() {
            Some(next) => Route::Forward(next),
            None => self.fallback(),
        }
    }

    fn telemetry(&self) -> TelemetryContext {
        TelemetryContext::new(
            self.node.id(),
            self.settings.kind.name(),
            self.node.queue_depth(),
        )
    }

    async fn record(&self, source: &str, part: &Part) {
        self.recorder.record(source, &self.telemetry(), part).await;
    }
}

/// Decide where `part` goes next
pub async fn transition(ctx: &mut TransitionContext<'_>, part: &mut Part) -> Route {
    let settings = ctx.settings;
    match &settings.kind {
        NodeKind::Start => {
            ctx.events.part_state(&part.id, states::STARTED, ctx.node.id());
            ctx.forward_normally().await
        }
        NodeKind::Reject => {
            ctx.events.part_state(&part.id, states::REJECTED, ctx.node.id());
            ctx.record(sources::REJECT, part).await;
            Route::Terminate
        }
        NodeKind::Complete => {
            ctx.events.part_state(&part.id, states::COMPLETED, ctx.node.id());
            ctx.record(sources::COMPLETE, part).await;
            Route::Terminate
        }
        NodeKind::Station => station(ctx, part).await,
        NodeKind::CuttingMachine {
            failure_rate,
            wear_per_cut,
            base_defect_rate,
        } => cutting_machine(ctx, part, *failure_rate, *wear_per_cut, *base_defect_rate).await,
        NodeKind::Sensor { retry_station } => sensor(ctx, part, retry_station.as_ref()).await,
        NodeKind::Worker { skill } => {
            if part.attributes.defects == 0 {
                return ctx.forward_normally().await;
            }
            if chance(ctx.rng, *skill) {
                part.attributes.defects -= 1;
                ctx.forward_normally().await
            } else {
                debug!(node = %ctx.node.id(), part = %part.id, "Repair failed");
                ctx.fallback()
            }
        }
        NodeKind::Inventory {
            materials,
            capacity,
        } => {
            let allowed = materials.iter().any(|m| m == &part.attributes.material);
            if allowed && ctx.runtime.stored_count < *capacity {
                ctx.runtime.stored_count += 1;
                part.attributes.stored_in = Some(ctx.node.id().clone());
                ctx.events.part_state(&part.id, states::STORED, ctx.node.id());
                ctx.forward_normally().await
            } else {
                debug!(
                    node = %ctx.node.id(),
                    part = %part.id,
                    material = %part.attributes.material,
                    stored = ctx.runtime.stored_count,
                    "Inventory refused part"
                );
                ctx.fallback()
            }
        }
        NodeKind::RepairStation { capacity } => {
            part.attributes.defects = part.attributes.defects.saturating_sub(*capacity);
            ctx.forward_normally().await
        }
        NodeKind::AssemblyStation { added_weight } => {
            if !tools_available(ctx.node) {
                return ctx.fallback();
            }
            part.attributes.weight += added_weight;
            ctx.forward_normally().await
        }
        NodeKind::Packaging => {
            if !tools_available(ctx.node) {
                return ctx.fallback();
            }
            part.attributes.packaged = true;
            ctx.forward_normally().await
        }
    }
}

/// Bernoulli draw that treats NaN and non-positive `p` as never, `p >= 1` as always
fn chance(rng: &mut StdRng, p: f64) -> bool {
    if p.is_nan() || p <= 0.0 {
        return false;
    }
    p >= 1.0 || rng.gen_bool(p)
}

// Tooling is not modelled yet; the check keeps the fallback path in place.
fn tools_available(_node: &Node) -> bool {
    true
}

/// Load of one station child at decision time
#[derive(Debug, Clone, PartialEq)]
pub struct ChildLoad {
    pub id: NodeId,
    pub state: MachineState,
    pub queue_depth: usize,
}

/// Pick a station child, or `None` for the fallback
///
/// The first idle child wins. Otherwise the child with the strictly smallest
/// queue is chosen (earliest in list order on ties), but only if its queue is
/// strictly shorter than the fallback's.
pub fn balance(children: &[ChildLoad], fallback_depth: usize) -> Option<NodeId> {
    if let Some(idle) = children.iter().find(|c| c.state == MachineState::Idle) {
        return Some(idle.id.clone());
    }

    let mut best: Option<&ChildLoad> = None;
    for child in children {
        if best.map_or(true, |b| child.queue_depth < b.queue_depth) {
            best = Some(child);
        }
    }

    best.filter(|b| b.queue_depth < fallback_depth)
        .map(|b| b.id.clone())
}

async fn station(ctx: &mut TransitionContext<'_>, part: &Part) -> Route {
    let loads: Vec<ChildLoad> = ctx
        .settings
        .children
        .iter()
        .filter_map(|id| {
            ctx.factory.node(id).map(|child| ChildLoad {
                id: id.clone(),
                state: child.state(),
                queue_depth: child.queue_depth(),
            })
        })
        .collect();

    let fallback_depth = ctx
        .node
        .fallback()
        .and_then(|id| ctx.factory.node(id))
        .map(Node::queue_depth)
        .unwrap_or(0);

    ctx.record(sources::STATION_METRICS, part).await;

    match balance(&loads, fallback_depth) {
        Some(child) => Route::Forward(child),
        None => {
            debug!(station = %ctx.node.id(), part = %part.id, fallback_depth, "No child can take part");
            ctx.fallback()
        }
    }
}

async fn cutting_machine(
    ctx: &mut TransitionContext<'_>,
    part: &mut Part,
    failure_rate: f64,
    wear_per_cut: f64,
    base_defect_rate: f64,
) -> Route {
    part.attributes.cut_value = ctx.rng.gen_range(0..CUT_RANGE);
    part.attributes.cut_attempts += 1;
    ctx.record(sources::CUTTING, part).await;

    if chance(ctx.rng, failure_rate) {
        warn!(node = %ctx.node.id(), part = %part.id, "Cutting machine failed");
        ctx.node.set_state(MachineState::Faulty);
        return ctx.fallback();
    }

    if wear_per_cut > 0.0 {
        ctx.runtime.dullness = (ctx.runtime.dullness + wear_per_cut).min(1.0);
    }
    if chance(ctx.rng, base_defect_rate + ctx.runtime.dullness) {
        part.attributes.defects += 1;
    }

    ctx.forward_normally().await
}

async fn sensor(ctx: &mut TransitionContext<'_>, part: &mut Part, retry_station: Option<&NodeId>) -> Route {
    if part.attributes.cut_attempts >= MAX_CUT_ATTEMPTS {
        return ctx.fallback();
    }

    let value = part.attributes.cut_value;
    if (ACCEPT_MIN..=ACCEPT_MAX).contains(&value) {
        ctx.record(sources::SENSOR, part).await;
        part.attributes.sensor_readings.push(value);

        let fallback = ctx.node.fallback();
        let next = ctx
            .successors()
            .await
            .into_iter()
            .find(|s| Some(s) != fallback);
        return match next {
            Some(next) => Route::Forward(next),
            None => ctx.fallback(),
        };
    }

    if (RETRY_MIN..=RETRY_MAX).contains(&value) {
        let target = match retry_station {
            Some(explicit) => Some(explicit.clone()),
            None => match ctx.factory.parent_station(ctx.node.id()).await {
                Some(parent) => ctx.factory.upstream_station(&parent).await,
                None => None,
            },
        };
        if let Some(target) = target.filter(|t| ctx.factory.contains(t)) {
            debug!(node = %ctx.node.id(), part = %part.id, value, retry = %target, "Sending part back for another cut");
            return Route::Forward(target);
        }
    }

    ctx.fallback()
}
