// Simulation driver - workers, part generator and coordinated shutdown

//! # Simulation Driver
//!
//! [`Simulation::run`] brings a [`Factory`] to life:
//!
//! ```text
//! Initializing ──► Running ──► Draining ──► Stopped
//!  reset log       generator    cancel       sinks closed
//!  prepare sinks   + workers    barrier      report returned
//!  spawn tasks                  close queues
//! ```
//!
//! - **Workers**: one task per node. A worker takes a part from its own queue,
//!   holds it for the node's processing time, appends the node to the part's
//!   history, asks the behavior for a [`Route`] and hands the part on after
//!   the transfer delay.
//! - **Generator**: creates parts at a randomised interval of
//!   `1s / (U[0,1) * rate / 2 + 0.75)` and enqueues them at `start`, giving
//!   up after the enqueue timeout.
//! - **Shutdown**: cancelling the token passed to `run` cancels every task.
//!   The driver waits for all of them (bounded by the grace period, stragglers
//!   are aborted), then closes each queue exactly once and counts the parts
//!   still inside.
//!
//! Every suspension point of a worker is raced against cancellation, and no
//! producer sends into a queue the driver has marked closed.
//!
//! ## Counting Parts
//!
//! Every generated part ends up in exactly one counter of the
//! [`SimulationReport`], so for a run without aborted tasks:
//!
//! ```text
//! generated == completed + rejected + dropped_at_entry + dropped_in_flight + drained
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Returning the Receiver
//! A worker task owns its queue's `Receiver` and hands it back when it
//! exits. The driver is then the only party that can close and drain the
//! queue, which makes "closed exactly once" a property of ownership.
//!
//! ### Reserve, Then Send
//! `Sender::reserve()` waits for capacity without taking the part. When the
//! wait is cancelled or times out the worker still owns the part and can
//! count or reroute it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::behaviors::{transition, Route, TransitionContext};
use super::events::{states, EventBus, EventLog};
use super::factory::{Factory, Node};
use super::telemetry::{Recorder, SourceReport};
use crate::models::{MachineState, NodeId, NodeKind, Part};
use crate::settings::SimulationConfig;
use crate::{FactoryError, Result};

/// What to do with a part whose next queue stays full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Discard the part and log it
    Drop,
    /// Try the fallback (reject) node before discarding
    #[default]
    RerouteToFallback,
}

/// Lifecycle of a simulation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationPhase {
    Initializing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    generated: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    dropped_at_entry: AtomicU64,
    dropped_in_flight: AtomicU64,
    rerouted: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub generated: u64,
    pub completed: u64,
    pub rejected: u64,
    /// Parts the start queue could not take
    pub dropped_at_entry: u64,
    /// Parts discarded between nodes (saturation or shutdown)
    pub dropped_in_flight: u64,
    /// Parts sent to the fallback because their target was full
    pub rerouted: u64,
    /// Parts left in queues at shutdown
    pub drained: u64,
    /// Tasks that missed the grace period and were aborted
    pub aborted_tasks: usize,
    /// Parts processed per node
    pub processed: BTreeMap<NodeId, u64>,
    pub sources: Vec<SourceReport>,
}

impl SimulationReport {
    /// Sum of every final part counter
    pub fn accounted(&self) -> u64 {
        self.completed + self.rejected + self.dropped_at_entry + self.dropped_in_flight + self.drained
    }

    /// Whether every generated part is accounted for
    pub fn is_conserved(&self) -> bool {
        self.generated == self.accounted()
    }
}

/// Generator gap for a uniform draw `u` in `[0, 1)`
pub fn arrival_interval(u: f64, rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / (u * rate / 2.0 + 0.75))
}

enum SendOutcome {
    Sent,
    /// The queue stayed full for the whole timeout
    Full(Part),
    /// Shutdown in progress or queue closed
    Unavailable(Part),
}

struct Shared {
    factory: Arc<Factory>,
    recorder: Arc<Recorder>,
    events: EventBus,
    config: SimulationConfig,
    counters: Counters,
}

impl Shared {
    fn rng(&self, stream: u64) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        }
    }

    async fn send(&self, target: &Node, part: Part, wait: Duration, cancel: &CancellationToken) -> SendOutcome {
        if cancel.is_cancelled() || target.is_closed() {
            return SendOutcome::Unavailable(part);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => SendOutcome::Unavailable(part),
            reserved = timeout(wait, target.sender().reserve()) => match reserved {
                Ok(Ok(permit)) => {
                    permit.send(part);
                    SendOutcome::Sent
                }
                Ok(Err(_)) => SendOutcome::Unavailable(part),
                Err(_) => SendOutcome::Full(part),
            },
        }
    }
}

/// Drives one run of a factory
pub struct Simulation {
    run_id: Uuid,
    factory: Arc<Factory>,
    recorder: Arc<Recorder>,
    events: EventBus,
    config: SimulationConfig,
    phase: watch::Sender<SimulationPhase>,
}

impl Simulation {
    pub fn new(factory: Arc<Factory>, recorder: Arc<Recorder>, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        if !factory.contains(&NodeId::start()) {
            return Err(FactoryError::MissingStartNode);
        }
        let (phase, _) = watch::channel(SimulationPhase::Initializing);
        Ok(Self {
            run_id: Uuid::new_v4(),
            factory,
            recorder,
            events: EventBus::default(),
            config,
            phase,
        })
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    pub fn phase(&self) -> SimulationPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SimulationPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SimulationPhase) {
        self.phase.send_replace(phase);
        info!(run_id = %self.run_id, phase = ?phase, "Simulation phase changed");
    }

    /// Run for a fixed wall-clock duration
    pub async fn run_for(&self, duration: Duration) -> Result<SimulationReport> {
        let shutdown = CancellationToken::new();
        let timer = shutdown.clone();
        let stopper = tokio::spawn(async move {
            sleep(duration).await;
            timer.cancel();
        });
        let report = self.run(shutdown).await;
        stopper.abort();
        report
    }

    /// Take every queue receiver, or none of them
    async fn take_receivers(&self) -> Result<Vec<(NodeId, mpsc::Receiver<Part>)>> {
        let mut receivers = Vec::with_capacity(self.factory.len());
        for node in self.factory.nodes() {
            match node.take_receiver().await {
                Some(rx) => receivers.push((node.id().clone(), rx)),
                None => {
                    for (id, rx) in receivers {
                        if let Some(owner) = self.factory.node(&id) {
                            owner.restore_receiver(rx).await;
                        }
                    }
                    return Err(FactoryError::QueueUnavailable {
                        node: node.id().to_string(),
                    });
                }
            }
        }
        Ok(receivers)
    }

    /// Run until `shutdown` is cancelled
    ///
    /// A factory can only be run once: its queues are consumed by the run.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<SimulationReport> {
        let started_at = Utc::now();
        self.set_phase(SimulationPhase::Initializing);

        // nothing is taken from the factory until the log is in place
        let log = match &self.config.event_log_path {
            Some(path) => Some(EventLog::reset(path).await?),
            None => None,
        };
        let receivers = self.take_receivers().await?;

        let log_cancel = CancellationToken::new();
        let log_task = log.map(|log| {
            info!(path = %log.path().display(), "Event log reset");
            tokio::spawn(log.run(self.events.subscribe(), log_cancel.clone()))
        });

        if let Err(e) = self.recorder.prepare().await {
            warn!(error = %e, "Telemetry preparation failed, continuing without guarantees");
        }

        let shared = Arc::new(Shared {
            factory: Arc::clone(&self.factory),
            recorder: Arc::clone(&self.recorder),
            events: self.events.clone(),
            config: self.config.clone(),
            counters: Counters::default(),
        });
        let cancel = shutdown.child_token();

        let mut tasks: Vec<(String, JoinHandle<Option<mpsc::Receiver<Part>>>)> = Vec::new();
        for (stream, (id, rx)) in receivers.into_iter().enumerate() {
            let worker = run_worker(Arc::clone(&shared), id.clone(), rx, cancel.clone(), stream as u64);
            tasks.push((id.to_string(), tokio::spawn(async move { Some(worker.await) })));
        }
        let generator = run_generator(Arc::clone(&shared), cancel.clone(), self.factory.len() as u64);
        tasks.push((
            "generator".to_string(),
            tokio::spawn(async move {
                generator.await;
                None
            }),
        ));

        self.set_phase(SimulationPhase::Running);
        info!(
            run_id = %self.run_id,
            nodes = self.factory.len(),
            rate = self.config.arrival_rate,
            "Simulation running"
        );

        cancel.cancelled().await;
        self.set_phase(SimulationPhase::Draining);

        let deadline = Instant::now() + self.config.shutdown_grace();
        let finished = join_all(tasks.into_iter().map(|(name, mut handle)| async move {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(rx)) => (name, rx, false),
                Ok(Err(e)) => {
                    error!(task = %name, error = %e, "Simulation task failed");
                    (name, None, false)
                }
                Err(_) => {
                    handle.abort();
                    warn!(task = %name, "Task missed the shutdown grace period, aborted");
                    (name, None, true)
                }
            }
        }))
        .await;

        let aborted_tasks = finished.iter().filter(|(_, _, aborted)| *aborted).count();

        for node in self.factory.nodes() {
            node.mark_closed();
        }
        let mut drained = 0u64;
        for (name, rx, _) in finished {
            let Some(mut rx) = rx else { continue };
            rx.close();
            let mut left = 0u64;
            while let Ok(part) = rx.try_recv() {
                debug!(node = %name, part = %part.id, "Drained part");
                left += 1;
            }
            if left > 0 {
                info!(node = %name, parts = left, "Drained queue");
            }
            drained += left;
        }

        self.recorder.close().await;

        log_cancel.cancel();
        if let Some(task) = log_task {
            if timeout(self.config.shutdown_grace(), task).await.is_err() {
                warn!("Event log writer did not finish in time");
            }
        }

        let mut processed = BTreeMap::new();
        for node in self.factory.nodes() {
            processed.insert(node.id().clone(), node.runtime_snapshot().await.uses);
        }

        let counters = &shared.counters;
        let report = SimulationReport {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            generated: counters.generated.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            dropped_at_entry: counters.dropped_at_entry.load(Ordering::Relaxed),
            dropped_in_flight: counters.dropped_in_flight.load(Ordering::Relaxed),
            rerouted: counters.rerouted.load(Ordering::Relaxed),
            drained,
            aborted_tasks,
            processed,
            sources: self.recorder.reports(),
        };

        self.set_phase(SimulationPhase::Stopped);
        info!(
            run_id = %self.run_id,
            generated = report.generated,
            completed = report.completed,
            rejected = report.rejected,
            drained = report.drained,
            "All simulation tasks have finished"
        );
        Ok(report)
    }
}

/// Cancellable sleep; `false` when cancelled
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    id: NodeId,
    mut rx: mpsc::Receiver<Part>,
    cancel: CancellationToken,
    stream: u64,
) -> mpsc::Receiver<Part> {
    let Some(node) = shared.factory.node(&id) else {
        return rx;
    };
    let mut rng = shared.rng(stream);
    let counters = &shared.counters;
    debug!(node = %id, "Worker started");

    loop {
        let mut part = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(part) => part,
                None => break,
            },
        };

        node.set_state(MachineState::Processing);
        shared.events.part_state(&part.id, states::PROCESSING, &id);

        let settings = node.settings().await;
        if !pause(settings.processing_time, &cancel).await {
            debug!(node = %id, part = %part.id, "Cancelled while processing");
            Counters::bump(&counters.dropped_in_flight);
            break;
        }

        part.visit(&id);
        node.set_state(MachineState::Processed);
        shared.events.part_state(&part.id, states::PROCESSED, &id);

        let mut runtime = node.runtime_snapshot().await;
        runtime.uses += 1;
        let route = {
            let mut ctx = TransitionContext {
                factory: &shared.factory,
                node,
                settings: &settings,
                runtime: &mut runtime,
                recorder: &shared.recorder,
                events: &shared.events,
                rng: &mut rng,
            };
            transition(&mut ctx, &mut part).await
        };
        *node.runtime().lock().await = runtime;

        let next = match route {
            Route::Terminate => {
                match settings.kind {
                    NodeKind::Complete => Counters::bump(&counters.completed),
                    _ => Counters::bump(&counters.rejected),
                }
                debug!(node = %id, part = %part.id, history = part.history_len(), "Part left the factory");
                settle(node, &shared.events);
                continue;
            }
            Route::Forward(next) => next,
        };

        shared.events.part_transition(&part.id, &id, &next);
        if !pause(shared.config.transfer_delay(), &cancel).await {
            Counters::bump(&counters.dropped_in_flight);
            break;
        }

        if !hand_off(&shared, node, part, &next, &cancel).await {
            break;
        }

        settle(node, &shared.events);
        let depth = node.queue_depth();
        if depth > 0 {
            shared.events.node_queue(&id, depth);
        }
    }

    debug!(node = %id, "Worker stopped");
    rx
}

/// Back to idle after a part, unless the machine broke
fn settle(node: &Node, events: &EventBus) {
    if node.state() != MachineState::Faulty {
        node.set_state(MachineState::Idle);
        events.part_state("", states::IDLE, node.id());
    }
}

/// Deliver `part` to `next`; `false` when the worker should stop
async fn hand_off(shared: &Shared, node: &Node, part: Part, next: &NodeId, cancel: &CancellationToken) -> bool {
    let counters = &shared.counters;
    let wait = shared.config.send_timeout();

    let Some(target) = shared.factory.node(next) else {
        warn!(node = %node.id(), next = %next, part = %part.id, "Route to unknown node, part dropped");
        Counters::bump(&counters.dropped_in_flight);
        return true;
    };

    let part = match shared.send(target, part, wait, cancel).await {
        SendOutcome::Sent => return true,
        SendOutcome::Unavailable(part) => {
            debug!(node = %node.id(), part = %part.id, "Shutdown during hand-off, part dropped");
            Counters::bump(&counters.dropped_in_flight);
            return false;
        }
        SendOutcome::Full(part) => part,
    };

    let fallback = node.fallback().and_then(|id| shared.factory.node(id));
    match (shared.config.saturation_policy, fallback) {
        (SaturationPolicy::RerouteToFallback, Some(fallback)) if fallback.id() != next => {
            warn!(node = %node.id(), next = %next, part = %part.id, "Next node queue full, rerouting to fallback");
            Counters::bump(&counters.rerouted);
            shared.events.part_transition(&part.id, node.id(), fallback.id());
            match shared.send(fallback, part, wait, cancel).await {
                SendOutcome::Sent => true,
                SendOutcome::Full(part) => {
                    warn!(node = %node.id(), part = %part.id, "Fallback queue full too, dropping part");
                    Counters::bump(&counters.dropped_in_flight);
                    true
                }
                SendOutcome::Unavailable(_) => {
                    Counters::bump(&counters.dropped_in_flight);
                    false
                }
            }
        }
        _ => {
            warn!(node = %node.id(), next = %next, part = %part.id, "Next node queue full, dropping part");
            Counters::bump(&counters.dropped_in_flight);
            true
        }
    }
}

async fn run_generator(shared: Arc<Shared>, cancel: CancellationToken, stream: u64) {
    let Some(start) = shared.factory.node(&NodeId::start()) else {
        error!("No start node, generator not running");
        return;
    };
    let mut rng = shared.rng(stream);
    let counters = &shared.counters;
    let materials = &shared.config.materials;
    let mut serial: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        serial += 1;
        let material = materials
            .get(((serial - 1) as usize) % materials.len().max(1))
            .map(String::as_str)
            .unwrap_or("steel");
        let part = Part::new(serial, material);
        Counters::bump(&counters.generated);

        match shared.send(start, part, shared.config.enqueue_timeout(), &cancel).await {
            SendOutcome::Sent => debug!(part = serial, "Added new part"),
            SendOutcome::Full(part) => {
                warn!(part = %part.id, "Queue full, skipping part");
                Counters::bump(&counters.dropped_at_entry);
            }
            SendOutcome::Unavailable(part) => {
                debug!(part = %part.id, "Generator stopping, part not enqueued");
                Counters::bump(&counters.dropped_at_entry);
                break;
            }
        }

        let gap = arrival_interval(rng.gen::<f64>(), shared.config.arrival_rate);
        if !pause(gap, &cancel).await {
            break;
        }
    }

    info!(generated = serial, "Stopping part generation");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrival_interval_bounds() {
        // u = 0 gives the longest gap, 1/0.75 s
        assert_eq!(arrival_interval(0.0, 3.0), Duration::from_secs_f64(1.0 / 0.75));
        // rate 3, u -> 1 gives 1/2.25 s
        let shortest = arrival_interval(0.999_999, 3.0);
        assert!(shortest > Duration::from_millis(444));
        assert!(shortest < Duration::from_millis(445));
        // rate 0 is a steady 1/0.75 s
        assert_eq!(arrival_interval(0.5, 0.0), arrival_interval(0.0, 0.0));
    }

    #[test]
    fn test_report_conservation() {
        let report = SimulationReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            generated: 10,
            completed: 4,
            rejected: 3,
            dropped_at_entry: 1,
            dropped_in_flight: 1,
            rerouted: 2,
            drained: 1,
            aborted_tasks: 0,
            processed: BTreeMap::new(),
            sources: Vec::new(),
        };
        assert_eq!(report.accounted(), 10);
        assert!(report.is_conserved());
    }

    #[test]
    fn test_saturation_policy_serde() {
        assert_eq!(SaturationPolicy::default(), SaturationPolicy::RerouteToFallback);
        assert_eq!(
            serde_json::to_string(&SaturationPolicy::RerouteToFallback).unwrap(),
            "\"reroute_to_fallback\""
        );
        let drop: SaturationPolicy = serde_json::from_str("\"drop\"").unwrap();
        assert_eq!(drop, SaturationPolicy::Drop);
    }
}
