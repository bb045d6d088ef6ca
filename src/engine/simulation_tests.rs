// Tests for the simulation driver
// These run real (short) simulations against in-memory sinks

use crate::{
    engine::{
        events::{EventBus, SimEvent},
        factory::Factory,
        simulation::{SaturationPolicy, Simulation, SimulationPhase},
        sink::{ids, InMemorySink, SinkRegistry},
        telemetry::{sources, Recorder},
    },
    models::NodeId,
    FactoryError, NodeKind, SimulationConfig,
};

use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;

fn fast_config() -> SimulationConfig {
    SimulationConfig {
        arrival_rate: 200.0,
        transfer_delay_ms: 0,
        send_timeout_ms: 50,
        enqueue_timeout_ms: 50,
        shutdown_grace_ms: 2000,
        seed: Some(11),
        event_log_path: None,
        ..SimulationConfig::default()
    }
}

/// Standard line with every processing time replaced by `processing`
async fn standard_line(capacity: usize, processing: Duration) -> Arc<Factory> {
    let factory = Factory::standard_line(capacity).unwrap();
    let ids: Vec<NodeId> = factory.nodes().map(|n| n.id().clone()).collect();
    for id in ids {
        let settings = factory.node(&id).unwrap().settings().await;
        factory
            .set_node_data(&id, settings.children, settings.successors, processing)
            .await
            .unwrap();
    }
    Arc::new(factory)
}

/// start → worker1 → complete, where worker1 holds each part for 300ms
/// behind a one-slot queue
fn bottleneck_line(start_processing: Duration) -> Arc<Factory> {
    let mut factory = Factory::new();
    factory
        .add_node("reject", NodeKind::Reject, vec![], Duration::ZERO, 0)
        .unwrap();
    factory
        .add_node("start", NodeKind::Start, vec![], start_processing, 1)
        .unwrap();
    factory
        .add_node("complete", NodeKind::Complete, vec![], Duration::ZERO, 0)
        .unwrap();
    factory
        .add_node(
            "worker1",
            NodeKind::Worker { skill: 1.0 },
            vec![],
            Duration::from_millis(300),
            1,
        )
        .unwrap();
    factory.add_edge("start", "worker1").unwrap();
    factory.add_edge("worker1", "complete").unwrap();
    Arc::new(factory)
}

fn saturating_config(policy: SaturationPolicy) -> SimulationConfig {
    SimulationConfig {
        saturation_policy: policy,
        send_timeout_ms: 5,
        enqueue_timeout_ms: 5,
        ..fast_config()
    }
}

fn memory_recorder() -> (Arc<Recorder>, Arc<InMemorySink>) {
    let registry = Arc::new(SinkRegistry::new());
    let sink = Arc::new(InMemorySink::new());
    registry.register(ids::MEMORY, sink.clone());
    (
        Arc::new(Recorder::with_default_sources(registry, "test")),
        sink,
    )
}

#[tokio::test]
async fn test_parts_flow_to_terminal_nodes() {
    let factory = standard_line(0, Duration::from_millis(2)).await;
    let (recorder, sink) = memory_recorder();
    let simulation = Simulation::new(factory, recorder.clone(), fast_config()).unwrap();

    let report = simulation.run_for(Duration::from_millis(800)).await.unwrap();

    assert!(report.generated > 0);
    assert!(report.completed + report.rejected > 0, "{:?}", report);
    assert_eq!(report.aborted_tasks, 0);
    assert!(report.is_conserved(), "{:?}", report);
    assert_eq!(simulation.phase(), SimulationPhase::Stopped);

    // every completed part went start, station1, cutting, station2, sensor, complete
    let completed = &recorder.source(sources::COMPLETE).unwrap().table;
    for row in sink.rows(completed).await {
        assert_eq!(row["processing_time"], json!(9.0));
    }

    let processed_start = report.processed[&NodeId::start()];
    assert!(processed_start > 0);
}

#[tokio::test]
async fn test_history_grows_by_one_per_handoff() {
    let factory = standard_line(0, Duration::ZERO).await;
    let (recorder, _) = memory_recorder();
    let simulation = Simulation::new(factory, recorder, fast_config())
        .unwrap()
        .with_events(EventBus::new(1 << 16));
    let mut events = simulation.events().subscribe();

    let report = simulation.run_for(Duration::from_millis(500)).await.unwrap();
    assert!(report.generated > 0);

    // Follow part1: each transition leaves from the node the previous one entered
    let mut hops: Vec<(NodeId, NodeId)> = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SimEvent::PartTransition { part, from, to, .. }) if part == "part1" => {
                hops.push((from, to));
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(!hops.is_empty());
    assert_eq!(hops[0].0, NodeId::start());
    assert_eq!(hops[0].1, NodeId::from("station1"));
    for pair in hops.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
}

#[tokio::test]
async fn test_shutdown_with_parts_in_flight_is_bounded() {
    // cutting takes far longer than the run, so parts are held at shutdown
    let factory = standard_line(0, Duration::from_secs(10)).await;
    let (recorder, _) = memory_recorder();
    let config = SimulationConfig {
        shutdown_grace_ms: 1000,
        ..fast_config()
    };
    let simulation = Simulation::new(factory, recorder, config).unwrap();

    let started = Instant::now();
    let report = simulation.run_for(Duration::from_millis(300)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(300 + 1000 + 500), "took {:?}", elapsed);
    assert_eq!(report.aborted_tasks, 0);
    assert!(report.dropped_in_flight >= 1, "{:?}", report);
    assert!(report.is_conserved(), "{:?}", report);
}

#[tokio::test]
async fn test_saturated_queues_keep_parts_accounted() {
    let factory = standard_line(1, Duration::from_millis(50)).await;
    let (recorder, _) = memory_recorder();
    let config = SimulationConfig {
        saturation_policy: SaturationPolicy::Drop,
        send_timeout_ms: 5,
        enqueue_timeout_ms: 5,
        ..fast_config()
    };
    let simulation = Simulation::new(factory, recorder, config).unwrap();

    let report = simulation.run_for(Duration::from_millis(600)).await.unwrap();

    assert_eq!(report.rerouted, 0);
    assert!(report.is_conserved(), "{:?}", report);
}

#[tokio::test]
async fn test_full_queue_reroutes_to_reject_by_default() {
    let factory = bottleneck_line(Duration::ZERO);
    let (recorder, _) = memory_recorder();
    let config = saturating_config(SaturationPolicy::default());
    let simulation = Simulation::new(factory, recorder, config).unwrap();

    let report = simulation.run_for(Duration::from_millis(1500)).await.unwrap();

    assert!(report.rerouted > 0, "{:?}", report);
    assert!(report.rejected > 0, "{:?}", report);
    assert!(report.is_conserved(), "{:?}", report);
}

#[tokio::test]
async fn test_full_queue_drops_under_drop_policy() {
    let factory = bottleneck_line(Duration::ZERO);
    let (recorder, _) = memory_recorder();
    let simulation = Simulation::new(factory, recorder, saturating_config(SaturationPolicy::Drop)).unwrap();

    let report = simulation.run_for(Duration::from_millis(1500)).await.unwrap();

    assert_eq!(report.rerouted, 0);
    assert_eq!(report.rejected, 0);
    assert!(report.dropped_in_flight > 0, "{:?}", report);
    assert!(report.is_conserved(), "{:?}", report);
}

#[tokio::test]
async fn test_full_start_queue_drops_at_entry() {
    // start itself is the bottleneck
    let factory = bottleneck_line(Duration::from_millis(300));
    let (recorder, _) = memory_recorder();
    let simulation = Simulation::new(factory, recorder, saturating_config(SaturationPolicy::default())).unwrap();

    let report = simulation.run_for(Duration::from_millis(1500)).await.unwrap();

    assert!(report.dropped_at_entry > 0, "{:?}", report);
    assert!(report.is_conserved(), "{:?}", report);
}

#[tokio::test]
async fn test_factory_runs_only_once() {
    let factory = standard_line(0, Duration::ZERO).await;
    let (recorder, _) = memory_recorder();
    let simulation = Simulation::new(factory, recorder, fast_config()).unwrap();

    simulation.run_for(Duration::from_millis(50)).await.unwrap();
    let err = simulation
        .run_for(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::QueueUnavailable { .. }));
}

#[tokio::test]
async fn test_failed_log_reset_leaves_queues_in_place() {
    let dir = std::env::temp_dir().join(format!("factory-run-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    // a plain file where the log directory should be
    let blocker = dir.join("not-a-dir");
    tokio::fs::write(&blocker, "").await.unwrap();

    let factory = standard_line(0, Duration::ZERO).await;
    let (recorder, _) = memory_recorder();
    let config = SimulationConfig {
        event_log_path: Some(blocker.join("events.log")),
        ..fast_config()
    };
    let broken = Simulation::new(Arc::clone(&factory), recorder.clone(), config).unwrap();
    assert!(broken.run_for(Duration::from_millis(50)).await.is_err());

    let simulation = Simulation::new(factory, recorder, fast_config()).unwrap();
    let report = simulation.run_for(Duration::from_millis(200)).await.unwrap();
    assert!(report.generated > 0);

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn test_missing_start_node_is_rejected() {
    let mut factory = Factory::new();
    factory
        .add_node("reject", NodeKind::Reject, vec![], Duration::ZERO, 0)
        .unwrap();
    let (recorder, _) = memory_recorder();

    let err = Simulation::new(Arc::new(factory), recorder, fast_config())
        .err()
        .unwrap();
    assert!(matches!(err, FactoryError::MissingStartNode));
}

#[tokio::test]
async fn test_event_log_is_reset_and_written() {
    let dir = std::env::temp_dir().join(format!("factory-run-{}", uuid::Uuid::new_v4()));
    let path = dir.join("events.log");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(&path, "stale line\n").await.unwrap();

    let factory = standard_line(0, Duration::ZERO).await;
    let (recorder, _) = memory_recorder();
    let config = SimulationConfig {
        event_log_path: Some(path.clone()),
        arrival_rate: 3.0,
        ..fast_config()
    };
    let simulation = Simulation::new(factory, recorder, config).unwrap();
    let mut phases = simulation.subscribe_phase();

    simulation.run_for(Duration::from_millis(300)).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(!contents.contains("stale line"));
    assert!(contents.contains("part1;state;Processing;start"));
    assert!(contents.contains("part1;transition;start;station1"));
    assert_eq!(*phases.borrow_and_update(), SimulationPhase::Stopped);

    tokio::fs::remove_dir_all(&dir).await.ok();
}
