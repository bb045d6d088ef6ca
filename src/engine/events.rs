// Event system for simulation observers

//! # Event System
//!
//! Every part state change and hand-off is published on an [`EventBus`].
//! Dashboards subscribe to the broadcast channel; the driver can also attach
//! an [`EventLog`] that appends each event as one `;`-separated line to a file
//! that is truncated at the start of every run:
//!
//! ```text
//! part12;state;Processing;cutting2
//! part12;transition;cutting2;station2
//! station1;queue;4
//! ```
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! simply discarded, and slow subscribers lose the oldest events.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::NodeId;
use crate::Result;

/// Lifecycle labels used in part state events
pub mod states {
    pub const PROCESSING: &str = "Processing";
    pub const PROCESSED: &str = "Processed";
    pub const IDLE: &str = "Idle";
    pub const STARTED: &str = "Started";
    pub const COMPLETED: &str = "Completed";
    pub const REJECTED: &str = "Rejected";
    pub const STORED: &str = "Stored";
    pub const DROPPED: &str = "Dropped";
}

/// Something that happened during a simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimEvent {
    /// A part changed state at a node (empty `part` means the node itself)
    PartState {
        part: String,
        state: String,
        node: NodeId,
        timestamp: DateTime<Utc>,
    },
    /// A part was handed from one node to another
    PartTransition {
        part: String,
        from: NodeId,
        to: NodeId,
        timestamp: DateTime<Utc>,
    },
    /// Queue depth of a node after it finished a part
    NodeQueue {
        node: NodeId,
        depth: usize,
        timestamp: DateTime<Utc>,
    },
}

impl SimEvent {
    pub fn part_state(part: &str, state: &str, node: &NodeId) -> Self {
        SimEvent::PartState {
            part: part.to_string(),
            state: state.to_string(),
            node: node.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn part_transition(part: &str, from: &NodeId, to: &NodeId) -> Self {
        SimEvent::PartTransition {
            part: part.to_string(),
            from: from.clone(),
            to: to.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn node_queue(node: &NodeId, depth: usize) -> Self {
        SimEvent::NodeQueue {
            node: node.clone(),
            depth,
            timestamp: Utc::now(),
        }
    }

    /// The `;`-separated line written to the event log
    pub fn to_log_line(&self) -> String {
        match self {
            SimEvent::PartState { part, state, node, .. } => {
                format!("{};state;{};{}", part, state, node)
            }
            SimEvent::PartTransition { part, from, to, .. } => {
                format!("{};transition;{};{}", part, from, to)
            }
            SimEvent::NodeQueue { node, depth, .. } => format!("{};queue;{}", node, depth),
        }
    }
}

/// Broadcast bus for simulation events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SimEvent>,
}

impl EventBus {
    /// Create a new event bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: SimEvent) {
        // An error only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.sender.subscribe()
    }

    pub fn part_state(&self, part: &str, state: &str, node: &NodeId) {
        self.publish(SimEvent::part_state(part, state, node));
    }

    pub fn part_transition(&self, part: &str, from: &NodeId, to: &NodeId) {
        self.publish(SimEvent::part_transition(part, from, to));
    }

    pub fn node_queue(&self, node: &NodeId, depth: usize) {
        self.publish(SimEvent::node_queue(node, depth));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Appends bus events to a log file
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Truncate (or create) the log file and its directory
    pub async fn reset(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        tokio::fs::File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write events until `cancel` fires or the bus goes away
    ///
    /// Events already buffered when cancellation is observed are flushed
    /// before returning.
    pub async fn run(self, mut events: broadcast::Receiver<SimEvent>, cancel: CancellationToken) {
        let file = match tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot open event log");
                return;
            }
        };
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            let event = tokio::select! {
                received = events.recv() => received,
                _ = cancel.cancelled() => break,
            };
            match event {
                Ok(event) => {
                    if let Err(e) = write_line(&mut writer, &event).await {
                        warn!(error = %e, "Event log write failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event log fell behind, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        while let Ok(event) = events.try_recv() {
            if let Err(e) = write_line(&mut writer, &event).await {
                warn!(error = %e, "Event log write failed");
                break;
            }
        }

        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Event log flush failed");
        }
    }
}

async fn write_line<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    event: &SimEvent,
) -> std::io::Result<()> {
    writer.write_all(event.to_log_line().as_bytes()).await?;
    writer.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_format() {
        let node = NodeId::from("cutting1");
        assert_eq!(
            SimEvent::part_state("part3", states::PROCESSING, &node).to_log_line(),
            "part3;state;Processing;cutting1"
        );
        assert_eq!(
            SimEvent::part_transition("part3", &node, &NodeId::from("station2")).to_log_line(),
            "part3;transition;cutting1;station2"
        );
        assert_eq!(SimEvent::node_queue(&node, 4).to_log_line(), "cutting1;queue;4");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.part_state("part1", states::STARTED, &NodeId::from("start"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.part_transition("part1", &NodeId::from("start"), &NodeId::from("station1"));

        match rx.recv().await.unwrap() {
            SimEvent::PartTransition { part, from, to, .. } => {
                assert_eq!(part, "part1");
                assert_eq!(from.as_str(), "start");
                assert_eq!(to.as_str(), "station1");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_log_writes_lines() {
        let dir = std::env::temp_dir().join(format!("factory-events-{}", uuid::Uuid::new_v4()));
        let path = dir.join("events.log");
        let log = EventLog::reset(&path).await.unwrap();

        let bus = EventBus::new(16);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(log.run(bus.subscribe(), cancel.clone()));

        bus.part_state("part1", states::STARTED, &NodeId::from("start"));
        bus.node_queue(&NodeId::from("start"), 0);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        writer.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "part1;state;Started;start\nstart;queue;0\n");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
