//! Subscription-scoped fan-out of status, progress, and metrics events.
//!
//! The bus itself is a dumb `broadcast` channel with no replay and no
//! persistence beyond the relational job rows already written by
//! [`crate::catalog::CatalogStore`]; per-subscriber `{project, topics}`
//! filtering happens at the WebSocket handler, not here.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::catalog::JobEvent;
use crate::types::{JobPhase, JobStatus};

/// A topic a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    NodeStatus,
    JobProgress,
    CollectionStats,
    Error,
}

/// A `{project, topics}` subscription filter declared at subscribe time.
/// The special project name `"all"` matches every project's events.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub project: String,
    pub topics: Vec<Topic>,
}

impl Subscription {
    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        (self.project == "all" || self.project == event.project())
            && (self.topics.is_empty() || self.topics.contains(&event.topic()))
    }
}

/// A typed message published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealtimeEvent {
    JobProgress {
        project: String,
        job_id: Uuid,
        status: JobStatus,
        phase: Option<JobPhase>,
        progress_pct: u8,
    },
    CollectionStats {
        project: String,
        collection: String,
        dense_count: usize,
        sparse_count: usize,
    },
    NodeStatus {
        project: String,
        node: String,
        healthy: bool,
    },
    Error {
        project: String,
        message: String,
    },
}

impl RealtimeEvent {
    pub fn project(&self) -> &str {
        match self {
            RealtimeEvent::JobProgress { project, .. }
            | RealtimeEvent::CollectionStats { project, .. }
            | RealtimeEvent::NodeStatus { project, .. }
            | RealtimeEvent::Error { project, .. } => project,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            RealtimeEvent::JobProgress { .. } => Topic::JobProgress,
            RealtimeEvent::CollectionStats { .. } => Topic::CollectionStats,
            RealtimeEvent::NodeStatus { .. } => Topic::NodeStatus,
            RealtimeEvent::Error { .. } => Topic::Error,
        }
    }

    fn from_job_event(project: &str, event: JobEvent) -> Self {
        RealtimeEvent::JobProgress {
            project: project.to_string(),
            job_id: event.job_id,
            status: event.status,
            phase: event.phase,
            progress_pct: event.progress_pct,
        }
    }
}

/// Best-effort broadcast fan-out, shared across every pipeline in a
/// process. Held inside `CoreServices` in the server crate.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently if nobody is listening.
    pub fn publish(&self, event: RealtimeEvent) {
        let _ = self.sender.send(event);
    }

    /// Relay a catalog job event onto the bus under `project`'s name, for
    /// as long as the bridging task below keeps running.
    pub fn publish_job_event(&self, project: &str, event: JobEvent) {
        self.publish(RealtimeEvent::from_job_event(project, event));
    }

    /// Spawn a background task that forwards every job event for `project`
    /// from the catalog's broadcast channel onto this bus, until the
    /// catalog is dropped and the channel closes.
    pub fn bridge_catalog_events(&self, project: impl Into<String>, mut job_events: broadcast::Receiver<JobEvent>) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let project = project.into();
        tokio::task::spawn(async move {
            loop {
                match job_events.recv().await {
                    Ok(event) => bus.publish_job_event(&project, event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_event(project: &str) -> RealtimeEvent {
        RealtimeEvent::JobProgress { project: project.to_string(), job_id: Uuid::new_v4(), status: JobStatus::Running, phase: Some(JobPhase::Embed), progress_pct: 42 }
    }

    #[test]
    fn test_subscription_matches_project_and_topic() {
        let sub = Subscription { project: "acme".into(), topics: vec![Topic::JobProgress] };
        assert!(sub.matches(&progress_event("acme")));
        assert!(!sub.matches(&progress_event("other")));
    }

    #[test]
    fn test_all_project_subscription_matches_everything() {
        let sub = Subscription { project: "all".into(), topics: vec![] };
        assert!(sub.matches(&progress_event("acme")));
        assert!(sub.matches(&RealtimeEvent::Error { project: "other".into(), message: "boom".into() }));
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(progress_event("acme"));
        let received = rx.recv().await.expect("recv");
        assert_eq!(received.project(), "acme");
        assert_eq!(received.topic(), Topic::JobProgress);
    }

    #[tokio::test]
    async fn test_bridge_forwards_catalog_job_events() {
        let (catalog_tx, catalog_rx) = broadcast::channel(16);
        let bus = EventBus::new(16);
        let mut bus_rx = bus.subscribe();
        let _bridge = bus.bridge_catalog_events("acme", catalog_rx);

        catalog_tx
            .send(JobEvent { job_id: Uuid::new_v4(), status: JobStatus::Completed, phase: None, progress_pct: 100 })
            .expect("send");

        let received = bus_rx.recv().await.expect("recv");
        match received {
            RealtimeEvent::JobProgress { project, progress_pct, .. } => {
                assert_eq!(project, "acme");
                assert_eq!(progress_pct, 100);
            }
            _ => panic!("expected job progress event"),
        }
    }
}
