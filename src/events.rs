use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{Detection, StreamStatus};

/// Real-time notifications pushed to dashboard subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        stream_id: String,
        status: StreamStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Detection {
        stream_id: String,
        detection: Detection,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        stream_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::Status { stream_id, .. }
            | StreamEvent::Detection { stream_id, .. }
            | StreamEvent::Heartbeat { stream_id, .. } => stream_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::Detection { .. } => "detection",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Fire-and-forget fan-out. Slow subscribers lag and lose events; publishers
/// never wait on them.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: StreamEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            trace!("No subscribers for {} event", kind);
        }
    }

    pub fn publish_status(&self, stream_id: &str, status: StreamStatus, error: Option<String>) {
        self.publish(StreamEvent::Status {
            stream_id: stream_id.to_string(),
            status,
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
