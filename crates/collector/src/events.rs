use perfwatch_core::model::{PerformanceIssue, Span, Trace};
use serde::Serialize;
use tokio::sync::broadcast;

/// Outbound notifications. Delivered in the order completions happen at the
/// registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum CollectorEvent {
    #[serde(rename = "trace:completed")]
    TraceCompleted(Trace),
    #[serde(rename = "span:completed")]
    SpanCompleted(Span),
    #[serde(rename = "performance:issue")]
    PerformanceIssue(PerformanceIssue),
    #[serde(rename = "trace:abandoned")]
    TraceAbandoned(Trace),
}

impl CollectorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TraceCompleted(_) => "trace:completed",
            Self::SpanCompleted(_) => "span:completed",
            Self::PerformanceIssue(_) => "performance:issue",
            Self::TraceAbandoned(_) => "trace:abandoned",
        }
    }
}

/// Fan-out channel between the registry and its subscribers. Sending never
/// blocks; a subscriber that falls more than `capacity` events behind loses
/// the oldest ones and sees `RecvError::Lagged`.
#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<CollectorEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn is_observed(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    pub(crate) fn publish(&self, event: CollectorEvent) {
        let _ = self.tx.send(event);
    }
}
