use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TraceId;
use crate::model::{Metadata, Span, Status};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub id: TraceId,
    pub name: String,
    pub status: Status,
    pub start: Duration,
    pub end: Option<Duration>,
    pub started_at: DateTime<Utc>,
    pub spans: Vec<Span>,
    pub metadata: Metadata,
}

impl Trace {
    pub fn is_completed(&self) -> bool {
        self.end.is_some()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration().map(|d| d.as_secs_f64() * 1000.0)
    }

    pub fn completed_spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(|s| s.is_completed())
    }
}
