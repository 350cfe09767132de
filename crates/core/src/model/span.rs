use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SpanId, TraceId};
use crate::model::{Metadata, Status};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Http,
    Database,
    Function,
    Cache,
    Custom,
}

impl SpanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Database => "db",
            Self::Function => "function",
            Self::Cache => "cache",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanError {
    pub message: String,
    pub stack: Option<String>,
}

impl SpanError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Captures an error's display text and, when it has sources, the cause
    /// chain as the stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub metadata: Metadata,
    pub status: Status,
    pub error: Option<SpanError>,
    pub start: Duration,
    pub end: Option<Duration>,
    pub started_at: DateTime<Utc>,
}

impl Span {
    pub fn is_completed(&self) -> bool {
        self.end.is_some()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration().map(|d| d.as_secs_f64() * 1000.0)
    }
}
