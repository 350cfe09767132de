use serde::{Deserialize, Serialize};

use crate::ids::{SpanId, TraceId};
use crate::model::SpanKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssueKind {
    SlowSpan,
    SlowTrace,
    RepeatedOperation {
        operation: String,
        span_kind: SpanKind,
        count: usize,
    },
    SpanError,
    TraceError,
    ErrorRateSpike {
        rate: f64,
        window: usize,
    },
}

impl IssueKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SlowSpan => "slow_span",
            Self::SlowTrace => "slow_trace",
            Self::RepeatedOperation { .. } => "repeated_operation",
            Self::SpanError => "span_error",
            Self::TraceError => "trace_error",
            Self::ErrorRateSpike { .. } => "error_rate_spike",
        }
    }
}

/// Advisory finding produced when a trace completes. Never retained by the
/// collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
    pub suggestion: Option<String>,
    pub trace_id: TraceId,
    pub span_id: Option<SpanId>,
}
