use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::SpanKind;

/// Count, mean and nearest-rank percentiles over a set of durations, all in
/// milliseconds. Every field is zero for an empty sample set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct DurationSummary {
    pub count: usize,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AggregateStatistics {
    pub traces: DurationSummary,
    pub spans: DurationSummary,
    pub by_span_kind: BTreeMap<SpanKind, DurationSummary>,
    pub pending_traces: usize,
    pub error_traces: usize,
}
