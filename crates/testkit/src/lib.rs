use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use perfwatch_core::ids::{SpanId, TraceId};
use perfwatch_core::model::{Metadata, Span, SpanKind, Status, Trace};

pub fn fixed_trace_id() -> TraceId {
    TraceId::parse("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
}

pub fn span_id(tag: &str) -> SpanId {
    let hex = tag
        .bytes()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    SpanId::parse(&format!("{hex:0>16}")).unwrap()
}

fn wall(ms: u64) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::milliseconds(ms as i64)
}

/// Completed span starting at `start_ms` and lasting `dur_ms`.
pub fn span(
    trace_id: &TraceId,
    id: &str,
    parent: Option<&str>,
    name: &str,
    kind: SpanKind,
    start_ms: u64,
    dur_ms: u64,
) -> Span {
    Span {
        id: span_id(id),
        trace_id: trace_id.clone(),
        parent_span_id: parent.map(span_id),
        name: name.to_string(),
        kind,
        metadata: Metadata::new(),
        status: Status::Success,
        error: None,
        start: Duration::from_millis(start_ms),
        end: Some(Duration::from_millis(start_ms + dur_ms)),
        started_at: wall(start_ms),
    }
}

pub fn trace(name: &str, dur_ms: u64, status: Status, spans: Vec<Span>) -> Trace {
    let id = spans
        .first()
        .map(|s| s.trace_id.clone())
        .unwrap_or_else(fixed_trace_id);
    Trace {
        id,
        name: name.to_string(),
        status,
        start: Duration::ZERO,
        end: Some(Duration::from_millis(dur_ms)),
        started_at: wall(0),
        spans,
        metadata: Metadata::new(),
    }
}

/// A(100ms) with children B(40ms) and C(30ms).
pub fn flame_spans() -> Vec<Span> {
    let t = fixed_trace_id();
    vec![
        span(&t, "A", None, "GET /api/users", SpanKind::Http, 0, 100),
        span(&t, "B", Some("A"), "db.query:listUsers", SpanKind::Database, 5, 40),
        span(&t, "C", Some("A"), "cache.get users", SpanKind::Cache, 50, 30),
    ]
}

/// A request whose handler loads each user with its own query.
pub fn n_plus_one_trace(repeats: usize) -> Trace {
    let t = fixed_trace_id();
    let mut spans = vec![span(&t, "root", None, "handler", SpanKind::Http, 0, 10 * repeats as u64 + 5)];
    for i in 0..repeats {
        spans.push(span(
            &t,
            &format!("q{i}"),
            Some("root"),
            "db.query:getUser",
            SpanKind::Database,
            2 + 10 * i as u64,
            8,
        ));
    }
    trace("GET /api/orders", 10 * repeats as u64 + 5, Status::Success, spans)
}
