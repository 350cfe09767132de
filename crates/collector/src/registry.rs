use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use perfwatch_core::ids::{SpanId, TraceId};
use perfwatch_core::model::{Metadata, Span, SpanError, SpanKind, Status, Trace};
use tracing::{debug, warn};

use crate::stats::Samples;

struct Entry {
    seq: u64,
    trace: Trace,
}

/// Authoritative store of live and completed traces. Every operation is
/// keyed by id and degrades to a logged no-op on bad input.
pub(crate) struct Registry {
    traces: HashMap<TraceId, Entry>,
    spans: HashMap<SpanId, (TraceId, usize)>,
    completed: VecDeque<TraceId>,
    max_completed: usize,
    next_seq: u64,
    generation: u64,
}

pub(crate) struct NewSpan {
    pub name: String,
    pub kind: SpanKind,
    pub parent_span_id: Option<SpanId>,
    pub metadata: Metadata,
}

impl Registry {
    pub(crate) fn new(max_completed: usize) -> Self {
        Self {
            traces: HashMap::new(),
            spans: HashMap::new(),
            completed: VecDeque::new(),
            max_completed,
            next_seq: 0,
            generation: 0,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.traces.len() - self.completed.len()
    }

    pub(crate) fn start_trace(
        &mut self,
        name: String,
        metadata: Metadata,
        now: Duration,
        wall: DateTime<Utc>,
    ) -> Trace {
        let trace = Trace {
            id: TraceId::generate(),
            name,
            status: Status::Pending,
            start: now,
            end: None,
            started_at: wall,
            spans: Vec::new(),
            metadata,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.traces.insert(
            trace.id.clone(),
            Entry {
                seq,
                trace: trace.clone(),
            },
        );
        trace
    }

    pub(crate) fn start_span(
        &mut self,
        trace_id: &TraceId,
        new: NewSpan,
        now: Duration,
        wall: DateTime<Utc>,
    ) -> Option<Span> {
        let Some(entry) = self.traces.get_mut(trace_id) else {
            debug!(trace_id = %trace_id, span = %new.name, "start_span ignored: unknown trace");
            return None;
        };
        if entry.trace.is_completed() {
            warn!(trace_id = %trace_id, span = %new.name, "start_span ignored: trace already completed");
            return None;
        }

        let parent_span_id = match new.parent_span_id {
            Some(parent) => {
                let belongs = self
                    .spans
                    .get(&parent)
                    .is_some_and(|(owner, _)| owner == trace_id);
                if belongs {
                    Some(parent)
                } else {
                    warn!(
                        trace_id = %trace_id,
                        parent_span_id = %parent,
                        span = %new.name,
                        "parent span not found in trace; recording span as a root"
                    );
                    None
                }
            }
            None => None,
        };

        let span = Span {
            id: SpanId::generate(),
            trace_id: trace_id.clone(),
            parent_span_id,
            name: new.name,
            kind: new.kind,
            metadata: new.metadata,
            status: Status::Pending,
            error: None,
            start: now,
            end: None,
            started_at: wall,
        };

        let idx = entry.trace.spans.len();
        entry.trace.spans.push(span.clone());
        self.spans.insert(span.id.clone(), (trace_id.clone(), idx));
        Some(span)
    }

    /// Returns the finished span, or `None` when the call was a no-op.
    pub(crate) fn complete_span(
        &mut self,
        span_id: &SpanId,
        status: Status,
        metadata: Option<Metadata>,
        now: Duration,
    ) -> Option<Span> {
        if !status.is_terminal() {
            warn!(span_id = %span_id, "complete_span ignored: status must be terminal");
            return None;
        }
        let span = self.open_span_mut(span_id, "complete_span")?;

        span.end = Some(now.max(span.start));
        span.status = status;
        if let Some(extra) = metadata {
            span.metadata.extend(extra);
        }
        Some(span.clone())
    }

    pub(crate) fn add_span_error(&mut self, span_id: &SpanId, error: SpanError) -> bool {
        let Some(span) = self.open_span_mut(span_id, "add_span_error") else {
            return false;
        };
        if span.error.is_some() {
            debug!(span_id = %span_id, "add_span_error ignored: span already has an error");
            return false;
        }
        span.error = Some(error);
        true
    }

    /// Finalizes the trace and applies the retention cap. Returns the
    /// completed trace, or `None` when the call was a no-op.
    pub(crate) fn complete_trace(
        &mut self,
        trace_id: &TraceId,
        status: Status,
        now: Duration,
    ) -> Option<Trace> {
        if !status.is_terminal() {
            warn!(trace_id = %trace_id, "complete_trace ignored: status must be terminal");
            return None;
        }
        let Some(entry) = self.traces.get_mut(trace_id) else {
            warn!(trace_id = %trace_id, "complete_trace ignored: unknown trace");
            return None;
        };
        if entry.trace.is_completed() {
            warn!(trace_id = %trace_id, "complete_trace ignored: trace already completed");
            return None;
        }

        entry.trace.end = Some(now.max(entry.trace.start));
        entry.trace.status = status;
        let done = entry.trace.clone();

        self.completed.push_back(trace_id.clone());
        self.generation += 1;
        self.enforce_cap();
        Some(done)
    }

    /// Marks every pending trace older than `ttl` (and its open spans) as
    /// failed and removes it.
    pub(crate) fn sweep_abandoned(&mut self, ttl: Duration, now: Duration) -> Vec<Trace> {
        let mut stale = self
            .traces
            .iter()
            .filter(|(_, e)| !e.trace.is_completed() && now.saturating_sub(e.trace.start) >= ttl)
            .map(|(id, e)| (e.seq, id.clone()))
            .collect::<Vec<_>>();
        stale.sort();

        let mut reaped = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            let Some(mut trace) = self.remove(&id) else {
                continue;
            };
            for span in trace.spans.iter_mut().filter(|s| !s.is_completed()) {
                span.end = Some(now.max(span.start));
                span.status = Status::Error;
            }
            trace.end = Some(now.max(trace.start));
            trace.status = Status::Error;
            reaped.push(trace);
        }
        reaped
    }

    pub(crate) fn get(&self, trace_id: &TraceId) -> Option<Trace> {
        self.traces.get(trace_id).map(|e| e.trace.clone())
    }

    /// Every retained trace, in start order.
    pub(crate) fn snapshot(&self) -> Vec<Trace> {
        let mut entries = self.traces.values().collect::<Vec<_>>();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.trace.clone()).collect()
    }

    pub(crate) fn samples(&self) -> Samples {
        let mut samples = Samples {
            generation: self.generation,
            ..Samples::default()
        };
        for id in &self.completed {
            let Some(entry) = self.traces.get(id) else {
                continue;
            };
            let trace = &entry.trace;
            if let Some(ms) = trace.duration_ms() {
                samples.traces.push(ms);
            }
            if trace.status == Status::Error {
                samples.error_traces += 1;
            }
            samples.spans.extend(
                trace
                    .completed_spans()
                    .filter_map(|s| s.duration_ms().map(|ms| (s.kind, ms))),
            );
        }
        samples
    }

    fn open_span_mut(&mut self, span_id: &SpanId, op: &str) -> Option<&mut Span> {
        let Some((trace_id, idx)) = self.spans.get(span_id) else {
            warn!(span_id = %span_id, "{op} ignored: unknown span");
            return None;
        };
        let entry = self.traces.get_mut(trace_id)?;
        if entry.trace.is_completed() {
            warn!(span_id = %span_id, trace_id = %trace_id, "{op} ignored: trace already completed");
            return None;
        }
        let span = entry.trace.spans.get_mut(*idx)?;
        if span.is_completed() {
            warn!(span_id = %span_id, "{op} ignored: span already completed");
            return None;
        }
        Some(span)
    }

    fn enforce_cap(&mut self) {
        while self.completed.len() > self.max_completed {
            let Some(oldest) = self.completed.pop_front() else {
                break;
            };
            if let Some(trace) = self.remove(&oldest) {
                debug!(trace_id = %trace.id, "evicted completed trace");
            }
        }
    }

    fn remove(&mut self, trace_id: &TraceId) -> Option<Trace> {
        let entry = self.traces.remove(trace_id)?;
        for span in &entry.trace.spans {
            self.spans.remove(&span.id);
        }
        Some(entry.trace)
    }
}
