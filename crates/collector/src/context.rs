use std::fmt::Display;
use std::future::Future;

use perfwatch_core::ids::{SpanId, TraceId};
use perfwatch_core::model::{SpanError, SpanKind, Status, Trace};

use crate::Collector;

/// Handle carried by instrumented code so nested work attaches to the right
/// trace and parent span. There is no ambient "current trace": callers pass
/// this along explicitly, which keeps overlapping requests apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
}

impl TraceContext {
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            parent_span_id: None,
        }
    }

    pub fn from_trace(trace: &Trace) -> Self {
        Self::new(trace.id.clone())
    }

    pub fn child(&self, span_id: SpanId) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(span_id),
        }
    }
}

impl Collector {
    /// Runs `f` inside a new span under `ctx`. The span completes as Success
    /// or Error according to the result; on error the message is attached.
    /// When the span cannot be opened (unknown or finished trace) `f` still
    /// runs, with the caller's context.
    pub fn in_span<T, E, F>(
        &self,
        ctx: &TraceContext,
        name: impl Into<String>,
        kind: SpanKind,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&TraceContext) -> Result<T, E>,
        E: Display,
    {
        let Some(span) =
            self.start_span(&ctx.trace_id, name, kind, ctx.parent_span_id.as_ref(), None)
        else {
            return f(ctx);
        };
        let result = f(&ctx.child(span.id.clone()));
        self.finish_span(&span.id, &result);
        result
    }

    pub async fn in_span_async<T, E, F, Fut>(
        &self,
        ctx: &TraceContext,
        name: impl Into<String>,
        kind: SpanKind,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(TraceContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let Some(span) =
            self.start_span(&ctx.trace_id, name, kind, ctx.parent_span_id.as_ref(), None)
        else {
            return f(ctx.clone()).await;
        };
        let result = f(ctx.child(span.id.clone())).await;
        self.finish_span(&span.id, &result);
        result
    }

    fn finish_span<T, E: Display>(&self, span_id: &SpanId, result: &Result<T, E>) {
        let status = match result {
            Ok(_) => Status::Success,
            Err(err) => {
                self.add_span_error(span_id, SpanError::new(err.to_string()));
                Status::Error
            }
        };
        self.complete_span(span_id, status, None);
    }
}
