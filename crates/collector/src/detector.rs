use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use perfwatch_core::config::DetectorConfig;
use perfwatch_core::model::{
    IssueKind, PerformanceIssue, Severity, Span, SpanKind, Status, Trace,
};

/// Evaluates completed traces against the slow-span, slow-trace,
/// repeated-operation and error heuristics. Findings are returned to the
/// caller and never stored here.
#[derive(Debug)]
pub struct Detector {
    cfg: DetectorConfig,
    outcomes: Mutex<OutcomeWindow>,
}

#[derive(Debug, Default)]
struct OutcomeWindow {
    recent: VecDeque<bool>,
    errors: usize,
    elevated: bool,
}

impl Detector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self {
            cfg,
            outcomes: Mutex::new(OutcomeWindow::default()),
        }
    }

    pub fn evaluate(&self, trace: &Trace) -> Vec<PerformanceIssue> {
        let mut issues = Vec::new();
        let trace_failed = trace.status == Status::Error;

        if trace_failed {
            issues.push(PerformanceIssue {
                severity: Severity::High,
                kind: IssueKind::TraceError,
                message: format!("trace '{}' failed", trace.name),
                suggestion: failing_span_hint(trace),
                trace_id: trace.id.clone(),
                span_id: None,
            });
        }

        if let Some(duration) = trace.duration()
            && duration > self.cfg.slow_trace
        {
            let severity = if duration > self.cfg.slow_trace * 2 {
                Severity::Critical
            } else {
                Severity::High
            };
            issues.push(PerformanceIssue {
                severity,
                kind: IssueKind::SlowTrace,
                message: format!(
                    "trace '{}' took {:.1}ms (threshold {}ms)",
                    trace.name,
                    as_ms(duration),
                    self.cfg.slow_trace.as_millis()
                ),
                suggestion: slowest_span_hint(trace),
                trace_id: trace.id.clone(),
                span_id: None,
            });
        }

        for span in &trace.spans {
            if span.status == Status::Error {
                issues.push(span_error_issue(span, trace_failed));
            }
            if let Some(issue) = self.slow_span_issue(span) {
                issues.push(issue);
            }
        }

        issues.extend(self.repeated_operations(trace));

        if let Some(issue) = self.record_outcome(trace) {
            issues.push(issue);
        }
        issues
    }

    fn slow_span_issue(&self, span: &Span) -> Option<PerformanceIssue> {
        let duration = span.duration()?;
        if duration <= self.cfg.slow_span {
            return None;
        }
        let severity = if duration > self.cfg.slow_span * 2 {
            Severity::High
        } else {
            Severity::Medium
        };
        Some(PerformanceIssue {
            severity,
            kind: IssueKind::SlowSpan,
            message: format!(
                "slow {} span '{}' took {:.1}ms (threshold {}ms)",
                span.kind.as_str(),
                span.name,
                as_ms(duration),
                self.cfg.slow_span.as_millis()
            ),
            suggestion: Some(slow_span_suggestion(span.kind).to_string()),
            trace_id: span.trace_id.clone(),
            span_id: Some(span.id.clone()),
        })
    }

    fn repeated_operations(&self, trace: &Trace) -> Vec<PerformanceIssue> {
        let mut order: Vec<(&str, SpanKind)> = Vec::new();
        let mut groups: HashMap<(&str, SpanKind), (usize, &Span)> = HashMap::new();
        for span in trace.completed_spans() {
            let key = (span.name.as_str(), span.kind);
            groups
                .entry(key)
                .and_modify(|(count, _)| *count += 1)
                .or_insert_with(|| {
                    order.push(key);
                    (1, span)
                });
        }

        let threshold = self.cfg.repeat_threshold;
        order
            .into_iter()
            .filter_map(|key| {
                let (count, first) = groups.get(&key)?;
                (*count > threshold).then(|| PerformanceIssue {
                    severity: if *count > threshold * 2 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    kind: IssueKind::RepeatedOperation {
                        operation: key.0.to_string(),
                        span_kind: key.1,
                        count: *count,
                    },
                    message: format!(
                        "{} '{}' ran {} times in one trace (threshold {})",
                        key.1.as_str(),
                        key.0,
                        count,
                        threshold
                    ),
                    suggestion: Some(format!(
                        "batch the {count} '{}' calls into one request (e.g. a single IN query or a data loader)",
                        key.0
                    )),
                    trace_id: trace.id.clone(),
                    span_id: Some(first.id.clone()),
                })
            })
            .collect()
    }

    /// Emits once when the rolling error rate crosses the threshold; re-arms
    /// after it falls back below.
    fn record_outcome(&self, trace: &Trace) -> Option<PerformanceIssue> {
        let failed = trace.status == Status::Error;
        let mut window = self.outcomes.lock();
        window.recent.push_back(failed);
        if failed {
            window.errors += 1;
        }
        while window.recent.len() > self.cfg.error_rate_window {
            if window.recent.pop_front() == Some(true) {
                window.errors -= 1;
            }
        }

        if window.recent.len() < self.cfg.error_rate_min_samples {
            return None;
        }
        let rate = window.errors as f64 / window.recent.len() as f64;
        if rate < self.cfg.error_rate_threshold {
            window.elevated = false;
            return None;
        }
        if window.elevated {
            return None;
        }
        window.elevated = true;

        Some(PerformanceIssue {
            severity: Severity::High,
            kind: IssueKind::ErrorRateSpike {
                rate,
                window: window.recent.len(),
            },
            message: format!(
                "error rate {:.0}% over the last {} traces",
                rate * 100.0,
                window.recent.len()
            ),
            suggestion: Some("check recent deploys and downstream dependencies".to_string()),
            trace_id: trace.id.clone(),
            span_id: None,
        })
    }
}

fn span_error_issue(span: &Span, trace_failed: bool) -> PerformanceIssue {
    let detail = span
        .error
        .as_ref()
        .map(|e| format!(": {}", e.message))
        .unwrap_or_default();
    let (severity, suggestion) = if trace_failed {
        (
            Severity::High,
            "this failure propagated to the caller; add handling or a fallback",
        )
    } else {
        (
            Severity::Low,
            "the trace recovered; confirm the retry or fallback path is intended",
        )
    };
    PerformanceIssue {
        severity,
        kind: IssueKind::SpanError,
        message: format!("{} span '{}' failed{detail}", span.kind.as_str(), span.name),
        suggestion: Some(suggestion.to_string()),
        trace_id: span.trace_id.clone(),
        span_id: Some(span.id.clone()),
    }
}

fn slow_span_suggestion(kind: SpanKind) -> &'static str {
    match kind {
        SpanKind::Database => "review the query plan, add an index, or cache the result",
        SpanKind::Http => "add a timeout, cache the response, or move the call off the request path",
        SpanKind::Cache => "check cache backend latency and connection pooling",
        SpanKind::Function => "profile this function for hot loops or blocking work",
        SpanKind::Custom => "investigate what this operation waits on",
    }
}

fn failing_span_hint(trace: &Trace) -> Option<String> {
    let span = trace.spans.iter().find(|s| s.status == Status::Error)?;
    Some(format!("first failing span: '{}'", span.name))
}

fn slowest_span_hint(trace: &Trace) -> Option<String> {
    let span = trace
        .completed_spans()
        .filter(|s| s.parent_span_id.is_some())
        .max_by_key(|s| s.duration())?;
    Some(format!(
        "slowest nested span is '{}' ({:.1}ms)",
        span.name,
        span.duration().map(as_ms).unwrap_or_default()
    ))
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use perfwatch_core::ids::TraceId;
    use perfwatch_core::model::SpanError;
    use testkit::{fixed_trace_id, span, trace};

    use super::*;

    fn detector() -> Detector {
        Detector::new(DetectorConfig::default())
    }

    fn count_kind(issues: &[PerformanceIssue], pred: impl Fn(&IssueKind) -> bool) -> usize {
        issues.iter().filter(|i| pred(&i.kind)).count()
    }

    #[test]
    fn n_plus_one_reports_once_with_count() {
        let issues = detector().evaluate(&testkit::n_plus_one_trace(8));
        let repeated = issues
            .iter()
            .filter_map(|i| match &i.kind {
                IssueKind::RepeatedOperation {
                    operation, count, ..
                } => Some((operation.as_str(), *count)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(repeated, vec![("db.query:getUser", 8)]);
    }

    #[test]
    fn repeats_at_threshold_are_tolerated() {
        let issues = detector().evaluate(&testkit::n_plus_one_trace(5));
        assert_eq!(
            count_kind(&issues, |k| matches!(k, IssueKind::RepeatedOperation { .. })),
            0
        );
    }

    #[test]
    fn slow_span_severity_scales_with_magnitude() {
        let t = fixed_trace_id();
        let spans = vec![
            span(&t, "r", None, "handler", SpanKind::Http, 0, 1500),
            span(&t, "a", Some("r"), "SELECT orders", SpanKind::Database, 0, 600),
            span(&t, "b", Some("r"), "render", SpanKind::Function, 600, 1100),
            span(&t, "c", Some("r"), "cache.get", SpanKind::Cache, 1700, 20),
        ];
        let issues = detector().evaluate(&trace("GET /orders", 1800, Status::Success, spans));

        let slow = issues
            .iter()
            .filter(|i| i.kind == IssueKind::SlowSpan)
            .map(|i| (i.message.contains("SELECT orders"), i.severity))
            .collect::<Vec<_>>();
        // handler (1500ms) and render (1100ms) are > 2x, SELECT is 1.2x
        assert_eq!(slow.len(), 3);
        assert!(slow.contains(&(true, Severity::Medium)));
        assert_eq!(
            slow.iter().filter(|(_, s)| *s == Severity::High).count(),
            2
        );
        assert_eq!(count_kind(&issues, |k| *k == IssueKind::SlowTrace), 0);
    }

    #[test]
    fn slow_trace_escalates_to_critical() {
        let t = fixed_trace_id();
        let spans = vec![span(&t, "r", None, "batch", SpanKind::Function, 0, 100)];
        let issues = detector().evaluate(&trace("POST /import", 4500, Status::Success, spans));
        let slow = issues
            .iter()
            .find(|i| i.kind == IssueKind::SlowTrace)
            .unwrap();
        assert_eq!(slow.severity, Severity::Critical);
        assert!(slow.span_id.is_none());
    }

    #[test]
    fn span_error_severity_depends_on_trace_outcome() {
        let t = fixed_trace_id();
        let mut failing = span(&t, "a", None, "charge card", SpanKind::Http, 0, 10);
        failing.status = Status::Error;
        failing.error = Some(SpanError::new("card declined"));

        let recovered = detector().evaluate(&trace("POST /pay", 20, Status::Success, vec![failing.clone()]));
        let issue = recovered.iter().find(|i| i.kind == IssueKind::SpanError).unwrap();
        assert_eq!(issue.severity, Severity::Low);
        assert!(issue.message.contains("card declined"));
        assert_eq!(count_kind(&recovered, |k| *k == IssueKind::TraceError), 0);

        let failed = detector().evaluate(&trace("POST /pay", 20, Status::Error, vec![failing]));
        let issue = failed.iter().find(|i| i.kind == IssueKind::SpanError).unwrap();
        assert_eq!(issue.severity, Severity::High);
        let trace_issue = failed.iter().find(|i| i.kind == IssueKind::TraceError).unwrap();
        assert_eq!(trace_issue.severity, Severity::High);
        assert_eq!(trace_issue.suggestion.as_deref(), Some("first failing span: 'charge card'"));
    }

    #[test]
    fn healthy_trace_has_no_issues() {
        let issues = detector().evaluate(&trace("GET /", 100, Status::Success, testkit::flame_spans()));
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn error_rate_spike_fires_once_per_episode() {
        let det = Detector::new(DetectorConfig {
            error_rate_window: 10,
            error_rate_min_samples: 4,
            error_rate_threshold: 0.5,
            ..DetectorConfig::default()
        });
        let run = |status: Status| {
            let mut t = trace("GET /", 1, status, Vec::new());
            t.id = TraceId::generate();
            count_kind(&det.evaluate(&t), |k| matches!(k, IssueKind::ErrorRateSpike { .. }))
        };

        assert_eq!(run(Status::Error), 0);
        assert_eq!(run(Status::Error), 0);
        assert_eq!(run(Status::Success), 0);
        assert_eq!(run(Status::Error), 1);
        assert_eq!(run(Status::Error), 0);

        for _ in 0..10 {
            run(Status::Success);
        }
        assert_eq!(run(Status::Error), 0);
        // Window back below the threshold, so the next episode fires again:
        // 2/10, 3/10, 4/10 stay quiet and 5/10 crosses.
        let second_episode = (0..5).map(|_| run(Status::Error)).collect::<Vec<_>>();
        assert_eq!(second_episode, vec![0, 0, 0, 1, 0]);
        assert_eq!(second_episode.iter().sum::<usize>(), 1);
        assert_eq!(run(Status::Error), 0);
    }
}
