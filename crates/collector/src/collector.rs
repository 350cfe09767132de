use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use perfwatch_core::clock::{Clock, SystemClock};
use perfwatch_core::config::CollectorConfig;
use perfwatch_core::ids::{SpanId, TraceId};
use perfwatch_core::model::{AggregateStatistics, Metadata, Span, SpanError, SpanKind, Status, Trace};
use perfwatch_core::{PerfwatchError, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::detector::Detector;
use crate::events::{CollectorEvent, EventBus};
use crate::flamegraph::Flamegraph;
use crate::reaper::spawn_reaper;
use crate::registry::{NewSpan, Registry};
use crate::sampling::{AdaptiveSampler, LoadCounters, LoadSnapshot, MemoryProbe, ProcessMemory, Sampler};
use crate::stats::StatsEngine;

/// Handle to one in-process collector. Cheap to clone; every clone shares
/// the same registry, sampler and event channel.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: CollectorConfig,
    clock: Arc<dyn Clock>,
    sampler: Sampler,
    load: LoadCounters,
    registry: Mutex<Registry>,
    stats: StatsEngine,
    detector: Detector,
    events: EventBus,
}

impl Collector {
    pub fn new(cfg: CollectorConfig) -> Result<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(cfg: CollectorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        cfg.validate()?;
        let inner = Inner {
            sampler: Sampler::new(cfg.enabled, cfg.sampling.base_rate),
            load: LoadCounters::default(),
            registry: Mutex::new(Registry::new(cfg.retention.max_completed_traces)),
            stats: StatsEngine::default(),
            detector: Detector::new(cfg.detector.clone()),
            events: EventBus::new(cfg.events.capacity),
            clock,
            cfg,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.cfg
    }

    /// Starts a trace, or returns `None` when the collector is disabled or
    /// the sampling roll drops it.
    pub fn start_trace(&self, name: impl Into<String>, metadata: Metadata) -> Option<Trace> {
        let name = name.into();
        if !self.inner.sampler.is_enabled() {
            return None;
        }
        self.inner.load.record_offered();
        if !self.inner.sampler.should_sample() {
            debug!(trace = %name, "trace not sampled");
            return None;
        }

        let now = self.inner.clock.now();
        let wall = self.inner.clock.wall();
        Some(self.inner.registry.lock().start_trace(name, metadata, now, wall))
    }

    pub fn start_span(
        &self,
        trace_id: &TraceId,
        name: impl Into<String>,
        kind: SpanKind,
        parent_span_id: Option<&SpanId>,
        metadata: Option<Metadata>,
    ) -> Option<Span> {
        let new = NewSpan {
            name: name.into(),
            kind,
            parent_span_id: parent_span_id.cloned(),
            metadata: metadata.unwrap_or_default(),
        };
        let now = self.inner.clock.now();
        let wall = self.inner.clock.wall();
        self.inner.registry.lock().start_span(trace_id, new, now, wall)
    }

    pub fn complete_span(
        &self,
        span_id: &SpanId,
        status: Status,
        metadata: Option<Metadata>,
    ) -> Option<Span> {
        let now = self.inner.clock.now();
        let mut registry = self.inner.registry.lock();
        let span = registry.complete_span(span_id, status, metadata, now)?;
        // Published under the lock so subscribers see completion order.
        if self.inner.events.is_observed() {
            self.inner
                .events
                .publish(CollectorEvent::SpanCompleted(span.clone()));
        }
        Some(span)
    }

    /// Records error detail on an open span. Returns whether it was stored.
    pub fn add_span_error(&self, span_id: &SpanId, error: SpanError) -> bool {
        self.inner.registry.lock().add_span_error(span_id, error)
    }

    pub fn complete_trace(&self, trace_id: &TraceId, status: Status) -> Option<Trace> {
        let now = self.inner.clock.now();
        let trace = {
            let mut registry = self.inner.registry.lock();
            let trace = registry.complete_trace(trace_id, status, now)?;
            if self.inner.events.is_observed() {
                self.inner
                    .events
                    .publish(CollectorEvent::TraceCompleted(trace.clone()));
            }
            trace
        };
        self.inner
            .load
            .record_completed(trace.status == Status::Error);

        for issue in self.inner.detector.evaluate(&trace) {
            debug!(
                trace_id = %trace.id,
                severity = issue.severity.as_str(),
                message = %issue.message,
                "performance issue"
            );
            self.inner
                .events
                .publish(CollectorEvent::PerformanceIssue(issue));
        }
        Some(trace)
    }

    /// Every retained trace, pending and completed, in start order.
    pub fn get_all_traces(&self) -> Vec<Trace> {
        self.inner.registry.lock().snapshot()
    }

    pub fn get_trace(&self, trace_id: &TraceId) -> Option<Trace> {
        self.inner.registry.lock().get(trace_id)
    }

    pub fn get_stats(&self) -> AggregateStatistics {
        let (pending, cached) = {
            let registry = self.inner.registry.lock();
            let cached = self
                .inner
                .stats
                .cached(registry.generation())
                .ok_or_else(|| registry.samples());
            (registry.pending_count(), cached)
        };
        let mut stats = cached.unwrap_or_else(|samples| self.inner.stats.compute(samples));
        stats.pending_traces = pending;
        stats
    }

    pub fn flamegraph(&self, trace_id: &TraceId) -> Option<Flamegraph> {
        let trace = self.get_trace(trace_id)?;
        Some(Flamegraph::build(&trace.id, &trace.spans))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.inner.events.subscribe()
    }

    pub fn current_sampling_rate(&self) -> f64 {
        self.inner.sampler.rate()
    }

    /// Overrides the sampling rate. The adaptive controller, if running,
    /// keeps adjusting from the new value.
    pub fn set_sampling_rate(&self, rate: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(PerfwatchError::InvalidArgument(format!(
                "sampling rate must be in [0, 1], got {rate}"
            )));
        }
        self.inner.sampler.set_rate(rate);
        info!(rate, "sampling rate set");
        Ok(())
    }

    pub(crate) fn store_sampling_rate(&self, rate: f64) {
        self.inner.sampler.set_rate(rate);
    }

    pub fn load_snapshot(&self) -> LoadSnapshot {
        self.inner.load.snapshot()
    }

    /// Fails and evicts every pending trace older than `ttl`. Returns the
    /// number reaped.
    pub fn sweep_abandoned(&self, ttl: Duration) -> usize {
        let now = self.inner.clock.now();
        let mut registry = self.inner.registry.lock();
        let reaped = registry.sweep_abandoned(ttl, now);
        let count = reaped.len();
        for trace in reaped {
            self.inner
                .events
                .publish(CollectorEvent::TraceAbandoned(trace));
        }
        drop(registry);

        if count > 0 {
            info!(count, ttl = ?ttl, "reaped abandoned traces");
        }
        count
    }

    /// Starts the configured background work on the current tokio runtime:
    /// the adaptive sampler when `sampling.adaptive` is set and the pending
    /// trace reaper when `retention.pending_ttl` is set.
    pub fn spawn_background(&self) -> BackgroundTasks {
        self.spawn_background_with_probe(ProcessMemory::new())
    }

    pub fn spawn_background_with_probe<P: MemoryProbe>(&self, probe: P) -> BackgroundTasks {
        let cfg = &self.inner.cfg;
        let mut handles = Vec::new();
        if cfg.enabled && cfg.sampling.adaptive {
            let sampler = AdaptiveSampler::new(&cfg.sampling);
            handles.push(sampler.spawn(self.clone(), probe, cfg.sampling.adjust_interval));
        }
        if let Some(ttl) = cfg.retention.pending_ttl {
            handles.push(spawn_reaper(self.clone(), ttl, cfg.retention.sweep_interval));
        }
        BackgroundTasks { handles }
    }
}

/// Background tasks owned by a collector. Dropping this stops them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use perfwatch_core::clock::ManualClock;
    use perfwatch_core::model::IssueKind;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::sampling::FixedMemory;

    fn collector() -> (Collector, Arc<ManualClock>) {
        collector_with(CollectorConfig::default())
    }

    fn collector_with(cfg: CollectorConfig) -> (Collector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let collector = Collector::with_clock(cfg, clock.clone()).unwrap();
        (collector, clock)
    }

    fn drain(rx: &mut broadcast::Receiver<CollectorEvent>) -> Vec<CollectorEvent> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Runs one trace whose single span lasts `ms`, and the trace `ms + 1`.
    fn timed_trace(collector: &Collector, clock: &ManualClock, ms: u64) -> Trace {
        let trace = collector.start_trace("GET /", Metadata::new()).unwrap();
        let span = collector
            .start_span(&trace.id, "handler", SpanKind::Http, None, None)
            .unwrap();
        clock.advance_ms(ms);
        collector.complete_span(&span.id, Status::Success, None).unwrap();
        clock.advance_ms(1);
        collector.complete_trace(&trace.id, Status::Success).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = CollectorConfig::default();
        cfg.sampling.base_rate = 1.5;
        assert!(Collector::new(cfg).is_err());
    }

    #[test]
    fn span_trace_ids_and_pending_status_are_consistent() {
        let (c, clock) = collector();
        let a = c.start_trace("a", Metadata::new()).unwrap();
        let b = c.start_trace("b", Metadata::new()).unwrap();
        let sa = c.start_span(&a.id, "work", SpanKind::Function, None, None).unwrap();
        let sb = c.start_span(&b.id, "work", SpanKind::Function, None, None).unwrap();
        clock.advance_ms(3);
        c.complete_span(&sa.id, Status::Success, None);
        c.complete_trace(&a.id, Status::Success);
        c.complete_span(&sb.id, Status::Success, None);

        for trace in c.get_all_traces() {
            assert_eq!(trace.status == Status::Pending, trace.end.is_none());
            for span in &trace.spans {
                assert_eq!(span.trace_id, trace.id);
                assert_eq!(span.status == Status::Pending, span.end.is_none());
            }
        }
        assert_eq!(c.get_stats().pending_traces, 1);
    }

    #[test]
    fn completing_a_span_twice_is_idempotent() {
        let (c, clock) = collector();
        let t = c.start_trace("t", Metadata::new()).unwrap();
        let s = c.start_span(&t.id, "q", SpanKind::Database, None, None).unwrap();
        clock.advance_ms(10);
        let first = c.complete_span(&s.id, Status::Success, None).unwrap();
        clock.advance_ms(10);
        assert!(c.complete_span(&s.id, Status::Error, None).is_none());

        let stored = c.get_trace(&t.id).unwrap();
        assert_eq!(stored.spans[0], first);
        assert_eq!(stored.spans[0].duration(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn empty_collector_reports_zeroed_stats() {
        let (c, _) = collector();
        let stats = c.get_stats();
        assert_eq!(stats, AggregateStatistics::default());
    }

    #[test]
    fn trace_percentiles_use_nearest_rank() {
        let (c, clock) = collector();
        for ms in [40, 10, 50, 20, 30] {
            let t = c.start_trace("t", Metadata::new()).unwrap();
            clock.advance_ms(ms);
            c.complete_trace(&t.id, Status::Success);
        }
        let stats = c.get_stats();
        assert_eq!(stats.traces.count, 5);
        assert_eq!(stats.traces.p50_ms, 30.0);
        assert_eq!(stats.traces.p95_ms, 50.0);
        assert_eq!(stats.traces.p99_ms, 50.0);
        assert_eq!(stats.traces.average_ms, 30.0);
    }

    #[test]
    fn stats_follow_new_completions() {
        let (c, clock) = collector();
        timed_trace(&c, &clock, 10);
        let before = c.get_stats();
        assert_eq!(before, c.get_stats());

        timed_trace(&c, &clock, 30);
        let after = c.get_stats();
        assert_eq!(after.traces.count, 2);
        assert_eq!(after.spans.count, 2);
        assert_eq!(after.by_span_kind[&SpanKind::Http].max_ms, 30.0);
    }

    #[test]
    fn fixed_rates_decide_sampling() {
        let mut cfg = CollectorConfig::default();
        cfg.sampling.min_rate = 0.0;
        cfg.sampling.base_rate = 0.0;
        let (never, _) = collector_with(cfg);
        assert!((0..500).all(|_| never.start_trace("t", Metadata::new()).is_none()));
        assert!(never.get_all_traces().is_empty());
        assert_eq!(never.load_snapshot().offered, 500);

        let (always, _) = collector();
        assert!((0..500).all(|_| always.start_trace("t", Metadata::new()).is_some()));
    }

    #[test]
    fn disabled_collector_records_nothing() {
        let cfg = CollectorConfig {
            enabled: false,
            ..CollectorConfig::default()
        };
        let (c, _) = collector_with(cfg);
        assert!(c.start_trace("t", Metadata::new()).is_none());
        assert_eq!(c.load_snapshot().offered, 0);
    }

    #[test]
    fn set_sampling_rate_validates_range() {
        let (c, _) = collector();
        assert!(matches!(c.set_sampling_rate(1.2), Err(PerfwatchError::InvalidArgument(_))));
        assert!(matches!(c.set_sampling_rate(-0.1), Err(PerfwatchError::InvalidArgument(_))));
        assert!(matches!(c.set_sampling_rate(f64::NAN), Err(PerfwatchError::InvalidArgument(_))));
        c.set_sampling_rate(0.25).unwrap();
        assert_eq!(c.current_sampling_rate(), 0.25);
    }

    #[test]
    fn retention_keeps_the_most_recently_completed() {
        let mut cfg = CollectorConfig::default();
        cfg.retention.max_completed_traces = 3;
        let (c, clock) = collector_with(cfg);

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(timed_trace(&c, &clock, 5).id);
        }
        let kept = c.get_all_traces().into_iter().map(|t| t.id).collect::<Vec<_>>();
        assert_eq!(kept, ids[2..].to_vec());
        assert_eq!(c.get_stats().traces.count, 3);
    }

    #[test]
    fn n_plus_one_emits_one_issue() {
        let (c, clock) = collector();
        let mut rx = c.subscribe();

        let t = c.start_trace("GET /api/orders", Metadata::new()).unwrap();
        let root = c.start_span(&t.id, "handler", SpanKind::Http, None, None).unwrap();
        for _ in 0..8 {
            let q = c
                .start_span(&t.id, "db.query:getUser", SpanKind::Database, Some(&root.id), None)
                .unwrap();
            clock.advance_ms(2);
            c.complete_span(&q.id, Status::Success, None);
        }
        c.complete_span(&root.id, Status::Success, None);
        c.complete_trace(&t.id, Status::Success);

        let issues = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                CollectorEvent::PerformanceIssue(issue) => Some(issue),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(issues.len(), 1);
        match &issues[0].kind {
            IssueKind::RepeatedOperation { operation, count, .. } => {
                assert_eq!(operation, "db.query:getUser");
                assert_eq!(*count, 8);
            }
            other => panic!("unexpected issue kind: {other:?}"),
        }
    }

    #[test]
    fn events_arrive_in_completion_order() {
        let (c, clock) = collector();
        let mut rx = c.subscribe();

        let t = c.start_trace("t", Metadata::new()).unwrap();
        let s = c.start_span(&t.id, "slow", SpanKind::Function, None, None).unwrap();
        clock.advance_ms(600);
        c.complete_span(&s.id, Status::Success, None);
        c.complete_trace(&t.id, Status::Success);

        let names = drain(&mut rx).iter().map(|e| e.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["span:completed", "trace:completed", "performance:issue"]);
    }

    #[test]
    fn dropped_subscriber_does_not_affect_others() {
        let (c, clock) = collector();
        let mut kept = c.subscribe();
        let dropped = c.subscribe();
        drop(dropped);
        timed_trace(&c, &clock, 1);
        assert_eq!(drain(&mut kept).len(), 2);
    }

    #[test]
    fn sweep_reaps_abandoned_traces() {
        let (c, clock) = collector();
        let mut rx = c.subscribe();
        let stale = c.start_trace("stale", Metadata::new()).unwrap();
        c.start_span(&stale.id, "hung", SpanKind::Http, None, None).unwrap();
        clock.advance_ms(5_000);
        let fresh = c.start_trace("fresh", Metadata::new()).unwrap();

        assert_eq!(c.sweep_abandoned(Duration::from_secs(2)), 1);
        assert!(c.get_trace(&stale.id).is_none());
        assert!(c.get_trace(&fresh.id).is_some());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let CollectorEvent::TraceAbandoned(trace) = &events[0] else {
            panic!("expected trace:abandoned, got {}", events[0].name());
        };
        assert_eq!(trace.status, Status::Error);
        assert!(trace.spans.iter().all(|s| s.status == Status::Error));
    }

    #[test]
    fn flamegraph_for_recorded_trace() {
        let (c, clock) = collector();
        let t = c.start_trace("t", Metadata::new()).unwrap();
        let root = c.start_span(&t.id, "root", SpanKind::Http, None, None).unwrap();
        let child = c
            .start_span(&t.id, "child", SpanKind::Cache, Some(&root.id), None)
            .unwrap();
        clock.advance_ms(20);
        c.complete_span(&child.id, Status::Success, None);
        clock.advance_ms(20);
        c.complete_span(&root.id, Status::Success, None);
        c.complete_trace(&t.id, Status::Success);

        let graph = c.flamegraph(&t.id).unwrap();
        assert_eq!(graph.roots.len(), 1);
        let root = graph.root_nodes().next().unwrap();
        assert_eq!(root.value, 40.0);
        assert_eq!(graph.children(root).next().unwrap().width, 20.0);
        assert!(c.flamegraph(&TraceId::generate()).is_none());
    }

    #[test]
    fn overlapping_traces_from_many_threads_stay_separate() {
        let (c, _) = collector();
        let workers = (0..8)
            .map(|w| {
                let c = c.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let t = c.start_trace(format!("w{w}-{i}"), Metadata::new()).unwrap();
                        let parent = c.start_span(&t.id, "outer", SpanKind::Http, None, None).unwrap();
                        let inner = c
                            .start_span(&t.id, "inner", SpanKind::Function, Some(&parent.id), None)
                            .unwrap();
                        c.complete_span(&inner.id, Status::Success, None);
                        c.complete_span(&parent.id, Status::Success, None);
                        c.complete_trace(&t.id, Status::Success);
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }

        let traces = c.get_all_traces();
        assert_eq!(traces.len(), 200);
        for trace in traces {
            assert_eq!(trace.spans.len(), 2);
            assert_eq!(trace.spans[1].parent_span_id.as_ref(), Some(&trace.spans[0].id));
            assert!(trace.spans.iter().all(|s| s.trace_id == trace.id));
        }
    }

    #[tokio::test]
    async fn background_tasks_follow_config() {
        let (plain, _) = collector();
        assert!(plain.spawn_background_with_probe(FixedMemory(None)).is_empty());

        let mut cfg = CollectorConfig::default();
        cfg.sampling.adaptive = true;
        cfg.retention.pending_ttl = Some(Duration::from_secs(60));
        let (busy, _) = collector_with(cfg);
        let tasks = busy.spawn_background_with_probe(FixedMemory(None));
        assert_eq!(tasks.len(), 2);
        tasks.shutdown();
    }
}
