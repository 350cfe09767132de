use std::collections::BTreeMap;

use parking_lot::Mutex;
use perfwatch_core::model::{AggregateStatistics, DurationSummary, SpanKind};

/// Raw durations (ms) copied out of the registry under its lock. Sorting and
/// summarising happen after the lock is released.
#[derive(Debug, Default)]
pub(crate) struct Samples {
    pub generation: u64,
    pub traces: Vec<f64>,
    pub spans: Vec<(SpanKind, f64)>,
    pub error_traces: usize,
}

/// Caches the last summary per registry generation, so polling an unchanged
/// registry does not resort every sample.
#[derive(Debug, Default)]
pub(crate) struct StatsEngine {
    cached: Mutex<Option<(u64, AggregateStatistics)>>,
}

impl StatsEngine {
    pub(crate) fn cached(&self, generation: u64) -> Option<AggregateStatistics> {
        self.cached
            .lock()
            .as_ref()
            .filter(|(cached_gen, _)| *cached_gen == generation)
            .map(|(_, stats)| stats.clone())
    }

    pub(crate) fn compute(&self, samples: Samples) -> AggregateStatistics {
        let stats = aggregate(samples.traces, samples.spans, samples.error_traces);
        *self.cached.lock() = Some((samples.generation, stats.clone()));
        stats
    }
}

fn aggregate(
    traces: Vec<f64>,
    spans: Vec<(SpanKind, f64)>,
    error_traces: usize,
) -> AggregateStatistics {
    let mut by_kind: BTreeMap<SpanKind, Vec<f64>> = BTreeMap::new();
    let mut all_spans = Vec::with_capacity(spans.len());
    for (kind, ms) in spans {
        by_kind.entry(kind).or_default().push(ms);
        all_spans.push(ms);
    }

    AggregateStatistics {
        traces: summarize(traces),
        spans: summarize(all_spans),
        by_span_kind: by_kind
            .into_iter()
            .map(|(kind, values)| (kind, summarize(values)))
            .collect(),
        pending_traces: 0,
        error_traces,
    }
}

pub fn summarize(mut values: Vec<f64>) -> DurationSummary {
    if values.is_empty() {
        return DurationSummary::default();
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let count = values.len();
    DurationSummary {
        count,
        average_ms: values.iter().sum::<f64>() / count as f64,
        min_ms: values[0],
        max_ms: values[count - 1],
        p50_ms: percentile(&values, 0.50),
        p95_ms: percentile(&values, 0.95),
        p99_ms: percentile(&values, 0.99),
    }
}

/// Nearest-rank percentile: index `ceil(p * n) - 1`, clamped to the sample
/// range. `sorted` must be ascending.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let s = summarize(vec![50.0, 10.0, 40.0, 20.0, 30.0]);
        assert_eq!(s.count, 5);
        assert_eq!(s.average_ms, 30.0);
        assert_eq!(s.p50_ms, 30.0);
        assert_eq!(s.p95_ms, 50.0);
        assert_eq!(s.p99_ms, 50.0);
        assert_eq!(s.min_ms, 10.0);
        assert_eq!(s.max_ms, 50.0);
    }

    #[test]
    fn percentile_clamps_at_both_ends() {
        let sorted = [1.0, 2.0, 3.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 3.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn empty_samples_give_zeroed_summary() {
        let s = summarize(Vec::new());
        assert_eq!(s, DurationSummary::default());
        assert!(!s.average_ms.is_nan());
    }

    #[test]
    fn groups_spans_by_kind() {
        let stats = aggregate(
            vec![100.0],
            vec![
                (SpanKind::Database, 10.0),
                (SpanKind::Database, 30.0),
                (SpanKind::Cache, 1.0),
            ],
            0,
        );
        assert_eq!(stats.spans.count, 3);
        assert_eq!(stats.by_span_kind[&SpanKind::Database].average_ms, 20.0);
        assert_eq!(stats.by_span_kind[&SpanKind::Cache].count, 1);
        assert!(!stats.by_span_kind.contains_key(&SpanKind::Http));
    }

    #[test]
    fn cache_is_keyed_by_generation() {
        let engine = StatsEngine::default();
        assert!(engine.cached(1).is_none());

        engine.compute(Samples {
            generation: 1,
            traces: vec![5.0],
            ..Samples::default()
        });
        assert_eq!(engine.cached(1).unwrap().traces.count, 1);
        assert!(engine.cached(2).is_none());
    }
}
