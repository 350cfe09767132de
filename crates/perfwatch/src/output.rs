use owo_colors::OwoColorize;
use perfwatch_collector::{FlameNode, Flamegraph};
use perfwatch_core::config::CollectorConfig;
use perfwatch_core::model::{AggregateStatistics, DurationSummary, PerformanceIssue, Severity};

use crate::simulate::SimulationReport;

pub fn print_issue_human(issue: &PerformanceIssue) {
    let sev = match issue.severity {
        Severity::Low => "LOW".bright_black().to_string(),
        Severity::Medium => "MEDIUM".yellow().to_string(),
        Severity::High => "HIGH".red().to_string(),
        Severity::Critical => "CRITICAL".magenta().bold().to_string(),
    };
    println!(
        "{} {} trace={} | {}",
        sev,
        issue.kind.name().cyan(),
        issue.trace_id,
        issue.message
    );
    if let Some(suggestion) = &issue.suggestion {
        println!("    hint: {suggestion}");
    }
}

pub fn print_report_human(report: &SimulationReport) {
    println!(
        "requests={} sampled={} final_rate={:.3} lagged_events={}",
        report.requests, report.sampled, report.final_sampling_rate, report.lagged_events
    );
    for (name, count) in &report.events {
        println!("event {name}={count}");
    }
    for (kind, count) in &report.issue_counts {
        println!("issue {kind}={count}");
    }
    print_stats_human(&report.stats);
    if let Some(graph) = &report.flamegraph {
        print_flamegraph_human(graph);
    }
}

pub fn print_stats_human(stats: &AggregateStatistics) {
    println!(
        "pending_traces={} error_traces={}",
        stats.pending_traces, stats.error_traces
    );
    print_summary("traces", &stats.traces);
    print_summary("spans", &stats.spans);
    for (kind, summary) in &stats.by_span_kind {
        print_summary(&format!("  {}", kind.as_str()), summary);
    }
}

fn print_summary(label: &str, s: &DurationSummary) {
    println!(
        "{label} count={} avg={:.2}ms min={:.2}ms max={:.2}ms p50={:.2}ms p95={:.2}ms p99={:.2}ms",
        s.count, s.average_ms, s.min_ms, s.max_ms, s.p50_ms, s.p95_ms, s.p99_ms
    );
}

pub fn print_flamegraph_human(graph: &Flamegraph) {
    println!(
        "FLAMEGRAPH {} total={:.2}ms frames={}",
        graph.trace_id,
        graph.total,
        graph.node_count()
    );
    for node in &graph.nodes {
        print_node(node);
    }
}

fn print_node(node: &FlameNode) {
    let indent = "  ".repeat(node.depth);
    println!(
        "{}{} [{}] ({:.2}ms) {}",
        indent,
        node.name,
        node.kind.as_str(),
        node.value,
        node.status.as_str()
    );
}

pub fn print_config_human(cfg: &CollectorConfig) {
    let s = &cfg.sampling;
    let r = &cfg.retention;
    let d = &cfg.detector;
    println!("enabled={}", cfg.enabled);
    println!(
        "sampling base_rate={} min_rate={} max_rate={} adaptive={}",
        s.base_rate, s.min_rate, s.max_rate, s.adaptive
    );
    println!(
        "sampling target_tps={} memory_ceiling_bytes={} adjust_interval={:?} smoothing={}",
        s.target_traces_per_sec, s.memory_ceiling_bytes, s.adjust_interval, s.smoothing
    );
    println!(
        "retention max_completed_traces={} pending_ttl={} sweep_interval={:?}",
        r.max_completed_traces,
        r.pending_ttl
            .map(|ttl| format!("{ttl:?}"))
            .unwrap_or_else(|| "off".to_string()),
        r.sweep_interval
    );
    println!(
        "detector slow_span={:?} slow_trace={:?} repeat_threshold={}",
        d.slow_span, d.slow_trace, d.repeat_threshold
    );
    println!(
        "detector error_rate_window={} error_rate_min_samples={} error_rate_threshold={}",
        d.error_rate_window, d.error_rate_min_samples, d.error_rate_threshold
    );
    println!("events capacity={}", cfg.events.capacity);
}
