use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use perfwatch_collector::{Collector, CollectorEvent, Flamegraph, TraceContext};
use perfwatch_core::model::{AggregateStatistics, Metadata, PerformanceIssue, SpanKind, Status};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// Synthetic request mix. Every `*_every` knob selects request numbers
/// divisible by it; zero turns the behaviour off.
#[derive(Debug, Clone)]
pub struct Workload {
    pub requests: usize,
    pub concurrency: usize,
    pub n_plus_one_every: usize,
    pub users_per_request: usize,
    pub error_every: usize,
    pub slow_every: usize,
}

impl Workload {
    fn plan(&self, request: usize) -> RequestPlan {
        let hits = |every: usize| every > 0 && request % every == 0;
        RequestPlan {
            n_plus_one: hits(self.n_plus_one_every),
            users: self.users_per_request,
            fail: hits(self.error_every),
            slow: hits(self.slow_every),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestPlan {
    n_plus_one: bool,
    users: usize,
    fail: bool,
    slow: bool,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub requests: usize,
    pub sampled: usize,
    pub final_sampling_rate: f64,
    pub events: BTreeMap<&'static str, usize>,
    pub lagged_events: u64,
    pub issues: Vec<PerformanceIssue>,
    pub issue_counts: BTreeMap<&'static str, usize>,
    pub stats: AggregateStatistics,
    pub flamegraph: Option<Flamegraph>,
}

#[derive(Debug, Default)]
pub struct EventTally {
    pub events: BTreeMap<&'static str, usize>,
    pub lagged: u64,
    pub issues: Vec<PerformanceIssue>,
}

impl EventTally {
    fn record(&mut self, event: CollectorEvent) -> Option<&PerformanceIssue> {
        *self.events.entry(event.name()).or_default() += 1;
        match event {
            CollectorEvent::PerformanceIssue(issue) => {
                self.issues.push(issue);
                self.issues.last()
            }
            _ => None,
        }
    }
}

/// Collects events until told to stop, then drains whatever is still
/// queued. `on_issue` sees each issue as it arrives.
pub fn spawn_listener<F>(
    mut rx: broadcast::Receiver<CollectorEvent>,
    mut shutdown: oneshot::Receiver<()>,
    mut on_issue: F,
) -> JoinHandle<EventTally>
where
    F: FnMut(&PerformanceIssue) + Send + 'static,
{
    tokio::spawn(async move {
        let mut tally = EventTally::default();
        loop {
            tokio::select! {
                res = rx.recv() => match res {
                    Ok(event) => {
                        if let Some(issue) = tally.record(event) {
                            on_issue(issue);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event listener lagged");
                        tally.lagged += n;
                    }
                    Err(broadcast::error::RecvError::Closed) => return tally,
                },
                _ = &mut shutdown => break,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if let Some(issue) = tally.record(event) {
                        on_issue(issue);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => tally.lagged += n,
                Err(_) => break,
            }
        }
        tally
    })
}

/// Drives `workload.requests` requests through `collector` on
/// `workload.concurrency` tasks. Returns how many were sampled.
pub async fn run_workload(collector: &Collector, workload: &Workload) -> anyhow::Result<usize> {
    let next = Arc::new(AtomicUsize::new(1));
    let sampled = Arc::new(AtomicUsize::new(0));

    let workers = (0..workload.concurrency.max(1))
        .map(|_| {
            let collector = collector.clone();
            let workload = workload.clone();
            let next = next.clone();
            let sampled = sampled.clone();
            tokio::spawn(async move {
                loop {
                    let request = next.fetch_add(1, Ordering::Relaxed);
                    if request > workload.requests {
                        break;
                    }
                    if handle_request(&collector, request, workload.plan(request)).await {
                        sampled.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.await?;
    }
    Ok(sampled.load(Ordering::Relaxed))
}

async fn handle_request(collector: &Collector, request: usize, plan: RequestPlan) -> bool {
    let metadata = Metadata::from([
        ("http.method".to_string(), "GET".to_string()),
        ("http.route".to_string(), "/api/orders".to_string()),
        ("request.id".to_string(), request.to_string()),
    ]);
    let Some(trace) = collector.start_trace("GET /api/orders", metadata) else {
        // Unsampled requests still do the work.
        let _ = serve(collector, None, plan).await;
        return false;
    };

    let ctx = TraceContext::from_trace(&trace);
    let code = serve(collector, Some(&ctx), plan).await;
    collector.complete_trace(&trace.id, Status::from_http_status(code));
    true
}

async fn serve(collector: &Collector, ctx: Option<&TraceContext>, plan: RequestPlan) -> u16 {
    let Some(ctx) = ctx else {
        pause(1).await;
        return 200;
    };

    let result = collector
        .in_span_async(ctx, "handler", SpanKind::Http, |ctx| async move {
            collector
                .in_span_async(&ctx, "cache.get session", SpanKind::Cache, |_| async {
                    pause(1).await;
                    Ok::<_, String>(())
                })
                .await?;

            if plan.n_plus_one {
                for _ in 0..plan.users {
                    collector
                        .in_span_async(&ctx, "db.query:getUser", SpanKind::Database, |_| async {
                            pause(1).await;
                            Ok::<_, String>(())
                        })
                        .await?;
                }
            } else {
                collector
                    .in_span_async(&ctx, "db.query:getUsers", SpanKind::Database, |_| async {
                        pause(2).await;
                        Ok::<_, String>(())
                    })
                    .await?;
            }

            if plan.slow {
                collector
                    .in_span_async(&ctx, "render.report", SpanKind::Function, |_| async {
                        tokio::time::sleep(Duration::from_millis(650)).await;
                        Ok::<_, String>(())
                    })
                    .await?;
            }

            if plan.fail {
                collector
                    .in_span_async(&ctx, "payment.charge", SpanKind::Custom, |_| async {
                        pause(1).await;
                        Err::<(), _>("upstream timed out after 1 attempt".to_string())
                    })
                    .await?;
            }
            Ok::<_, String>(())
        })
        .await;

    match result {
        Ok(()) => 200,
        Err(_) => 502,
    }
}

async fn pause(base_ms: u64) {
    tokio::time::sleep(jitter(base_ms)).await;
}

fn jitter(base_ms: u64) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=base_ms * 500);
    Duration::from_micros(base_ms * 1000 + extra)
}
