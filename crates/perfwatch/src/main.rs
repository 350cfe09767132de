mod output;
mod simulate;
mod telemetry;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use perfwatch_collector::{Collector, Flamegraph, SvgOptions};
use perfwatch_core::config::CollectorConfig;
use tokio::sync::oneshot;

use crate::output::{print_config_human, print_issue_human, print_report_human};
use crate::simulate::{SimulationReport, Workload, run_workload, spawn_listener};
use crate::telemetry::init_cli_tracing;

#[derive(Parser, Debug)]
#[command(name = "perfwatch")]
#[command(about = "In-process APM collector playground")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Drive synthetic HTTP traffic through a collector")]
    Simulate {
        #[arg(long, default_value_t = 200)]
        requests: usize,
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
        #[arg(long, help = "Fixed sampling rate in [0, 1]")]
        sample_rate: Option<f64>,
        #[arg(long, help = "Enable the adaptive sampler")]
        adaptive: bool,
        #[arg(long, default_value_t = 10, help = "Every Nth request loads users one by one (0 = never)")]
        n_plus_one_every: usize,
        #[arg(long, default_value_t = 8)]
        users_per_request: usize,
        #[arg(long, default_value_t = 25, help = "Every Nth request fails upstream (0 = never)")]
        error_every: usize,
        #[arg(long, default_value_t = 0, help = "Every Nth request renders slowly (0 = never)")]
        slow_every: usize,
        #[arg(long, help = "Write the slowest trace's flamegraph as SVG")]
        svg: Option<PathBuf>,
    },
    #[command(about = "Print the effective configuration")]
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing();

    match cli.command {
        Commands::Simulate {
            requests,
            concurrency,
            sample_rate,
            adaptive,
            n_plus_one_every,
            users_per_request,
            error_every,
            slow_every,
            svg,
        } => {
            let workload = Workload {
                requests,
                concurrency,
                n_plus_one_every,
                users_per_request,
                error_every,
                slow_every,
            };
            run_simulate(workload, sample_rate, adaptive, svg, cli.json).await
        }
        Commands::Config => {
            let cfg = CollectorConfig::load().context("load configuration")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else {
                print_config_human(&cfg);
            }
            Ok(())
        }
    }
}

async fn run_simulate(
    workload: Workload,
    sample_rate: Option<f64>,
    adaptive: bool,
    svg: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let mut cfg = CollectorConfig::load().context("load configuration")?;
    cfg.sampling.adaptive |= adaptive;
    // The listener must keep up with a full burst of events.
    cfg.events.capacity = cfg.events.capacity.max(8192);

    let collector = Collector::new(cfg).context("build collector")?;
    if let Some(rate) = sample_rate {
        collector
            .set_sampling_rate(rate)
            .context("apply --sample-rate")?;
    }
    let background = collector.spawn_background();

    let (stop_tx, stop_rx) = oneshot::channel();
    let listener = spawn_listener(collector.subscribe(), stop_rx, move |issue| {
        if !json {
            print_issue_human(issue);
        }
    });

    let sampled = run_workload(&collector, &workload).await?;
    let _ = stop_tx.send(());
    let tally = listener.await.context("event listener failed")?;
    background.shutdown();

    let flamegraph = slowest_flamegraph(&collector);
    if let (Some(path), Some(graph)) = (&svg, &flamegraph) {
        let opts = SvgOptions {
            title: Some(format!("slowest trace {}", graph.trace_id)),
            ..SvgOptions::default()
        };
        std::fs::write(path, graph.render_svg(&opts))
            .with_context(|| format!("write svg to {}", path.display()))?;
    }

    let mut issue_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for issue in &tally.issues {
        *issue_counts.entry(issue.kind.name()).or_default() += 1;
    }

    let report = SimulationReport {
        requests: workload.requests,
        sampled,
        final_sampling_rate: collector.current_sampling_rate(),
        events: tally.events,
        lagged_events: tally.lagged,
        issues: tally.issues,
        issue_counts,
        stats: collector.get_stats(),
        flamegraph,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report_human(&report);
        if let Some(path) = &svg {
            println!("svg={}", path.display());
        }
    }
    Ok(())
}

fn slowest_flamegraph(collector: &Collector) -> Option<Flamegraph> {
    collector
        .get_all_traces()
        .into_iter()
        .filter(|t| t.is_completed())
        .max_by_key(|t| t.duration())
        .map(|t| Flamegraph::build(&t.id, &t.spans))
}
