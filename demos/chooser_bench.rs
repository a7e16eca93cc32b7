//! Compare round robin with fewest pending on one of the ready made scenarios.
//!
//! Run: `cargo run --release --example chooser_bench -- --preset fewest-pending-superior`

use std::time::Duration;

use chooserbench::{presets, BenchmarkContext, Config, RunReport, StrategyRegistry};

use clap::{Parser, ValueEnum};

use tracing::Level;

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    RoundRobinWorks,
    FewestPendingSuperior,
    FewestPendingDegradation,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Preset::FewestPendingSuperior)]
    preset: Preset,
    /// Run duration in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
    /// Print debug logs
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let mut config: Config = match cli.preset {
        Preset::RoundRobinWorks => presets::round_robin_works(),
        Preset::FewestPendingSuperior => presets::fewest_pending_superior(),
        Preset::FewestPendingDegradation => presets::fewest_pending_degradation(),
    };
    config.duration = Duration::from_secs(cli.duration);

    let mut context = BenchmarkContext::build(&config, &StrategyRegistry::default())
        .expect("Failed to build benchmark");

    println!(
        "\nRunning {} clients against {} servers for {:?} (max latency {:?}) ...\n",
        context.client_count(),
        context.server_count(),
        context.duration(),
        context.max_latency()
    );

    context.run().expect("Benchmark failed");

    print_report(&config, &context.report());
}

fn print_report(config: &Config, report: &RunReport) {
    let seconds = report.duration.as_secs_f64();

    println!("=== SERVERS ===");
    for group in report.server_groups() {
        let received = report.server_group_received(group);
        println!(
            "{group:>12}: {received:>8} requests ({:.1}/s)",
            received as f64 / seconds
        );
    }

    println!("\n=== CLIENTS ===");
    for group in &config.client_groups {
        let totals = report.client_group_totals(&group.name);
        let latency = report.client_group_latency(&group.name);

        println!(
            "{:>16}: sent {:>8}, received {:>8}, failed {:>6}, p50 <= {}ms, p99 <= {}ms",
            group.name,
            totals.sent,
            totals.received,
            totals.failed,
            percentile(&latency, 0.5),
            percentile(&latency, 0.99),
        );
    }
}

/// Upper bound of the bucket holding the `p` quantile.
fn percentile(histogram: &[(u64, u64)], p: f64) -> u64 {
    let total: u64 = histogram.iter().map(|(_, count)| count).sum();
    let target = (total as f64 * p).ceil() as u64;

    let mut seen = 0;
    for (bound, count) in histogram {
        seen += count;
        if seen >= target {
            return *bound;
        }
    }

    0
}
