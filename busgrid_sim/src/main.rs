//! Busgrid Simulator CLI
//!
//! Runs session and merge scenarios against the in-memory broker.

use busgrid_env::ConnectionProperties;
use busgrid_sim::scenarios::ScenarioId;
use busgrid_sim::{ScenarioResult, ScenarioRunner};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Busgrid Deterministic Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "busgrid-sim")]
#[command(about = "Run deterministic session scenarios for Busgrid", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of simulated buses
    #[arg(short, long, default_value = "50")]
    buses: usize,

    /// Scenario to run (steady, cell_handoff, malformed_traffic, connect_refused, subscribe_timeout, reconnect, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulated duration in seconds
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// Seconds between fleet snapshots
    #[arg(long, default_value = "1.0")]
    tick: f64,

    /// Seconds the broker may take to acknowledge the subscription
    #[arg(long, default_value = "10")]
    ack_timeout: f64,

    /// Replay one GTFS-realtime vehicle-positions feed file instead of running scenarios
    #[arg(long)]
    feed: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the session's view, frame by frame, to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Broker host handed to the session
    #[arg(long, env = "BUSGRID_HOST", default_value = "sim://local")]
    host: String,

    /// Message VPN name
    #[arg(long, env = "BUSGRID_VPN", default_value = "default")]
    vpn: String,

    #[arg(long, env = "BUSGRID_USERNAME", default_value = "busgrid")]
    username: String,

    #[arg(long, env = "BUSGRID_PASSWORD", default_value = "busgrid", hide_env_values = true)]
    password: String,
}

impl Args {
    fn runner(&self, seed: u64) -> ScenarioRunner {
        ScenarioRunner::new(seed, self.buses)
            .with_duration(self.duration)
            .with_tick_interval(self.tick)
            .with_subscribe_timeout(Duration::from_secs_f64(self.ack_timeout))
            .with_connection(ConnectionProperties::new(
                self.host.as_str(),
                self.vpn.as_str(),
                self.username.as_str(),
                self.password.as_str(),
            ))
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the flags
    let default_directive = if args.json {
        "warn"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("Busgrid Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    if ![args.tick, args.duration, args.ack_timeout].iter().all(|v| v.is_finite() && *v > 0.0) {
        eprintln!("Error: --tick, --duration and --ack-timeout must be positive");
        std::process::exit(2);
    }

    if let Some(path) = &args.feed {
        std::process::exit(replay_feed(&args, path));
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(2);
            }
        }
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --export mode for map replay
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(2);
        }

        info!("Running with export to: {}", export_path);
        let (result, export) = args.runner(base_seed).run_with_export(scenarios[0]);

        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
            Err(e) => error!("Failed to write export: {}", e),
        }

        report(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = args.runner(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "vehicles": r.final_vehicle_count,
                    "status": r.final_status,
                    "messages_applied": r.metrics.messages_applied,
                    "messages_dropped": r.metrics.messages_dropped,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED | {} vehicles | applied={} dropped={}",
            result.scenario.name(),
            result.seed,
            result.final_vehicle_count,
            result.metrics.messages_applied,
            result.metrics.messages_dropped
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

/// Decodes a feed file and replays it once; returns the process exit code.
fn replay_feed(args: &Args, path: &str) -> i32 {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read feed {}: {}", path, e);
            return 2;
        }
    };
    let fleet = match busgrid_core::records_from_bytes(&bytes) {
        Ok(fleet) => fleet,
        Err(e) => {
            error!("{}: {}", path, e);
            return 1;
        }
    };

    let result = args.runner(args.seed).replay_snapshot(fleet);

    if args.json {
        let summary = serde_json::json!({
            "feed": path,
            "passed": result.passed(),
            "cells": result.cells_shown,
            "vehicles": result.vehicles_shown,
            "invalid": result.publish.invalid,
            "unplaced": result.publish.unplaced,
            "outside_grid": result.publish.outside_grid,
            "failure_reason": result.failure_reason,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize summary: {}", e),
        }
    } else if result.passed() {
        info!(
            "✓ {} replayed | {} vehicles in {} cells | skipped invalid={} unplaced={}",
            path,
            result.vehicles_shown,
            result.cells_shown,
            result.publish.invalid,
            result.publish.unplaced
        );
    } else {
        error!(
            "✗ {} replay FAILED: {}",
            path,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }

    if result.passed() {
        0
    } else {
        1
    }
}
