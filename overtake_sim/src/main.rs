//! Overtake Simulator CLI
//!
//! Run deterministic freeway scenarios against the platoon overtaking protocol.

use clap::Parser;
use overtake_core::OvertakingConfig;
use overtake_sim::scenarios::ScenarioId;
use overtake_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Steps between two exported frames.
const EXPORT_INTERVAL: u64 = 10;

/// Platoon overtaking simulation CLI
#[derive(Parser, Debug)]
#[command(name = "overtake-sim")]
#[command(about = "Run deterministic platoon overtaking scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (slow_truck, below_threshold, blocked_lane, radio_silence,
    /// laggy_radio, time_cap, stay_left, twin_platoons, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulated duration in seconds
    #[arg(short, long, default_value = "60")]
    duration: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Protocol configuration file (JSON)
    #[arg(long)]
    config: Option<String>,
}

fn load_config(path: &str) -> Result<OvertakingConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path, e))?;
    OvertakingConfig::from_json_str(&text).map_err(|e| format!("{}: {}", path, e))
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if !args.json {
        info!("Overtake Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let overtaking = match args.config.as_deref().map(load_config) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        None => OvertakingConfig::default(),
    };

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
                std::process::exit(1);
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

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }
        info!("Running with export to: {}", export_path);

        let runner = ScenarioRunner::new(base_seed)
            .with_duration(args.duration)
            .with_overtaking(overtaking);
        let (result, export) = runner.run_with_export(scenarios[0], EXPORT_INTERVAL);
        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
            Err(e) => error!("Failed to write export: {}", e),
        }

        if result.passed {
            info!("✓ {} (seed={}) PASSED", scenarios[0].name(), base_seed);
        } else {
            error!(
                "✗ {} FAILED: {}",
                scenarios[0].name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return;
    }

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_duration(args.duration)
            .with_overtaking(overtaking.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED [{} attempts, {} msgs]",
                        scenario.name(),
                        seed,
                        result.metrics.attempts,
                        result.metrics.messages_sent
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.total_steps,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode summary: {}", e),
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
