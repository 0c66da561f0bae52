//! `objfuse` CLI: scenario runs, replay import/export, metrics output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fusion_core::{metrics::FusionMetrics, FusionConfig};
use sim::replay::{load_replay, save_replay, ReplayCycle, ReplayLog};
use sim::scenarios::{Scenario, ScenarioKind};
use sim::{FusionRun, Simulation};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "objfuse", about = "Multi-sensor object fusion CLI")]
struct Cli {
    /// Fusion configuration (JSON); any omitted field keeps its default
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a named scenario in batch mode and output metrics.
    RunScenario {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also save the full replay log
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Load and replay a previously recorded scenario log.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the default fusion configuration as JSON.
    DefaultConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::RunScenario {
            scenario,
            seed,
            output,
            save_replay: save_path,
        } => {
            run_scenario(scenario, seed, config, output.as_deref(), save_path.as_deref())?;
        }
        Commands::Replay { input, output } => {
            run_replay(&input, config, output.as_deref())?;
        }
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&FusionConfig::default())?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FusionConfig> {
    let Some(path) = path else {
        return Ok(FusionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: FusionConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    info!(path = %path.display(), "loaded fusion config");
    Ok(config)
}

/// Fuse every cycle, returning the final metrics and live-track count.
fn fuse_cycles<'a>(
    config: FusionConfig,
    cycles: impl Iterator<Item = &'a ReplayCycle>,
) -> Result<(FusionMetrics, usize)> {
    let mut run = FusionRun::new(config)?;
    for cycle in cycles {
        run.step(cycle)?;
    }
    Ok((run.metrics().clone(), run.live_tracks()))
}

fn run_scenario(
    kind: ScenarioKind,
    seed: u64,
    config: FusionConfig,
    output_path: Option<&Path>,
    replay_path: Option<&Path>,
) -> Result<()> {
    let scenario = Scenario::build(kind, seed);
    let name = scenario.name.clone();
    let (cycle_dt, duration) = (scenario.cycle_dt, scenario.duration);

    println!(
        "Running scenario '{}' (seed={}, duration={:.0}s)...",
        name, seed, duration
    );

    let start = std::time::Instant::now();
    let cycles: Vec<ReplayCycle> = Simulation::new(scenario).collect();
    let total_frames: usize = cycles.iter().map(|c| c.frames.len()).sum();
    let (metrics, live) = fuse_cycles(config.clone(), cycles.iter())?;
    let elapsed = start.elapsed();

    print_summary(&metrics, live, total_frames, elapsed.as_secs_f64());

    if let Some(rpath) = replay_path {
        let log = ReplayLog {
            scenario_name: name.clone(),
            seed,
            cycle_dt,
            duration,
            config,
            cycles,
        };
        save_replay(&log, rpath)?;
        println!("Replay saved to {}", rpath.display());
    }

    if let Some(opath) = output_path {
        let json = serde_json::json!({
            "scenario": name,
            "seed": seed,
            "elapsed_s": elapsed.as_secs_f64(),
            "total_frames": total_frames,
            "final_tracks": live,
            "class_accuracy": metrics.class_accuracy(),
            "false_positive_rate": metrics.false_positive_rate(),
            "rmse_position": metrics.rmse_position(),
            "metrics": metrics,
        });
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
        println!("Metrics saved to {}", opath.display());
    }

    Ok(())
}

fn run_replay(input: &Path, config: FusionConfig, output_path: Option<&Path>) -> Result<()> {
    let log = load_replay(input)?;
    println!(
        "Replaying '{}' ({} cycles, {} frames)...",
        log.scenario_name,
        log.cycles.len(),
        log.total_frames()
    );

    let start = std::time::Instant::now();
    let (metrics, live) = fuse_cycles(config, log.cycles.iter())?;
    let elapsed = start.elapsed();

    print_summary(&metrics, live, log.total_frames(), elapsed.as_secs_f64());

    if let Some(opath) = output_path {
        let json = serde_json::json!({
            "scenario": log.scenario_name,
            "seed": log.seed,
            "elapsed_s": elapsed.as_secs_f64(),
            "final_tracks": live,
            "class_accuracy": metrics.class_accuracy(),
            "false_positive_rate": metrics.false_positive_rate(),
            "rmse_position": metrics.rmse_position(),
            "metrics": metrics,
        });
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
    }

    Ok(())
}

fn print_summary(metrics: &FusionMetrics, live: usize, frames: usize, elapsed_s: f64) {
    println!(
        "Done: {} cycles, {} frames, {} tracks alive, elapsed={:.2}s",
        metrics.cycles, frames, live, elapsed_s
    );
    println!(
        "Tracks: {} births, {} deaths, {} revived, {} rejected detections",
        metrics.births, metrics.deaths, metrics.revivals, metrics.rejected
    );
    println!(
        "Quality: class accuracy {:.3}, false-positive rate {:.3}, position RMSE {:.2} m",
        metrics.class_accuracy(),
        metrics.false_positive_rate(),
        metrics.rmse_position()
    );
}
