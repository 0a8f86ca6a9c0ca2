//! Command-line surface of the headless sweep runner.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use tephra_kernel::ModelConfig;

use crate::config::SweepConfig;
use crate::demo::{demo_blueprint, demo_types};
use crate::error::SweepError;
use crate::index::IndexRange;
use crate::orchestrator::{Orchestrator, SweepOutcome};

/// How sweep results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Per-run and aggregate rows as readable text.
    #[default]
    Human,
    /// The full sweep outcome as pretty-printed JSON.
    Json,
}

/// Executes the built-in demonstration model across a scenario sweep.
#[derive(Debug, Parser)]
#[command(name = "sweep", about = "Run a Tephra scenario sweep headlessly")]
pub struct SweepArgs {
    /// Number of scenarios (a single index dimension). Use a config file
    /// for multi-dimensional scenario spaces.
    #[arg(long, default_value_t = 1)]
    pub scenarios: u64,

    /// Replications per scenario.
    #[arg(long, default_value_t = 3)]
    pub replications: u64,

    /// Worker threads, each running one model instance at a time.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Base seed for the per-run random substreams.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Measured run span in ticks.
    #[arg(long, default_value_t = 10_000)]
    pub duration_ticks: u64,

    /// Warm-up span in ticks; statistics are cleared when it elapses.
    #[arg(long, default_value_t = 0)]
    pub warmup_ticks: u64,

    /// Output format.
    #[arg(long, value_enum, default_value = "human")]
    pub format: OutputFormat,

    /// TOML sweep configuration; overrides the flags above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl SweepArgs {
    fn to_config(&self) -> Result<SweepConfig, SweepError> {
        if let Some(path) = &self.config {
            return SweepConfig::load(path);
        }
        Ok(SweepConfig::default()
            .with_ranges(vec![IndexRange::new(self.scenarios)])
            .with_replications(self.replications)
            .with_threads(self.threads)
            .with_base_seed(self.seed)
            .with_output("items_emitted")
            .with_output("mean_weight")
            .with_model(
                ModelConfig::default()
                    .with_warmup_ticks(self.warmup_ticks)
                    .with_duration_ticks(self.duration_ticks),
            ))
    }
}

/// Runs the sweep and renders results. Returns the process exit code:
/// zero when every run completed cleanly, one when error runs exist.
pub fn run(args: &SweepArgs) -> Result<i32, SweepError> {
    let config = args.to_config()?;
    let orchestrator = Orchestrator::new(demo_types(), demo_blueprint(), config)?;
    let outcome = orchestrator.run()?;

    match args.format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(&outcome)
                .map_err(|e| SweepError::Report(e.to_string()))?;
            println!("{text}");
        }
        OutputFormat::Human => print_human(&outcome),
    }

    Ok(i32::from(!outcome.summary.error_runs.is_empty()))
}

fn print_human(outcome: &SweepOutcome) {
    println!("run   scenario  replication  outputs");
    for row in &outcome.rows {
        let outputs = row
            .outputs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("  ");
        let marker = if row.errored { "  [ERROR]" } else { "" };
        println!(
            "{:<5} {:<9} {:<12} {outputs}{marker}",
            row.run.run_number, row.run.scenario, row.run.replication
        );
    }

    if !outcome.aggregates.is_empty() {
        println!();
        for agg in &outcome.aggregates {
            println!(
                "scenario {}: {} = {:.4} \u{b1} {:.4}  (n={})",
                agg.scenario, agg.output, agg.mean, agg.half_width, agg.samples
            );
        }
    }

    let summary = &outcome.summary;
    println!();
    println!(
        "{} scenario(s), {}/{} run(s) completed in {:.2}s",
        summary.scenarios, summary.completed_runs, summary.total_runs, summary.wall_seconds
    );
    if !summary.error_runs.is_empty() {
        println!("error runs:");
        for run in &summary.error_runs {
            println!("  scenario {} replication {}", run.scenario, run.replication);
        }
    }
}
