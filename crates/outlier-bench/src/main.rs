//! outlier-bench - Benchmark suite for the outlier detectors
//!
//! Usage:
//!   outlier-bench scenario all              # Run every detector scenario
//!   outlier-bench scenario lof              # Run one scenario
//!   outlier-bench throughput -a dbscan      # Raw detect throughput
//!   outlier-bench list-detectors            # Show available detectors

use std::error::Error;

use clap::{Parser, Subcommand, ValueEnum};
use outlier_bench::{BenchmarkConfig, BenchmarkRunner, Dataset, measure_throughput, scenarios};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "outlier-bench")]
#[command(about = "Benchmark suite for Isolation Forest, DBSCAN and LOF detection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output file for JSON results
    #[arg(short, long, global = true)]
    output: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Seed for the synthetic data set
    #[arg(short, long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a detection scenario
    Scenario {
        #[arg(value_enum, default_value = "all")]
        name: ScenarioName,
    },

    /// Measure raw detect throughput on a trained detector
    Throughput {
        #[arg(short, long, value_enum, default_value = "iforest")]
        algorithm: Algorithm,

        /// Number of detect calls
        #[arg(short, long, default_value = "10000")]
        probes: usize,
    },

    /// List available detectors
    ListDetectors,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScenarioName {
    Iforest,
    Dbscan,
    Lof,
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum Algorithm {
    Iforest,
    Dbscan,
    Lof,
}

impl Algorithm {
    fn scenario(self) -> BenchmarkConfig {
        match self {
            Self::Iforest => scenarios::isolation_forest(),
            Self::Dbscan => scenarios::dbscan(),
            Self::Lof => scenarios::lof(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Scenario { name } => {
            let configs = match name {
                ScenarioName::Iforest => vec![scenarios::isolation_forest()],
                ScenarioName::Dbscan => vec![scenarios::dbscan()],
                ScenarioName::Lof => vec![scenarios::lof()],
                ScenarioName::All => scenarios::all(),
            };
            run_scenarios(configs, cli.seed, cli.output)
        }
        Commands::Throughput { algorithm, probes } => {
            run_throughput(algorithm, probes, cli.seed, cli.output)
        }
        Commands::ListDetectors => {
            list_detectors();
            Ok(())
        }
    }
}

fn run_scenarios(
    configs: Vec<BenchmarkConfig>,
    seed: Option<u64>,
    output: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let mut runner = BenchmarkRunner::new();
    let mut all_results = Vec::with_capacity(configs.len());

    for mut config in configs {
        if let Some(seed) = seed {
            config.dataset.seed = seed;
        }
        let results = runner.run(&config)?;
        runner.print_results(&results);
        all_results.push(results);
    }

    let json = serde_json::to_string_pretty(&all_results)?;
    if let Some(output_file) = output {
        std::fs::write(&output_file, json)?;
        info!(path = %output_file, "Results saved");
    }
    Ok(())
}

fn run_throughput(
    algorithm: Algorithm,
    probes: usize,
    seed: Option<u64>,
    output: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let mut config = algorithm.scenario();
    if let Some(seed) = seed {
        config.dataset.seed = seed;
    }

    let dataset = Dataset::generate(&config.dataset)?;
    let mut detector = config.detector.clone().build()?;
    for point in &dataset.train {
        detector.add_training_data(point)?;
    }
    detector.train()?;

    let probe_points: Vec<Vec<f64>> = dataset
        .test
        .iter()
        .map(|p| p.features.clone())
        .cycle()
        .take(probes)
        .collect();

    let throughput = measure_throughput(detector.as_mut(), &probe_points)?;
    println!(
        "{}: {} detections at {:.0} detections/s",
        detector.name(),
        probe_points.len(),
        throughput
    );

    if let Some(output_file) = output {
        let json = serde_json::json!({
            "detector": detector.name(),
            "probes": probe_points.len(),
            "throughput_dps": throughput,
        });
        std::fs::write(&output_file, serde_json::to_string_pretty(&json)?)?;
        info!(path = %output_file, "Results saved");
    }
    Ok(())
}

fn list_detectors() {
    println!("Available Detectors:");
    println!();

    let detectors = [
        (
            "IsolationForest",
            "Random partitioning trees; short isolation paths mean anomalies",
        ),
        (
            "DBSCAN",
            "Density clustering over a bounded history; noise and sparse regions are anomalies",
        ),
        (
            "LOF",
            "Local Outlier Factor; density ratio against the k nearest neighbours",
        ),
    ];

    for (i, (name, desc)) in detectors.iter().enumerate() {
        println!("{:2}. {:16} - {}", i + 1, name, desc);
    }

    println!();
    println!("Use 'outlier-bench scenario <name>' to run a benchmark.");
}
