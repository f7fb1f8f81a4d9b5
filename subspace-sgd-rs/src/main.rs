//! CLI entry point for subspace-sgd-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subspace_sgd_rs::metrics::{JsonLinesSink, RunLog, TracingSink};
use subspace_sgd_rs::{Algorithm, ExperimentConfig, Result, Trainer};

#[derive(Parser)]
#[command(name = "subspace-sgd")]
#[command(about = "SGD in PCA subspaces of sampled training trajectories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Algorithm preset (sgd, psgd, bsgd)
        #[arg(long, default_value = "sgd")]
        preset: String,
    },
    /// Run a training experiment
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Override the algorithm (sgd, psgd, bsgd)
        #[arg(long)]
        algorithm: Option<String>,
        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the results directory
        #[arg(long)]
        results_dir: Option<PathBuf>,
        /// JSON-lines metrics file (default: `{results_dir}/{run_name}-metrics.jsonl`)
        #[arg(long)]
        metrics: Option<PathBuf>,
        /// Hide progress bars
        #[arg(long)]
        no_progress: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = ExperimentConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Algorithm: {}", config.algorithm);
            println!("  Epochs: {}", config.epochs);
            println!("  Results: {}", config.results_dir.display());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = ExperimentConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Train {
            config,
            algorithm,
            epochs,
            results_dir,
            metrics,
            no_progress,
        } => {
            tracing::info!("Starting training with config: {}", config.display());
            let mut config = ExperimentConfig::from_file(&config)?;
            if let Some(algorithm) = algorithm {
                config = config.with_algorithm(algorithm.parse::<Algorithm>()?);
            }
            if let Some(epochs) = epochs {
                config = config.with_epochs(epochs);
            }
            if let Some(dir) = results_dir {
                config = config.with_results_dir(dir);
            }
            if no_progress {
                config = config.with_progress(false);
            }
            let trainer = Trainer::new(config)?;
            let metrics = metrics.unwrap_or_else(|| {
                trainer
                    .config()
                    .results_dir
                    .join(format!("{}-metrics.jsonl", trainer.run_name()))
            });
            let log = RunLog::new()
                .without_history()
                .with_sink(TracingSink)
                .with_sink(JsonLinesSink::deferred(&metrics));

            let mut trainer = trainer.with_run_log(log);
            let summary = trainer.train()?;

            println!("✓ Run {} finished", summary.run_name);
            if let Some(eval) = summary.final_evaluation() {
                println!("  Test loss: {:.4}", eval.loss);
                println!("  Test accuracy: {:.2}%", eval.accuracy * 100.0);
            }
            if let Some(dir) = &summary.sample_dir {
                println!("  Samples: {} in {}", summary.samples_taken, dir.display());
            }
            println!("  Metrics: {}", metrics.display());
        }
    }

    Ok(())
}
