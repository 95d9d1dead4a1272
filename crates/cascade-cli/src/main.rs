//! Cascade CLI - operator interface for the cascade-impact engine

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use crate::cli::commands::*;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Infrastructure cascade-impact prediction and safety-gated retraining", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write synthetic single-failure scenarios as an incident file
    Generate {
        /// Output incident file
        #[arg(short, long)]
        output: PathBuf,

        /// Number of scenarios
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Pretrain a new model on synthetic graphs
    Pretrain {
        /// Output model file
        #[arg(short, long, default_value = "./cascade-model.bin")]
        output: PathBuf,

        /// Number of synthetic graphs
        #[arg(short = 'n', long, default_value = "1000")]
        samples: usize,

        /// Epochs (overrides config)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Random seed (overrides config)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Fine-tune a model on real incidents
    FineTune {
        /// Base model file
        #[arg(short, long)]
        model: PathBuf,

        /// Incident file (JSON)
        #[arg(short, long)]
        incidents: PathBuf,

        /// Output model file
        #[arg(short, long)]
        output: PathBuf,

        /// Epochs (overrides config)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Learning rate (overrides config)
        #[arg(long)]
        learning_rate: Option<f32>,
    },

    /// Retrain only the gate, promoting the result if it passes validation
    RetrainGate {
        /// Production model file
        #[arg(short, long)]
        model: PathBuf,

        /// Incident file (JSON)
        #[arg(short, long)]
        incidents: PathBuf,

        /// Destination for the promoted model
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the JSON report here
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Learning rate (1e-4 or 5e-5)
        #[arg(long)]
        learning_rate: Option<f32>,

        /// Epochs (5 to 15)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Use focal loss instead of weighted cross-entropy
        #[arg(long)]
        focal: bool,

        /// Focal gamma (capped at 2.0)
        #[arg(long)]
        focal_gamma: Option<f32>,

        /// Focal alpha (capped at 0.75)
        #[arg(long)]
        focal_alpha: Option<f32>,

        /// Train the output projection together with the gate
        #[arg(long)]
        train_output_layer: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Predict impact probabilities for an incident graph
    Predict {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,

        /// Incident file (JSON)
        #[arg(short, long)]
        incidents: PathBuf,

        /// Incident id or index (default: first)
        #[arg(long)]
        incident: Option<String>,

        /// Alert threshold (default from config)
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Simulate a node failure and report the cascade
    Simulate {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,

        /// Incident file (JSON)
        #[arg(short, long)]
        incidents: PathBuf,

        /// Incident id or index (default: first)
        #[arg(long)]
        incident: Option<String>,

        /// Node to fail; every node is ranked when omitted
        #[arg(short, long)]
        node: Option<usize>,

        /// Show unaffected nodes too
        #[arg(long)]
        all: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Score a model against incidents with known outcomes
    Backtest {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,

        /// Incident file (JSON)
        #[arg(short, long)]
        incidents: PathBuf,

        /// Second model to compare against the first
        #[arg(long)]
        compare: Option<PathBuf>,

        /// Inspection list length (default from config)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Alert threshold (default from config)
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show model artifact information
    Inspect {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    // Disable colors if requested
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load configuration
    let config = config::load(cli.config)?;

    // Execute command
    let result = match cli.command {
        Commands::Generate {
            output,
            count,
            seed,
        } => generate_incidents(&output, count, seed),
        Commands::Pretrain {
            output,
            samples,
            epochs,
            seed,
        } => pretrain(&output, samples, epochs, seed, &config),
        Commands::FineTune {
            model,
            incidents,
            output,
            epochs,
            learning_rate,
        } => fine_tune(&model, &incidents, &output, epochs, learning_rate, &config),
        Commands::RetrainGate {
            model,
            incidents,
            output,
            report,
            learning_rate,
            epochs,
            focal,
            focal_gamma,
            focal_alpha,
            train_output_layer,
            json,
        } => {
            let overrides = GateOverrides {
                learning_rate,
                epochs,
                focal,
                focal_gamma,
                focal_alpha,
                train_output_layer,
            };
            retrain_gate(
                &model,
                &incidents,
                &output,
                report.as_deref(),
                &overrides,
                json,
                &config,
            )
        }
        Commands::Predict {
            model,
            incidents,
            incident,
            threshold,
            json,
        } => predict(&model, &incidents, incident.as_deref(), threshold, json, &config),
        Commands::Simulate {
            model,
            incidents,
            incident,
            node,
            all,
            json,
        } => simulate(
            &model,
            &incidents,
            incident.as_deref(),
            node,
            all,
            json,
            &config,
        ),
        Commands::Backtest {
            model,
            incidents,
            compare,
            top_k,
            threshold,
            json,
        } => backtest(
            &model,
            &incidents,
            compare.as_deref(),
            top_k,
            threshold,
            json,
            &config,
        ),
        Commands::Inspect { model, json } => inspect(&model, json),
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{}", cli::format::format_error(&e.to_string()));
        if cli.verbose {
            eprintln!("\n{:#?}", e);
        } else {
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            eprintln!("\n{}", "Run with --verbose for more details".dimmed());
        }
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_backtest_flags() {
        let cli = Cli::parse_from([
            "cascade",
            "backtest",
            "-m",
            "a.bin",
            "-i",
            "inc.json",
            "--compare",
            "b.bin",
            "-k",
            "3",
        ]);
        match cli.command {
            Commands::Backtest {
                compare,
                top_k,
                threshold,
                ..
            } => {
                assert_eq!(compare, Some(PathBuf::from("b.bin")));
                assert_eq!(top_k, Some(3));
                assert_eq!(threshold, None);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_retrain_gate_flags() {
        let cli = Cli::parse_from([
            "cascade",
            "retrain-gate",
            "-m",
            "model.bin",
            "-i",
            "incidents.json",
            "-o",
            "out.bin",
            "--learning-rate",
            "5e-5",
            "--focal",
            "--train-output-layer",
        ]);
        match cli.command {
            Commands::RetrainGate {
                learning_rate,
                focal,
                train_output_layer,
                epochs,
                ..
            } => {
                assert_eq!(learning_rate, Some(5e-5));
                assert!(focal);
                assert!(train_output_layer);
                assert_eq!(epochs, None);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
