//! Batch evaluator for tissue segmentation predictions.
//!
//! `eval run` reads a predictions manifest, scores every job in parallel
//! worker processes (re-executions of this binary as `eval worker`), and
//! writes `metrics.json`. The first failing job aborts the whole batch.

mod cli;
mod exit_codes;
mod mask;
mod predictions;
mod report;
mod settings;
mod tissue;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use engine::RunFailure;

#[derive(Parser)]
#[command(
    name = "eval",
    version,
    about = "Fail-fast parallel evaluation of segmentation predictions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score every job in `<input_dir>/predictions.json`.
    Run {
        /// Evaluator config; defaults apply when the file is missing.
        #[arg(long, default_value = "eval.toml")]
        config: PathBuf,
        /// Upper bound on worker processes (overrides config and environment).
        #[arg(long)]
        max_workers: Option<i64>,
    },
    /// Serve scoring requests on stdin/stdout. Started by `run`.
    #[command(hide = true)]
    Worker {
        #[arg(long, default_value = "eval.toml")]
        config: PathBuf,
    },
}

fn main() {
    engine::logging::init("info");
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        let code = if err.downcast_ref::<RunFailure>().is_some() {
            exit_codes::EVALUATION_FAILED
        } else {
            exit_codes::INVALID
        };
        std::process::exit(code);
    }
    std::process::exit(exit_codes::OK);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            max_workers,
        } => cli::run_evaluation(&config, max_workers),
        Command::Worker { config } => cli::serve_worker(&config),
    }
}
