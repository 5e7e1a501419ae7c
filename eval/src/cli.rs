//! CLI command implementations.

use std::env;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use engine::protocol::serve;
use engine::{Engine, WorkerCommand};
use tracing::{info, instrument};

use crate::predictions::{MANIFEST_FILE, list_inputs, load_jobs, resolve_cases};
use crate::report::{MetricsReport, RunMeta, file_sha256};
use crate::settings::{EvalConfig, load_config};
use crate::tissue::{TissueScorer, micro_dice};

/// Config after the environment and command-line overrides.
fn effective_config(config_path: &Path, max_workers: Option<i64>) -> Result<EvalConfig> {
    let mut config = load_config(config_path)?;
    config.engine = config
        .engine
        .with_env_override(|name| env::var(name).ok())
        .context("apply environment override")?;
    if let Some(max_workers) = max_workers {
        config.engine.max_workers = Some(max_workers);
        config.engine.validate().context("invalid --max-workers")?;
    }
    Ok(config)
}

/// Evaluate every job in the predictions manifest and write `metrics.json`.
///
/// A failed run returns the engine's `RunFailure` and writes nothing.
#[instrument(skip_all, fields(config = %config_path.display()))]
pub fn run_evaluation(config_path: &Path, max_workers: Option<i64>) -> Result<()> {
    let config = effective_config(config_path, max_workers)?;
    list_inputs(&config.input_dir)?;

    let manifest = config.input_dir.join(MANIFEST_FILE);
    let jobs = load_jobs(&manifest)?;
    let cases = resolve_cases(&jobs, &config)?;
    let items = cases
        .iter()
        .map(|case| case.to_item())
        .collect::<Result<Vec<_>>>()?;

    let exe = env::current_exe().context("locate eval executable")?;
    let command = WorkerCommand::new(exe)
        .arg("worker")
        .arg("--config")
        .arg(config_path.display().to_string());
    let engine = Engine::new(config.engine.clone(), command)?;
    let workers = engine.worker_count(items.len());
    info!(jobs = jobs.len(), workers, "evaluating predictions");

    let started_at = Utc::now();
    let results = engine.run(items).into_result()?;
    let micro = micro_dice(&cases, &config)?;
    let finished_at = Utc::now();

    let meta = RunMeta::new(
        started_at,
        finished_at,
        workers,
        results.len(),
        file_sha256(&manifest)?,
    );
    let report = MetricsReport::new(results, micro, meta);
    let path = report.write(&config.output_dir)?;
    println!(
        "run: items={} summary_mean={:.4} average_micro_dice={:.4} metrics={}",
        report.results.len(),
        report.aggregates.summary_mean,
        report.aggregates.micro_dice_tissue.average_micro_dice,
        path.display()
    );
    Ok(())
}

/// Worker side: score requests from stdin until it closes.
pub fn serve_worker(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let scorer = TissueScorer::new(&config);
    let handled = serve(&scorer, io::stdin().lock(), io::stdout().lock())?;
    info!(handled, "worker finished");
    Ok(())
}
