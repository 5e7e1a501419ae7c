//! The `predictions.json` manifest: one entry per algorithm job.
//!
//! Each job names its input image and the interfaces it produced. From that
//! we derive one [`TissueCase`] (input name, predicted mask, ground truth)
//! per job, which travels to a worker as the item payload.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use engine::WorkItem;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::settings::EvalConfig;

pub const MANIFEST_FILE: &str = "predictions.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub pk: String,
    #[serde(default)]
    pub inputs: Vec<InterfaceValue>,
    #[serde(default)]
    pub outputs: Vec<InterfaceValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceValue {
    pub interface: Interface,
    #[serde(default)]
    pub image: Option<ImageRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interface {
    pub slug: String,
    #[serde(default)]
    pub relative_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pk: Option<String>,
}

fn find<'a>(values: &'a [InterfaceValue], slug: &str) -> Result<&'a InterfaceValue> {
    values
        .iter()
        .find(|value| value.interface.slug == slug)
        .ok_or_else(|| anyhow!("interface {slug} not found"))
}

fn image_name(values: &[InterfaceValue], slug: &str) -> Result<String> {
    find(values, slug)?
        .image
        .as_ref()
        .and_then(|image| image.name.clone())
        .ok_or_else(|| anyhow!("interface {slug} has no image name"))
}

fn image_pk(values: &[InterfaceValue], slug: &str) -> Result<String> {
    find(values, slug)?
        .image
        .as_ref()
        .and_then(|image| image.pk.clone())
        .ok_or_else(|| anyhow!("interface {slug} has no image pk"))
}

fn relative_path(values: &[InterfaceValue], slug: &str) -> Result<String> {
    find(values, slug)?
        .interface
        .relative_path
        .clone()
        .ok_or_else(|| anyhow!("interface {slug} has no relative_path"))
}

/// Everything a worker needs to score one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TissueCase {
    /// Input image name; doubles as the item id.
    pub image_name: String,
    pub prediction: PathBuf,
    pub ground_truth: PathBuf,
}

impl TissueCase {
    /// Resolve a job's file locations.
    ///
    /// Prediction: `<input_dir>/<job pk>/output/<relative_path>/<image pk>.<ext>`.
    /// Ground truth: `<ground_truth_dir>/<input image name>`.
    pub fn from_job(job: &Job, config: &EvalConfig) -> Result<Self> {
        let image_name = image_name(&job.inputs, &config.image_slug)?;
        let relative = relative_path(&job.outputs, &config.prediction_slug)?;
        let mask_pk = image_pk(&job.outputs, &config.prediction_slug)?;

        let prediction = config
            .input_dir
            .join(&job.pk)
            .join("output")
            .join(relative)
            .join(format!("{mask_pk}.{}", config.mask_extension));

        if Path::new(&image_name).file_name() != Some(OsStr::new(&image_name)) {
            bail!("input image name {image_name:?} is not a plain file name");
        }
        let ground_truth = config.ground_truth_dir.join(&image_name);

        Ok(Self {
            image_name,
            prediction,
            ground_truth,
        })
    }

    pub fn to_item(&self) -> Result<WorkItem> {
        let payload = serde_json::to_value(self).context("serialize tissue case")?;
        Ok(WorkItem::new(self.image_name.clone(), payload))
    }

    pub fn from_item(item: &WorkItem) -> Result<Self> {
        serde_json::from_value(item.payload.clone())
            .with_context(|| format!("decode payload of item {}", item.id))
    }
}

pub fn load_jobs(path: &Path) -> Result<Vec<Job>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Resolve every job. Two jobs for the same input image are rejected.
#[instrument(skip_all, fields(jobs = jobs.len()))]
pub fn resolve_cases(jobs: &[Job], config: &EvalConfig) -> Result<Vec<TissueCase>> {
    let mut seen = BTreeSet::new();
    let mut cases = Vec::with_capacity(jobs.len());
    for job in jobs {
        let case = TissueCase::from_job(job, config).with_context(|| format!("job {}", job.pk))?;
        if !seen.insert(case.image_name.clone()) {
            bail!("input image {} appears in more than one job", case.image_name);
        }
        info!(
            prediction = %case.prediction.display(),
            image = %case.image_name,
            "tissue mask mapped to input image"
        );
        cases.push(case);
    }
    Ok(cases)
}

/// Log every file under `dir`, sorted. Returns them as well.
pub fn list_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).with_context(|| format!("read {}", current.display()))? {
            let entry = entry.context("read entry")?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    info!(dir = %dir.display(), count = files.len(), "input files");
    for file in &files {
        info!(file = %file.display(), "input file");
    }
    Ok(files)
}
