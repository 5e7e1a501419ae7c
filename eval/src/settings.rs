//! Evaluator configuration (`eval.toml`).
//!
//! Relative directories are resolved against the directory holding the
//! config file, so a config can travel with its data.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use engine::EngineConfig;
use engine::reduce::LabelClass;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvalConfig {
    /// Holds `predictions.json` and one directory per algorithm job.
    pub input_dir: PathBuf,
    /// Where `metrics.json` is written.
    pub output_dir: PathBuf,
    pub ground_truth_dir: PathBuf,
    /// `[width, height]` every mask is resampled to before comparison.
    pub image_shape: [u32; 2],
    /// Interface slug of the input whole-slide image.
    pub image_slug: String,
    /// Interface slug of the predicted tissue mask.
    pub prediction_slug: String,
    pub mask_extension: String,
    pub classes: Vec<LabelClass>,
    pub engine: EngineConfig,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            ground_truth_dir: PathBuf::from("ground_truth"),
            image_shape: [1024, 1024],
            image_slug: "melanoma-whole-slide-image".to_string(),
            prediction_slug: "melanoma-tissue-mask-segmentation".to_string(),
            mask_extension: "tif".to_string(),
            classes: default_classes(),
            engine: EngineConfig::default(),
        }
    }
}

fn default_classes() -> Vec<LabelClass> {
    [
        (1, "tissue_stroma"),
        (2, "tissue_blood_vessel"),
        (3, "tissue_tumor"),
        (4, "tissue_epidermis"),
        (5, "tissue_necrosis"),
    ]
    .into_iter()
    .map(|(label, name)| LabelClass::new(label, name))
    .collect()
}

impl EvalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.image_shape.contains(&0) {
            bail!(
                "image_shape must be positive (got {}x{})",
                self.image_shape[0],
                self.image_shape[1]
            );
        }
        if self.classes.is_empty() {
            bail!("classes must not be empty");
        }
        let mut labels = BTreeSet::new();
        let mut names = BTreeSet::new();
        for class in &self.classes {
            if class.label == 0 {
                bail!("class {} uses label 0, which is background", class.name);
            }
            if !labels.insert(class.label) {
                bail!("duplicate class label {}", class.label);
            }
            if !names.insert(class.name.as_str()) {
                bail!("duplicate class name {}", class.name);
            }
        }
        if self.mask_extension.trim().is_empty() {
            bail!("mask_extension must not be empty");
        }
        if self.image_slug.is_empty() || self.prediction_slug.is_empty() {
            bail!("interface slugs must not be empty");
        }
        self.engine.validate().context("invalid [engine] table")?;
        Ok(())
    }

    /// Pixel count of a resampled mask.
    pub fn pixels(&self) -> usize {
        self.image_shape[0] as usize * self.image_shape[1] as usize
    }

    fn resolve_paths(mut self, base: &Path) -> Self {
        for dir in [
            &mut self.input_dir,
            &mut self.output_dir,
            &mut self.ground_truth_dir,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        self
    }
}

/// Load the evaluator config.
///
/// If the file is missing, returns `EvalConfig::default()` with directories
/// relative to the current directory.
pub fn load_config(path: &Path) -> Result<EvalConfig> {
    if !path.exists() {
        let cfg = EvalConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EvalConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let cfg = cfg.resolve_paths(base);
    cfg.validate()?;
    Ok(cfg)
}
