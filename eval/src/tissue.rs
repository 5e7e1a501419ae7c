//! Tissue segmentation scoring: per-item Dice inside workers, micro Dice
//! over the whole batch in the orchestrator.

use anyhow::{Context, Result};
use engine::reduce::{LabelClass, MicroAccumulator, MicroSummary, dice_per_class};
use engine::{ItemScores, Scorer, WorkItem};
use tracing::{debug, instrument};

use crate::mask::LabelMask;
use crate::predictions::TissueCase;
use crate::settings::EvalConfig;

/// Metric family reported for every item.
pub const DICE_FAMILY: &str = "tissue_dice";

/// Ground truth and prediction of one case, resampled to a common shape.
#[derive(Debug)]
struct MaskPair {
    truth: LabelMask,
    prediction: LabelMask,
}

impl MaskPair {
    fn load(case: &TissueCase, [width, height]: [u32; 2]) -> Result<Self> {
        let truth = LabelMask::load(&case.ground_truth).context("ground truth")?;
        let prediction = LabelMask::load(&case.prediction).context("prediction")?;
        Ok(Self {
            truth: truth.resize(width, height),
            prediction: prediction.resize(width, height),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TissueScorer {
    classes: Vec<LabelClass>,
    shape: [u32; 2],
}

impl TissueScorer {
    pub fn new(config: &EvalConfig) -> Self {
        Self {
            classes: config.classes.clone(),
            shape: config.image_shape,
        }
    }

    pub fn score_case(&self, case: &TissueCase) -> Result<ItemScores> {
        let pair = MaskPair::load(case, self.shape)?;
        let scores = dice_per_class(pair.truth.labels(), pair.prediction.labels(), &self.classes)?;
        let summary = scores.values().sum::<f64>() / scores.len().max(1) as f64;
        let mut item = ItemScores {
            summary,
            ..ItemScores::default()
        };
        item.metrics.insert(DICE_FAMILY.to_string(), scores);
        Ok(item)
    }
}

impl Scorer for TissueScorer {
    fn score(&self, item: &WorkItem) -> Result<ItemScores> {
        let case = TissueCase::from_item(item)?;
        self.score_case(&case)
            .with_context(|| format!("score {}", case.image_name))
    }
}

/// Pool every case's label counts and compute micro Dice per class.
#[instrument(skip_all, fields(cases = cases.len()))]
pub fn micro_dice(cases: &[TissueCase], config: &EvalConfig) -> Result<MicroSummary> {
    let mut acc = MicroAccumulator::new(config.classes.clone());
    for case in cases {
        let pair = MaskPair::load(case, config.image_shape)
            .with_context(|| format!("micro dice for {}", case.image_name))?;
        acc.add(pair.truth.labels(), pair.prediction.labels())?;
    }
    let summary = acc.finish();
    debug!(average = summary.average, "micro dice computed");
    Ok(summary)
}
