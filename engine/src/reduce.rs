//! Folding per-item results into batch metrics.
//!
//! Two reductions with deliberately different rules:
//!
//! - **Macro**: average per-item scores. Each class's scores are summed over
//!   all results and divided by the number of results; the family score is
//!   the unweighted mean of those per-class means.
//! - **Micro**: pool raw label counts across every item first, then compute
//!   one Dice ratio per class. A class whose pooled intersection is zero
//!   scores 0, even though a single item with two empty masks scores 1.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::item::{ClassScores, ItemResult};

/// Smoothing term of the Dice ratio.
pub const DICE_EPS: f64 = 1e-5;

/// Class keys a scorer may use for its own per-item summaries. The macro
/// fold skips them so they are not averaged as if they were classes.
pub const RESERVED_CLASS_KEYS: [&str; 2] = ["micro", "macro"];

/// A label value in a mask and the class it stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelClass {
    pub label: u8,
    pub name: String,
}

impl LabelClass {
    pub fn new(label: u8, name: impl Into<String>) -> Self {
        Self {
            label,
            name: name.into(),
        }
    }
}

/// Macro-averaged scores of one metric family.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MacroSummary {
    pub per_class: ClassScores,
    /// Unweighted mean of `per_class`; 0 when the family has no classes.
    pub mean: f64,
}

/// Macro reduction over every metric family present in `results`.
///
/// A class missing from some results contributes nothing for them but the
/// divisor is still the full result count. Keys in [`RESERVED_CLASS_KEYS`]
/// are skipped.
pub fn macro_average(results: &[ItemResult]) -> BTreeMap<String, MacroSummary> {
    let mut sums: BTreeMap<String, ClassScores> = BTreeMap::new();
    for result in results {
        for (family, scores) in &result.scores.metrics {
            let family_sums = sums.entry(family.clone()).or_default();
            let classes = scores
                .iter()
                .filter(|(class, _)| !RESERVED_CLASS_KEYS.contains(&class.as_str()));
            for (class, score) in classes {
                *family_sums.entry(class.clone()).or_insert(0.0) += score;
            }
        }
    }

    let count = results.len() as f64;
    sums.into_iter()
        .map(|(family, class_sums)| {
            let per_class: ClassScores = class_sums
                .into_iter()
                .map(|(class, sum)| (class, sum / count))
                .collect();
            let mean = mean(per_class.values().copied());
            (family, MacroSummary { per_class, mean })
        })
        .collect()
}

/// Mean of the per-item summaries; 0 for an empty batch.
pub fn mean_summary(results: &[ItemResult]) -> f64 {
    mean(results.iter().map(|r| r.scores.summary))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

/// Label counts for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverlapCounts {
    pub intersection: u64,
    pub truth: u64,
    pub prediction: u64,
}

impl OverlapCounts {
    fn count(truth: &[u8], prediction: &[u8], label: u8) -> Self {
        let mut counts = Self::default();
        for (t, p) in truth.iter().zip(prediction) {
            let in_truth = *t == label;
            let in_prediction = *p == label;
            counts.truth += u64::from(in_truth);
            counts.prediction += u64::from(in_prediction);
            counts.intersection += u64::from(in_truth && in_prediction);
        }
        counts
    }

    fn add(&mut self, other: OverlapCounts) {
        self.intersection += other.intersection;
        self.truth += other.truth;
        self.prediction += other.prediction;
    }

    /// Smoothed Dice ratio `(2I + eps) / (|T| + |P| + eps)`.
    pub fn dice(&self) -> f64 {
        let union = (self.truth + self.prediction) as f64;
        (2.0 * self.intersection as f64 + DICE_EPS) / (union + DICE_EPS)
    }
}

fn check_shapes(truth: &[u8], prediction: &[u8]) -> Result<()> {
    if truth.len() != prediction.len() {
        bail!(
            "label arrays differ in size: truth {} vs prediction {}",
            truth.len(),
            prediction.len()
        );
    }
    Ok(())
}

/// Per-item Dice for each class. Two empty masks are a perfect match.
pub fn dice_per_class(
    truth: &[u8],
    prediction: &[u8],
    classes: &[LabelClass],
) -> Result<ClassScores> {
    check_shapes(truth, prediction)?;
    Ok(classes
        .iter()
        .map(|class| {
            let counts = OverlapCounts::count(truth, prediction, class.label);
            let score = if counts.truth == 0 && counts.prediction == 0 {
                1.0
            } else {
                counts.dice()
            };
            (class.name.clone(), score)
        })
        .collect())
}

/// Micro Dice scores across a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MicroSummary {
    pub per_class: ClassScores,
    /// Unweighted mean of `per_class`.
    pub average: f64,
}

/// Pools label counts across items for the micro reduction.
#[derive(Debug, Clone)]
pub struct MicroAccumulator {
    classes: Vec<LabelClass>,
    counts: Vec<OverlapCounts>,
}

impl MicroAccumulator {
    pub fn new(classes: Vec<LabelClass>) -> Self {
        let counts = vec![OverlapCounts::default(); classes.len()];
        Self { classes, counts }
    }

    /// Add one item's ground-truth and predicted label arrays.
    pub fn add(&mut self, truth: &[u8], prediction: &[u8]) -> Result<()> {
        check_shapes(truth, prediction)?;
        for (class, counts) in self.classes.iter().zip(self.counts.iter_mut()) {
            counts.add(OverlapCounts::count(truth, prediction, class.label));
        }
        Ok(())
    }

    pub fn finish(&self) -> MicroSummary {
        let per_class: ClassScores = self
            .classes
            .iter()
            .zip(&self.counts)
            .map(|(class, counts)| {
                // Pooled intersection of zero is a miss, never a smoothed match.
                let score = if counts.intersection == 0 {
                    0.0
                } else {
                    counts.dice()
                };
                (class.name.clone(), score)
            })
            .collect();
        let average = mean(per_class.values().copied());
        MicroSummary { per_class, average }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::item::{ItemScores, WorkItem};

    fn result(id: &str, family: &str, scores: &[(&str, f64)]) -> ItemResult {
        let mut item_scores = ItemScores::default();
        let family_scores = item_scores.metrics.entry(family.to_string()).or_default();
        for (class, score) in scores {
            family_scores.insert((*class).to_string(), *score);
        }
        item_scores.summary = mean(scores.iter().map(|(_, s)| *s));
        ItemResult::new(&WorkItem::new(id, Value::Null), item_scores)
    }

    fn classes() -> Vec<LabelClass> {
        vec![LabelClass::new(1, "a"), LabelClass::new(2, "b")]
    }

    #[test]
    fn macro_averages_by_item_count() {
        let results = vec![
            result("1", "dice", &[("A", 1.0)]),
            result("2", "dice", &[("A", 0.5)]),
        ];
        let summary = macro_average(&results);
        assert_eq!(summary["dice"].per_class["A"], 0.75);
        assert_eq!(summary["dice"].mean, 0.75);
    }

    #[test]
    fn macro_treats_missing_class_as_zero_and_means_classes_unweighted() {
        let results = vec![
            result("1", "f1", &[("A", 1.0), ("B", 1.0)]),
            result("2", "f1", &[("A", 0.5)]),
        ];
        let summary = &macro_average(&results)["f1"];
        assert_eq!(summary.per_class["A"], 0.75);
        assert_eq!(summary.per_class["B"], 0.5);
        assert_eq!(summary.mean, 0.625);
    }

    #[test]
    fn macro_skips_reserved_summary_keys() {
        let results = vec![
            result("1", "f1", &[("A", 1.0), ("micro", 0.2), ("macro", 0.3)]),
            result("2", "f1", &[("A", 0.5), ("micro", 0.4)]),
        ];
        let summary = &macro_average(&results)["f1"];
        assert_eq!(summary.per_class.keys().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(summary.mean, 0.75);
    }

    #[test]
    fn macro_of_nothing_is_empty() {
        assert!(macro_average(&[]).is_empty());
        assert_eq!(mean_summary(&[]), 0.0);
    }

    #[test]
    fn per_item_empty_masks_are_a_perfect_match() {
        let truth = [0, 0, 1, 1];
        let prediction = [0, 0, 1, 0];
        let scores = dice_per_class(&truth, &prediction, &classes()).expect("dice");
        assert_eq!(scores["b"], 1.0);
        let expected_a = (2.0 + DICE_EPS) / (3.0 + DICE_EPS);
        assert!((scores["a"] - expected_a).abs() < 1e-12);
    }

    // Zero pooled intersection scores 0 on purpose, unlike the per-item
    // empty/empty rule above.
    #[test]
    fn micro_zero_intersection_scores_zero() {
        let mut acc = MicroAccumulator::new(classes());
        // Class b: 6 truth pixels and 4 predicted pixels, never overlapping.
        acc.add(&[2, 2, 2, 0, 0], &[0, 0, 0, 2, 2]).expect("item 1");
        acc.add(&[2, 2, 2, 0, 0], &[0, 0, 0, 2, 2]).expect("item 2");
        let counts = acc.counts[1];
        assert_eq!(counts.intersection, 0);
        assert_eq!(counts.truth + counts.prediction, 10);

        let summary = acc.finish();
        assert_eq!(summary.per_class["b"], 0.0);
    }

    #[test]
    fn micro_pooled_empty_class_scores_zero_not_one() {
        let truth = [0u8, 0, 0, 0];
        let prediction = [0u8, 0, 0, 0];
        let per_item = dice_per_class(&truth, &prediction, &classes()).expect("dice");
        assert_eq!(per_item["a"], 1.0);

        let mut acc = MicroAccumulator::new(classes());
        acc.add(&truth, &prediction).expect("item");
        acc.add(&truth, &prediction).expect("item");
        assert_eq!(acc.finish().per_class["a"], 0.0);
    }

    #[test]
    fn micro_pools_counts_before_dividing() {
        let mut acc = MicroAccumulator::new(vec![LabelClass::new(1, "a")]);
        // Item 1: perfect on 1 pixel. Item 2: 1 of 3 overlapping.
        acc.add(&[1, 0], &[1, 0]).expect("item 1");
        acc.add(&[1, 1, 0], &[1, 0, 1]).expect("item 2");
        let summary = acc.finish();
        let expected = (2.0 * 2.0 + DICE_EPS) / (6.0 + DICE_EPS);
        assert!((summary.per_class["a"] - expected).abs() < 1e-12);
        assert_eq!(summary.average, summary.per_class["a"]);
        assert_eq!(acc.counts[0].truth, 3);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mut acc = MicroAccumulator::new(classes());
        assert!(acc.add(&[1, 2], &[1]).is_err());
        assert!(dice_per_class(&[1], &[1, 2], &classes()).is_err());
    }
}
