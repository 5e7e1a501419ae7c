//! `metrics.json`: per-item results, batch aggregates and run metadata.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use engine::ItemResult;
use engine::reduce::{MacroSummary, MicroSummary, macro_average, mean_summary};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::tissue::DICE_FAMILY;

pub const METRICS_FILE: &str = "metrics.json";

/// Family a nuclei scorer reports per-class F1 under. Nothing in this
/// repository produces it yet; the aggregate keys appear only when it does.
pub const NUCLEI_F1_FAMILY: &str = "nuclei_f1";

#[derive(Debug, Serialize)]
pub struct MetricsReport {
    /// Sorted by item id.
    pub results: Vec<ItemResult>,
    pub aggregates: Aggregates,
    pub meta: RunMeta,
}

/// Leaderboard keys first, then the generic per-family view.
#[derive(Debug, Serialize)]
pub struct Aggregates {
    pub micro_dice_tissue: MicroDice,
    /// Macro tissue Dice per class.
    pub dice_tissue: BTreeMap<String, f64>,
    /// Macro nuclei F1 per class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f1_nuclei: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macro_f1_nuclei_average: Option<f64>,
    /// Per family: class scores averaged over items, then over classes.
    pub macro_average: BTreeMap<String, MacroSummary>,
    /// Mean of the per-item summaries.
    pub summary_mean: f64,
}

impl Aggregates {
    pub fn new(results: &[ItemResult], micro: MicroSummary) -> Self {
        let macro_average = macro_average(results);
        let dice_tissue = macro_average
            .get(DICE_FAMILY)
            .map(|summary| summary.per_class.clone())
            .unwrap_or_default();
        let nuclei = macro_average.get(NUCLEI_F1_FAMILY);
        Self {
            micro_dice_tissue: micro.into(),
            dice_tissue,
            f1_nuclei: nuclei.map(|summary| summary.per_class.clone()),
            macro_f1_nuclei_average: nuclei.map(|summary| summary.mean),
            macro_average,
            summary_mean: mean_summary(results),
        }
    }
}

/// Micro Dice flattened the way leaderboards read it.
#[derive(Debug, Serialize)]
pub struct MicroDice {
    #[serde(flatten)]
    pub per_class: BTreeMap<String, f64>,
    pub average_micro_dice: f64,
}

impl From<MicroSummary> for MicroDice {
    fn from(summary: MicroSummary) -> Self {
        Self {
            per_class: summary.per_class,
            average_micro_dice: summary.average,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunMeta {
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub workers: usize,
    pub items: usize,
    /// SHA-256 of the predictions manifest, for reproducibility tracking.
    pub predictions_sha256: String,
}

impl RunMeta {
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        workers: usize,
        items: usize,
        predictions_sha256: String,
    ) -> Self {
        let duration = finished_at - started_at;
        Self {
            start_time: started_at.to_rfc3339(),
            end_time: finished_at.to_rfc3339(),
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            workers,
            items,
            predictions_sha256,
        }
    }
}

impl MetricsReport {
    pub fn new(mut results: Vec<ItemResult>, micro: MicroSummary, meta: RunMeta) -> Self {
        results.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        let aggregates = Aggregates::new(&results, micro);
        Self {
            results,
            aggregates,
            meta,
        }
    }

    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        let path = output_dir.join(METRICS_FILE);
        let mut contents = serde_json::to_string_pretty(self).context("serialize metrics")?;
        contents.push('\n');
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "metrics written");
        Ok(path)
    }
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use engine::{ItemScores, WorkItem};
    use serde_json::{Value, json};

    use super::*;

    fn result(id: &str, score: f64) -> ItemResult {
        let mut scores = ItemScores {
            summary: score,
            ..ItemScores::default()
        };
        scores
            .metrics
            .entry(DICE_FAMILY.to_string())
            .or_default()
            .insert("tumor".to_string(), score);
        ItemResult::new(&WorkItem::new(id, Value::Null), scores)
    }

    fn with_nuclei(mut result: ItemResult, f1: &[(&str, f64)]) -> ItemResult {
        let family = result
            .scores
            .metrics
            .entry(NUCLEI_F1_FAMILY.to_string())
            .or_default();
        for (class, score) in f1 {
            family.insert((*class).to_string(), *score);
        }
        result
    }

    fn micro() -> MicroSummary {
        MicroSummary {
            per_class: BTreeMap::from([("tumor".to_string(), 0.5)]),
            average: 0.5,
        }
    }

    #[test]
    fn sorts_results_and_aggregates() {
        let now = Utc::now();
        let meta = RunMeta::new(now, now, 2, 2, "abc".to_string());
        let report = MetricsReport::new(vec![result("b", 0.5), result("a", 1.0)], micro(), meta);

        let ids: Vec<_> = report.results.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(report.aggregates.summary_mean, 0.75);
        assert_eq!(report.aggregates.dice_tissue["tumor"], 0.75);
        assert_eq!(report.aggregates.macro_average[DICE_FAMILY].mean, 0.75);
        assert_eq!(report.aggregates.f1_nuclei, None);
    }

    #[test]
    fn nuclei_keys_follow_the_nuclei_family() {
        let results = vec![
            with_nuclei(result("a", 1.0), &[("nuclei_tumor", 1.0), ("micro", 0.9)]),
            with_nuclei(result("b", 1.0), &[("nuclei_tumor", 0.5), ("macro", 0.1)]),
        ];
        let aggregates = Aggregates::new(&results, micro());
        let f1 = aggregates.f1_nuclei.as_ref().expect("nuclei f1");
        assert_eq!(f1.keys().collect::<Vec<_>>(), vec!["nuclei_tumor"]);
        assert_eq!(f1["nuclei_tumor"], 0.75);
        assert_eq!(aggregates.macro_f1_nuclei_average, Some(0.75));
    }

    #[test]
    fn writes_flattened_micro_scores() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let report = MetricsReport::new(
            vec![result("a", 1.0)],
            micro(),
            RunMeta::new(now, now, 1, 1, "abc".to_string()),
        );
        let path = report.write(&temp.path().join("out")).expect("write");

        let written: Value =
            serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json");
        assert_eq!(
            written["aggregates"]["micro_dice_tissue"],
            json!({"tumor": 0.5, "average_micro_dice": 0.5})
        );
        assert_eq!(written["aggregates"]["dice_tissue"], json!({"tumor": 1.0}));
        let aggregates = written["aggregates"].as_object().expect("aggregates");
        assert!(!aggregates.contains_key("f1_nuclei"));
        assert!(!aggregates.contains_key("macro_f1_nuclei_average"));
        assert_eq!(written["results"][0]["item_id"], "a");
        assert_eq!(written["meta"]["predictions_sha256"], "abc");
    }

    #[test]
    fn hashes_file_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("predictions.json");
        fs::write(&path, "[]").expect("write");
        assert_eq!(
            file_sha256(&path).expect("hash"),
            "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945"
        );
    }
}
