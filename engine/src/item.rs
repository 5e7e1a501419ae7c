//! Units of work and their scored output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scores keyed by class name.
pub type ClassScores = BTreeMap<String, f64>;

/// One input unit to evaluate.
///
/// `payload` carries whatever locators the scorer needs (file paths, keys);
/// the engine never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// What a scorer produces for a single item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemScores {
    /// Metric families (e.g. `"tissue_dice"`), each mapping class name to score.
    pub metrics: BTreeMap<String, ClassScores>,
    /// Scalar summary of the item, typically the mean over its classes.
    pub summary: f64,
}

/// A successfully evaluated item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    #[serde(flatten)]
    pub scores: ItemScores,
}

impl ItemResult {
    pub fn new(item: &WorkItem, scores: ItemScores) -> Self {
        Self {
            item_id: item.id.clone(),
            scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_defaults_to_null() {
        let item: WorkItem = serde_json::from_str(r#"{"id":"a"}"#).expect("parse");
        assert_eq!(item.id, "a");
        assert_eq!(item.payload, Value::Null);
    }

    #[test]
    fn result_flattens_scores() {
        let mut scores = ItemScores {
            summary: 0.5,
            ..ItemScores::default()
        };
        scores
            .metrics
            .entry("dice".to_string())
            .or_default()
            .insert("stroma".to_string(), 0.5);
        let result = ItemResult::new(&WorkItem::new("slide-1", json!({})), scores);
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(
            value,
            json!({"item_id": "slide-1", "metrics": {"dice": {"stroma": 0.5}}, "summary": 0.5})
        );
    }
}
