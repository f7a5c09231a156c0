//! Detection parsing and filtering.
//!
//! Workflow responses come back in more than one shape. This module flattens
//! them into a list of raw predictions, then keeps only those matching the
//! deployment's target label at or above its confidence threshold.

use serde::Serialize;
use serde_json::Value;

/// A filtered detection as reported back to the device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    /// Label as returned by the model (original casing).
    pub label: String,
    /// Confidence as a percentage, rounded to two decimals.
    pub confidence: f64,
}

/// Label/threshold pair applied to every prediction.
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    target_label: String,
    /// `target_label`, Unicode-lowercased.
    folded_target: String,
    min_confidence: f64,
}

impl DetectionFilter {
    pub fn new(target_label: impl Into<String>, min_confidence: f64) -> Self {
        let target_label = target_label.into();
        Self {
            folded_target: target_label.to_lowercase(),
            target_label,
            min_confidence,
        }
    }

    pub fn target_label(&self) -> &str {
        &self.target_label
    }

    /// Keep predictions whose label matches (case-insensitive) and whose
    /// unscaled confidence is `>=` the threshold.
    pub fn apply(&self, predictions: &[Value]) -> Vec<Detection> {
        predictions
            .iter()
            .filter_map(|prediction| {
                let label = prediction_label(prediction)?;
                if label.to_lowercase() != self.folded_target {
                    return None;
                }
                let confidence = prediction_confidence(prediction);
                if confidence < self.min_confidence {
                    return None;
                }
                Some(Detection {
                    label: label.to_string(),
                    confidence: to_percent(confidence),
                })
            })
            .collect()
    }
}

/// Flatten a workflow response into its predictions.
///
/// Accepted shapes:
/// - `{"predictions": [...]}`
/// - `[{"predictions": [...]}, ...]`
/// - either of the above where `predictions` is itself an object carrying a
///   `predictions` list
///
/// Anything else yields an empty list.
pub fn parse_predictions(response: &Value) -> Vec<Value> {
    match response {
        Value::Object(map) => map
            .get("predictions")
            .map(unwrap_prediction_list)
            .unwrap_or_default(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_object()?.get("predictions"))
            .flat_map(unwrap_prediction_list)
            .collect(),
        _ => Vec::new(),
    }
}

fn unwrap_prediction_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(inner) => match inner.get("predictions") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn prediction_label(prediction: &Value) -> Option<&str> {
    let obj = prediction.as_object()?;
    ["class", "label"]
        .iter()
        .filter_map(|key| obj.get(*key)?.as_str())
        .find(|label| !label.is_empty())
}

fn prediction_confidence(prediction: &Value) -> f64 {
    let Some(obj) = prediction.as_object() else {
        return 0.0;
    };
    ["confidence", "score"]
        .iter()
        .filter_map(|key| obj.get(*key)?.as_f64())
        .find(|value| *value != 0.0)
        .unwrap_or(0.0)
}

fn to_percent(confidence: f64) -> f64 {
    (confidence * 100.0 * 100.0).round() / 100.0
}
