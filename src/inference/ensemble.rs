//! Ensemble predictor: every loaded model scores the image, highest score wins.

use std::collections::BTreeMap;

use image::RgbImage;
use serde::Serialize;

use super::preprocess::to_model_input;
use super::registry::{ModelRegistry, TrainedModel};
use super::InferenceError;
use crate::models::{DiseaseLabel, ScoreMap};

#[derive(Debug, Clone, Serialize)]
pub struct EnsemblePrediction {
    pub predicted_label: DiseaseLabel,
    pub confidence_score: f64,
    /// Every loaded label; models that failed are recorded as 0.0.
    pub all_scores: ScoreMap,
    /// Labels whose model errored or produced a non-finite score.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_models: Vec<DiseaseLabel>,
}

/// Clamp into `[0, 1]`; non-finite values are not scores.
pub fn sanitize_score(value: f32) -> Option<f64> {
    value.is_finite().then(|| f64::from(value).clamp(0.0, 1.0))
}

/// Reduce a model output row to one confidence: the sole value, or the max.
pub fn scalar_confidence(output: &[f32]) -> Option<f64> {
    if output.is_empty() || output.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let max = output.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    sanitize_score(max)
}

/// Arg-max over valid scores. Ties go to the lowest label ordinal.
pub fn select_best(scores: &BTreeMap<DiseaseLabel, Option<f64>>) -> Option<(DiseaseLabel, f64)> {
    scores
        .iter()
        .filter_map(|(label, score)| score.map(|s| (*label, s)))
        .fold(None, |best, (label, score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((label, score)),
        })
}

fn score_model(model: &TrainedModel, image: &RgbImage) -> Result<f64, InferenceError> {
    let input = to_model_input(image, model.classifier.input_signature())?;
    let output = model.classifier.predict(&input)?;
    scalar_confidence(&output)
        .ok_or_else(|| InferenceError::Forward(format!("non-finite output {output:?}")))
}

/// Score `image` with every loaded model.
pub fn predict(registry: &ModelRegistry, image: &RgbImage) -> Result<EnsemblePrediction, InferenceError> {
    if registry.is_empty() {
        return Err(InferenceError::NoValidPrediction("no models loaded".into()));
    }

    let mut scores = BTreeMap::new();
    for model in registry.iter() {
        let score = match score_model(model, image) {
            Ok(score) => {
                tracing::debug!(label = %model.label, score, "Model scored");
                Some(score)
            }
            Err(e) => {
                tracing::warn!(label = %model.label, error = %e, "Model failed, scoring 0.0");
                None
            }
        };
        scores.insert(model.label, score);
    }

    let (predicted_label, confidence_score) = select_best(&scores)
        .ok_or_else(|| InferenceError::NoValidPrediction("every model failed".into()))?;

    let invalid_models = scores
        .iter()
        .filter(|(_, s)| s.is_none())
        .map(|(label, _)| *label)
        .collect();
    let all_scores = scores
        .into_iter()
        .map(|(label, s)| (label, s.unwrap_or(0.0)))
        .collect();

    tracing::info!(label = %predicted_label, confidence = confidence_score, "Ensemble prediction");

    Ok(EnsemblePrediction {
        predicted_label,
        confidence_score,
        all_scores,
        invalid_models,
    })
}
