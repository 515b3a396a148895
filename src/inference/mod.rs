//! Chest X-ray inference: per-disease classifier ensemble and Grad-CAM.
//!
//! Leaf first:
//! - `network` - layer graph runtime with a gradient tape
//! - `classifier` - `DiseaseClassifier` seam (native JSON graphs, ONNX behind `onnx`)
//! - `registry` - one trained model per disease label, loaded once at startup
//! - `preprocess` - decode + resize + scale to the model's input signature
//! - `ensemble` - run every model, arg-max over sanitized scores
//! - `gradcam` - class activation heatmap and overlay rendering

pub mod classifier;
pub mod ensemble;
pub mod gradcam;
pub mod network;
pub mod preprocess;
pub mod registry;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(test)]
pub(crate) mod test_support;

pub use classifier::{DiseaseClassifier, GradientProbe, InputSignature};
pub use ensemble::EnsemblePrediction;
pub use gradcam::{GradCamOutput, Heatmap};
pub use registry::{ModelRegistry, ModelStatus, TrainedModel};

use std::path::PathBuf;

use thiserror::Error;

use crate::models::DiseaseLabel;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Failed to load model from {path}: {reason}")]
    ModelLoadFailure { path: PathBuf, reason: String },

    #[error("No model loaded for {0}")]
    ModelNotLoaded(DiseaseLabel),

    #[error("Image preprocessing failed: {0}")]
    PreprocessFailure(String),

    #[error("Forward pass failed: {0}")]
    Forward(String),

    #[error("No valid prediction: {0}")]
    NoValidPrediction(String),

    #[error("Grad-CAM unavailable: {0}")]
    GradCamUnavailable(String),
}

impl From<ndarray::ShapeError> for InferenceError {
    fn from(err: ndarray::ShapeError) -> Self {
        InferenceError::Forward(format!("tensor shape: {err}"))
    }
}
