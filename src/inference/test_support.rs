//! Small networks and images shared by the inference and API tests.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array4;
use serde_json::{json, Value};

use super::classifier::{DiseaseClassifier, GradientProbe, InputSignature, NativeClassifier};
use super::network::{Network, NetworkSpec};
use super::registry::TrainedModel;
use super::InferenceError;
use crate::models::DiseaseLabel;

pub const TEST_INPUT: usize = 32;

fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

/// conv (zero kernel, bias 1) -> relu -> gap -> dense -> sigmoid.
///
/// Every input scores `sigmoid(0.5 * w_sum + bias)`.
fn pooled_head_spec(dense_weights: [f32; 2], dense_bias: f32) -> Value {
    json!({
        "name": "constant",
        "input": {"height": TEST_INPUT, "width": TEST_INPUT, "channels": 3},
        "layers": [
            {"type": "sequential", "name": "features", "layers": [
                {"type": "conv2d", "name": "features_conv", "filters": 2, "kernel_size": 3,
                 "padding": "same", "weights": vec![0.0; 3 * 3 * 3 * 2], "bias": [1.0, 1.0]},
                {"type": "relu", "name": "features_relu"}
            ]},
            {"type": "global_average_pool", "name": "gap"},
            {"type": "dropout", "name": "dropout", "rate": 0.2},
            {"type": "dense", "name": "head", "units": 1, "weights": dense_weights, "bias": [dense_bias]},
            {"type": "sigmoid", "name": "output"}
        ]
    })
}

/// Scores every image `score` regardless of content.
pub fn constant_model_spec(score: f32) -> Value {
    pooled_head_spec([0.5, 0.5], logit(score) - 1.0)
}

fn build(spec: Value) -> NativeClassifier {
    let spec: NetworkSpec = serde_json::from_value(spec).unwrap();
    NativeClassifier::from_network(Network::from_spec(spec).unwrap()).unwrap()
}

pub fn constant_classifier(score: f32) -> NativeClassifier {
    build(constant_model_spec(score))
}

/// Score rises with mean brightness; Grad-CAM highlights bright regions.
pub fn brightness_classifier() -> NativeClassifier {
    build(json!({
        "name": "brightness",
        "input": {"height": TEST_INPUT, "width": TEST_INPUT, "channels": 3},
        "layers": [
            {"type": "conv2d", "name": "features_conv", "filters": 1, "kernel_size": 1,
             "weights": [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]},
            {"type": "relu", "name": "features_relu"},
            {"type": "global_average_pool", "name": "gap"},
            {"type": "dense", "name": "head", "units": 1, "weights": [1.0], "bias": [-0.5]},
            {"type": "sigmoid", "name": "output"}
        ]
    }))
}

pub fn write_constant_model(path: &Path, score: f32) {
    std::fs::write(path, constant_model_spec(score).to_string()).unwrap();
}

fn trained(label: DiseaseLabel, classifier: Box<dyn DiseaseClassifier>) -> TrainedModel {
    TrainedModel::new(label, classifier, None, 0, PathBuf::new())
}

pub fn constant_model(label: DiseaseLabel, score: f32) -> TrainedModel {
    trained(label, Box::new(constant_classifier(score)))
}

pub fn brightness_model(label: DiseaseLabel) -> TrainedModel {
    trained(label, Box::new(brightness_classifier()))
}

/// Has a conv layer, but the score ignores it: zero gradient everywhere.
pub fn flat_model(label: DiseaseLabel, score: f32) -> TrainedModel {
    trained(label, Box::new(build(pooled_head_spec([0.0, 0.0], logit(score)))))
}

/// Returns `output` verbatim and has no layers to probe.
pub struct FixedOutputClassifier {
    pub output: Vec<f32>,
}

impl DiseaseClassifier for FixedOutputClassifier {
    fn input_signature(&self) -> InputSignature {
        InputSignature { height: 8, width: 8 }
    }

    fn predict(&self, _input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        Ok(self.output.clone())
    }

    fn last_conv_layer(&self) -> Option<String> {
        None
    }

    fn has_layer(&self, _name: &str) -> bool {
        false
    }

    fn gradient_probe(&self, _: &Array4<f32>, layer: &str, _: usize) -> Result<GradientProbe, InferenceError> {
        Err(InferenceError::GradCamUnavailable(format!("no layer '{layer}'")))
    }
}

/// Every forward pass errors.
pub struct FailingClassifier;

impl DiseaseClassifier for FailingClassifier {
    fn input_signature(&self) -> InputSignature {
        InputSignature { height: 8, width: 8 }
    }

    fn predict(&self, _input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        Err(InferenceError::Forward("simulated failure".into()))
    }

    fn last_conv_layer(&self) -> Option<String> {
        None
    }

    fn has_layer(&self, _name: &str) -> bool {
        false
    }

    fn gradient_probe(&self, _: &Array4<f32>, _: &str, _: usize) -> Result<GradientProbe, InferenceError> {
        Err(InferenceError::Forward("simulated failure".into()))
    }
}

pub fn fixed_output_model(label: DiseaseLabel, output: Vec<f32>) -> TrainedModel {
    trained(label, Box::new(FixedOutputClassifier { output }))
}

pub fn failing_model(label: DiseaseLabel) -> TrainedModel {
    trained(label, Box::new(FailingClassifier))
}

pub fn gray_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

/// Horizontal ramp, dark on the left.
pub fn gradient_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
        let v = (x * 255 / width.max(1)) as u8;
        Rgb([v, v, v])
    })
}

pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn gray_png(width: u32, height: u32, level: u8) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb([level, level, level]),
    )))
}

pub fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(gradient_image(width, height)))
}

/// Initialized service state in a temporary directory.
pub fn test_core(models: Vec<TrainedModel>) -> (tempfile::TempDir, crate::core_state::CoreState) {
    let dir = tempfile::tempdir().unwrap();
    let core = crate::core_state::CoreState::new(
        crate::config::ServiceConfig::rooted_at(dir.path()),
        super::registry::ModelRegistry::from_models(models),
    );
    core.initialize().unwrap();
    (dir, core)
}
