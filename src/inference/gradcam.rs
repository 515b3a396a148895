//! Grad-CAM: class activation heatmaps over the source X-ray.
//!
//! Any failure here is reported as `GradCamUnavailable`; callers treat that
//! as "no heatmap" and never fail the prediction because of it.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{ImageBuffer, ImageFormat, Luma, Rgb, RgbImage};
use ndarray::{Array1, Axis};

use super::classifier::GradientProbe;
use super::preprocess::to_model_input;
use super::registry::{ModelRegistry, TrainedModel};
use super::InferenceError;
use crate::models::DiseaseLabel;

/// Weight of the source image in the overlay; the heatmap gets the rest.
pub const ORIGINAL_WEIGHT: f32 = 0.6;

/// Class activation map, values in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    pub values: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl Heatmap {
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.values.get((y * self.width + x) as usize).copied()
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// Smoothly resample to `width` x `height`.
    pub fn resize(&self, width: u32, height: u32) -> Result<Heatmap, InferenceError> {
        if (width, height) == (self.width, self.height) {
            return Ok(self.clone());
        }
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(self.width, self.height, self.values.clone()).ok_or_else(|| {
                InferenceError::GradCamUnavailable("heatmap buffer size mismatch".into())
            })?;
        let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
        Ok(Heatmap {
            values: resized.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)).collect(),
            width,
            height,
        })
    }

    /// Colourize with the jet ramp.
    pub fn to_colored_image(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| jet(self.get(x, y).unwrap_or(0.0)))
    }
}

/// Linear interpolation through `(position, value)` control points.
fn ramp(points: &[(f32, f32)], t: f32) -> f32 {
    for pair in points.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if t <= x1 {
            if x1 <= x0 {
                return y1;
            }
            return y0 + (y1 - y0) * (t - x0) / (x1 - x0);
        }
    }
    points.last().map(|p| p.1).unwrap_or(0.0)
}

const JET_RED: [(f32, f32); 5] = [(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: [(f32, f32); 6] = [
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_BLUE: [(f32, f32); 5] = [(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

/// Jet colour map: dark blue at 0, through cyan, yellow, to dark red at 1.
pub fn jet(value: f32) -> Rgb<u8> {
    let t = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let channel = |points: &[(f32, f32)]| (ramp(points, t) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([channel(&JET_RED), channel(&JET_GREEN), channel(&JET_BLUE)])
}

/// Gradient-weighted class activation map from one probe.
///
/// Channel weights are the spatial mean of the gradients; the weighted sum
/// of activations is clipped at zero and divided by its maximum. A map
/// with no positive evidence comes back all zeros.
pub fn compute_heatmap(probe: &GradientProbe) -> Result<Heatmap, InferenceError> {
    let (h, w, c) = probe.activations.dim();
    if probe.gradients.dim() != (h, w, c) {
        return Err(InferenceError::GradCamUnavailable(
            "activation and gradient shapes differ".into(),
        ));
    }
    if h == 0 || w == 0 || c == 0 {
        return Err(InferenceError::GradCamUnavailable("empty activation map".into()));
    }

    let area = (h * w) as f32;
    let weights: Array1<f32> = probe.gradients.sum_axis(Axis(0)).sum_axis(Axis(0)) / area;
    let flat = probe
        .activations
        .to_shape((h * w, c))
        .map_err(|e| InferenceError::GradCamUnavailable(e.to_string()))?;
    let cam = flat.dot(&weights);

    let clipped: Vec<f32> = cam
        .iter()
        .map(|&v| if v.is_finite() { v.max(0.0) } else { 0.0 })
        .collect();
    let max = clipped.iter().copied().fold(0.0, f32::max);
    let values = if max > 0.0 && max.is_finite() {
        clipped.into_iter().map(|v| v / max).collect()
    } else {
        vec![0.0; h * w]
    };

    Ok(Heatmap {
        values,
        width: w as u32,
        height: h as u32,
    })
}

/// Blend `heatmap` (already at the image's size) over `original`.
pub fn overlay(original: &RgbImage, heatmap: &Heatmap) -> Result<RgbImage, InferenceError> {
    if (heatmap.width, heatmap.height) != original.dimensions() {
        return Err(InferenceError::GradCamUnavailable(
            "heatmap and image sizes differ".into(),
        ));
    }
    let colored = heatmap.to_colored_image();
    let mut out = original.clone();
    for (dst, heat) in out.pixels_mut().zip(colored.pixels()) {
        for (d, &h) in dst.0.iter_mut().zip(heat.0.iter()) {
            let blended = ORIGINAL_WEIGHT * f32::from(*d) + (1.0 - ORIGINAL_WEIGHT) * f32::from(h);
            *d = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, InferenceError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| InferenceError::GradCamUnavailable(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

#[derive(Debug, Clone)]
pub struct GradCamOutput {
    pub label: DiseaseLabel,
    /// Map at the probed layer's resolution.
    pub heatmap: Heatmap,
    /// Overlay PNG at the source image's size.
    pub png: Vec<u8>,
}

/// Run Grad-CAM for one model against a decoded image.
pub fn generate(model: &TrainedModel, image: &RgbImage) -> Result<GradCamOutput, InferenceError> {
    let layer = model.gradcam_layer.as_deref().ok_or_else(|| {
        InferenceError::GradCamUnavailable(format!("no probe layer for {}", model.label))
    })?;

    let input = to_model_input(image, model.classifier.input_signature())
        .map_err(|e| InferenceError::GradCamUnavailable(e.to_string()))?;
    let probe = model
        .classifier
        .gradient_probe(&input, layer, model.class_index)
        .map_err(|e| match e {
            InferenceError::GradCamUnavailable(_) => e,
            other => InferenceError::GradCamUnavailable(other.to_string()),
        })?;

    let heatmap = compute_heatmap(&probe)?;
    let (width, height) = image.dimensions();
    let full = heatmap.resize(width, height)?;
    let png = encode_png(&overlay(image, &full)?)?;

    Ok(GradCamOutput {
        label: model.label,
        heatmap,
        png,
    })
}

/// Grad-CAM for `label`'s model; unknown or unloaded labels are unavailable.
pub fn generate_for(
    registry: &ModelRegistry,
    label: DiseaseLabel,
    image: &RgbImage,
) -> Result<GradCamOutput, InferenceError> {
    let model = registry
        .get(label)
        .map_err(|e| InferenceError::GradCamUnavailable(e.to_string()))?;
    generate(model, image)
}

/// Like `generate_for`, but logs and swallows failures.
pub fn explain(registry: &ModelRegistry, label: DiseaseLabel, image: &RgbImage) -> Option<GradCamOutput> {
    match generate_for(registry, label, image) {
        Ok(out) => Some(out),
        Err(e) => {
            tracing::warn!(%label, error = %e, "Grad-CAM skipped");
            None
        }
    }
}
