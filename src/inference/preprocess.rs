//! Image decoding and model input preparation.
//!
//! Uploads are decoded once per request; the decoded RGB image is then
//! resized separately for each model's input signature.

use std::borrow::Cow;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;

use super::classifier::InputSignature;
use super::InferenceError;
use crate::config::MAX_UPLOAD_BYTES;

/// Validate image bytes before decoding.
pub fn validate_image_bytes(bytes: &[u8], max_bytes: usize) -> Result<(), InferenceError> {
    if bytes.is_empty() {
        return Err(InferenceError::PreprocessFailure("empty image upload".into()));
    }
    if bytes.len() > max_bytes {
        return Err(InferenceError::PreprocessFailure(format!(
            "image exceeds {}MB limit",
            max_bytes / (1024 * 1024)
        )));
    }
    Ok(())
}

/// Decode any supported format into a 3-channel image.
///
/// Grayscale, palette and alpha images are converted to RGB.
pub fn decode_image(bytes: &[u8], max_bytes: usize) -> Result<RgbImage, InferenceError> {
    validate_image_bytes(bytes, max_bytes)?;
    let img = image::load_from_memory(bytes)
        .map_err(|e| InferenceError::PreprocessFailure(format!("failed to decode image: {e}")))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(InferenceError::PreprocessFailure("image has no pixels".into()));
    }
    Ok(img.to_rgb8())
}

/// Resize to the model's input size and scale to `[0, 1]`, shape `(1, h, w, 3)`.
pub fn to_model_input(image: &RgbImage, signature: InputSignature) -> Result<Array4<f32>, InferenceError> {
    let InputSignature { height, width } = signature;
    if height == 0 || width == 0 {
        return Err(InferenceError::PreprocessFailure(format!(
            "invalid model input size {width}x{height}"
        )));
    }

    let resized: Cow<'_, RgbImage> = if image.dimensions() == (width, height) {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(image::imageops::resize(image, width, height, FilterType::CatmullRom))
    };

    let pixels: Vec<f32> = resized.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
    Array4::from_shape_vec((1, height as usize, width as usize, 3), pixels)
        .map_err(|e| InferenceError::PreprocessFailure(e.to_string()))
}

/// Decode and prepare in one step, with the default upload limit.
pub fn preprocess(bytes: &[u8], signature: InputSignature) -> Result<Array4<f32>, InferenceError> {
    let image = decode_image(bytes, MAX_UPLOAD_BYTES)?;
    to_model_input(&image, signature)
}
