//! ONNX Runtime backend, behind the `onnx` feature.
//!
//! ONNX graphs carry no autodiff, so Grad-CAM needs a model exported with
//! two extra outputs: the probe layer's activations (named by the manifest's
//! `conv_layer`) and the gradient of the class score w.r.t. them (named by
//! `gradient_output`). Without those outputs the model still predicts.

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array3, Array4};
use ort::session::Session;

use super::classifier::{output_index, DiseaseClassifier, GradientProbe, InputSignature};
use super::InferenceError;

pub struct OnnxClassifier {
    /// `Session::run` needs `&mut self`; the trait exposes `&self`.
    session: Mutex<Session>,
    signature: InputSignature,
    output_names: Vec<String>,
    gradient_output: Option<String>,
}

impl OnnxClassifier {
    pub fn load(
        path: &Path,
        signature: InputSignature,
        gradient_output: Option<String>,
    ) -> Result<Self, InferenceError> {
        if !path.exists() {
            return Err(InferenceError::ModelNotFound(path.to_path_buf()));
        }
        let fail = |reason: String| InferenceError::ModelLoadFailure {
            path: path.to_path_buf(),
            reason,
        };
        let session = Session::builder()
            .map_err(|e: ort::Error| fail(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e: ort::Error| fail(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e: ort::Error| fail(format!("ONNX load failed: {e}")))?;

        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        tracing::info!(path = %path.display(), "ONNX classifier loaded");

        Ok(Self {
            session: Mutex::new(session),
            signature,
            output_names,
            gradient_output,
        })
    }

    /// Run the session and copy out the requested outputs (index 0 is the score row).
    fn run(&self, input: &Array4<f32>, wanted: &[&str]) -> Result<Vec<(Vec<i64>, Vec<f32>)>, InferenceError> {
        use ort::value::TensorRef;

        let input = input.as_standard_layout();
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| InferenceError::Forward(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::Forward("Session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| InferenceError::Forward(format!("ONNX inference failed: {e}")))?;

        let mut extracted = Vec::with_capacity(wanted.len() + 1);
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Forward(format!("Output extraction: {e}")))?;
        extracted.push((shape.to_vec(), data.to_vec()));
        for name in wanted {
            let (shape, data) = outputs[*name]
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::GradCamUnavailable(format!("output '{name}': {e}")))?;
            extracted.push((shape.to_vec(), data.to_vec()));
        }
        Ok(extracted)
    }
}

fn to_hwc(shape: &[i64], data: Vec<f32>) -> Result<Array3<f32>, InferenceError> {
    match shape {
        [1, h, w, c] => Array3::from_shape_vec((*h as usize, *w as usize, *c as usize), data)
            .map_err(|e| InferenceError::GradCamUnavailable(e.to_string())),
        other => Err(InferenceError::GradCamUnavailable(format!(
            "expected (1, h, w, c) probe output, got {other:?}"
        ))),
    }
}

impl DiseaseClassifier for OnnxClassifier {
    fn input_signature(&self) -> InputSignature {
        self.signature
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let mut outputs = self.run(input, &[])?;
        let (_, scores) = outputs.remove(0);
        if scores.is_empty() {
            return Err(InferenceError::Forward("empty model output".into()));
        }
        Ok(scores)
    }

    /// ONNX graphs are opaque; the probe layer must come from the manifest.
    fn last_conv_layer(&self) -> Option<String> {
        None
    }

    fn has_layer(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }

    fn gradient_probe(
        &self,
        input: &Array4<f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<GradientProbe, InferenceError> {
        let gradient_output = self.gradient_output.as_deref().ok_or_else(|| {
            InferenceError::GradCamUnavailable("model exports no gradient output".into())
        })?;
        if !self.has_layer(layer) || !self.has_layer(gradient_output) {
            return Err(InferenceError::GradCamUnavailable(format!(
                "model does not export '{layer}' and '{gradient_output}'"
            )));
        }

        let mut outputs = self.run(input, &[layer, gradient_output])?.into_iter();
        let (Some((_, output)), Some((act_shape, act)), Some((grad_shape, grad))) =
            (outputs.next(), outputs.next(), outputs.next())
        else {
            return Err(InferenceError::GradCamUnavailable("missing probe outputs".into()));
        };
        output_index(class_index, output.len())?;

        let activations = to_hwc(&act_shape, act)?;
        let gradients = to_hwc(&grad_shape, grad)?;
        if activations.dim() != gradients.dim() {
            return Err(InferenceError::GradCamUnavailable(
                "activation and gradient shapes differ".into(),
            ));
        }
        Ok(GradientProbe { activations, gradients, output })
    }
}
