use std::path::Path;

use ndarray::{Array2, Array3, Array4, Axis, Ix4};

use super::network::Network;
use super::InferenceError;

/// Spatial input size a classifier expects (channels are always RGB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSignature {
    pub height: u32,
    pub width: u32,
}

/// Activations of the probed layer and dScore/dActivations, single sample.
#[derive(Debug, Clone)]
pub struct GradientProbe {
    /// `(h, w, channels)`
    pub activations: Array3<f32>,
    /// Same shape as `activations`.
    pub gradients: Array3<f32>,
    /// Model output row for the probed sample.
    pub output: Vec<f32>,
}

/// One trained per-disease classifier.
///
/// Implementations must be safe to call from several blocking tasks at once.
pub trait DiseaseClassifier: Send + Sync {
    fn input_signature(&self) -> InputSignature;

    /// Forward pass on a `(1, h, w, 3)` batch; returns the output row.
    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;

    /// Last convolution-like layer found by walking the layer graph.
    fn last_conv_layer(&self) -> Option<String>;

    fn has_layer(&self, name: &str) -> bool;

    /// Gradient of output entry `class_index` w.r.t. the activations of `layer`.
    fn gradient_probe(
        &self,
        input: &Array4<f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<GradientProbe, InferenceError>;
}

/// Classifier backed by the crate's own layer graph runtime.
pub struct NativeClassifier {
    network: Network,
}

impl NativeClassifier {
    /// Load a JSON model file and run one warm-up pass on a zero image.
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        if !path.exists() {
            return Err(InferenceError::ModelNotFound(path.to_path_buf()));
        }
        let network = Network::load(path)?;
        let classifier = Self::from_network(network).map_err(|e| InferenceError::ModelLoadFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::debug!(
            model = %classifier.network.name,
            path = %path.display(),
            "Native classifier loaded"
        );
        Ok(classifier)
    }

    pub fn from_network(network: Network) -> Result<Self, InferenceError> {
        let input = network.input();
        if input.channels != 3 {
            return Err(InferenceError::Forward(format!(
                "expected a 3-channel input, model declares {}",
                input.channels
            )));
        }
        if network.outputs() == 0 {
            return Err(InferenceError::Forward("model has no outputs".into()));
        }
        let classifier = Self { network };
        let sig = classifier.input_signature();
        let warmup = Array4::<f32>::zeros((1, sig.height as usize, sig.width as usize, 3));
        classifier.predict(&warmup)?;
        Ok(classifier)
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl DiseaseClassifier for NativeClassifier {
    fn input_signature(&self) -> InputSignature {
        let input = self.network.input();
        InputSignature {
            height: input.height as u32,
            width: input.width as u32,
        }
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let out = self.network.forward(&input.clone().into_dyn())?;
        first_row(out)
    }

    fn last_conv_layer(&self) -> Option<String> {
        self.network.find_last_conv_layer().map(str::to_owned)
    }

    fn has_layer(&self, name: &str) -> bool {
        self.network.contains_layer(name)
    }

    fn gradient_probe(
        &self,
        input: &Array4<f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<GradientProbe, InferenceError> {
        let leaf = self
            .network
            .probe_leaf(layer)
            .ok_or_else(|| InferenceError::GradCamUnavailable(format!("layer '{layer}' not in model")))?;

        let (out, tape) = self.network.forward_recorded(&input.clone().into_dyn())?;
        let output = first_row(out.clone())?;
        let index = output_index(class_index, output.len())?;

        let mut seed = Array2::<f32>::zeros((1, output.len()));
        seed[[0, index]] = 1.0;
        let (activations, gradients) = tape
            .gradient_wrt(leaf, seed.into_dyn())?
            .ok_or_else(|| {
                InferenceError::GradCamUnavailable(format!("layer '{layer}' is disconnected from the output"))
            })?;

        let activations = activations
            .into_dimensionality::<Ix4>()
            .map_err(|_| InferenceError::GradCamUnavailable(format!("layer '{layer}' is not spatial")))?;
        let gradients = gradients.into_dimensionality::<Ix4>()?;

        Ok(GradientProbe {
            activations: activations.index_axis_move(Axis(0), 0),
            gradients: gradients.index_axis_move(Axis(0), 0),
            output,
        })
    }
}

/// Output entry a Grad-CAM probe differentiates. Binary models expose a
/// single scalar, which is used whatever `class_index` says.
pub(crate) fn output_index(class_index: usize, outputs: usize) -> Result<usize, InferenceError> {
    match outputs {
        1 => Ok(0),
        n if class_index < n => Ok(class_index),
        n => Err(InferenceError::GradCamUnavailable(format!(
            "output index {class_index} out of range for {n} outputs"
        ))),
    }
}

/// First sample of a `(N, k)` output.
pub(crate) fn first_row(out: ndarray::ArrayD<f32>) -> Result<Vec<f32>, InferenceError> {
    if out.ndim() == 0 || out.shape()[0] == 0 {
        return Err(InferenceError::Forward("empty model output".into()));
    }
    Ok(out.index_axis(Axis(0), 0).iter().copied().collect())
}
