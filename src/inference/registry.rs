//! Model registry: one trained classifier per disease label.
//!
//! Built once at startup from the models directory and shared read-only.
//! Load failures never abort the process; they are logged and kept as
//! per-label status for the diagnostics endpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::classifier::{DiseaseClassifier, NativeClassifier};
use super::InferenceError;
use crate::models::DiseaseLabel;

// ═══════════════════════════════════════════════════════════
// Manifest
// ═══════════════════════════════════════════════════════════

/// Optional `models.json` in the models directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelManifest {
    #[serde(default)]
    pub models: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub label: DiseaseLabel,
    /// Relative to the models directory unless absolute.
    pub file: String,
    /// Layer to probe for Grad-CAM; overrides the graph walk.
    #[serde(default)]
    pub conv_layer: Option<String>,
    /// Output entry that scores this label.
    #[serde(default)]
    pub class_index: usize,
    /// ONNX only: output holding dScore/dActivations for `conv_layer`.
    #[serde(default)]
    pub gradient_output: Option<String>,
    /// ONNX only: `[height, width]` of the model input.
    #[serde(default)]
    pub input_size: Option<[u32; 2]>,
}

impl ManifestEntry {
    /// Entry used when the manifest is absent or does not mention `label`.
    pub fn default_for(label: DiseaseLabel, models_dir: &Path) -> Self {
        let stem = label.model_stem();
        let json = format!("{stem}.json");
        let onnx = format!("{stem}.onnx");
        let file = if cfg!(feature = "onnx")
            && !models_dir.join(&json).exists()
            && models_dir.join(&onnx).exists()
        {
            onnx
        } else {
            json
        };
        Self {
            label,
            file,
            conv_layer: None,
            class_index: 0,
            gradient_output: None,
            input_size: None,
        }
    }

    pub fn resolve_path(&self, models_dir: &Path) -> PathBuf {
        let file = Path::new(&self.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            models_dir.join(file)
        }
    }
}

impl ModelManifest {
    /// Read the manifest; missing means defaults, malformed is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read model manifest, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed model manifest, using defaults");
                Self::default()
            }
        }
    }

    pub fn entry_for(&self, label: DiseaseLabel, models_dir: &Path) -> ManifestEntry {
        self.models
            .iter()
            .find(|e| e.label == label)
            .cloned()
            .unwrap_or_else(|| ManifestEntry::default_for(label, models_dir))
    }
}

/// Open a classifier file, picking the backend by extension.
#[cfg_attr(not(feature = "onnx"), allow(unused_variables))]
pub fn load_classifier(
    path: &Path,
    entry: &ManifestEntry,
) -> Result<Box<dyn DiseaseClassifier>, InferenceError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "json" => Ok(Box::new(NativeClassifier::load(path)?)),
        #[cfg(feature = "onnx")]
        "onnx" => {
            let [height, width] = entry.input_size.ok_or_else(|| InferenceError::ModelLoadFailure {
                path: path.to_path_buf(),
                reason: "ONNX models need `input_size` in the manifest".into(),
            })?;
            Ok(Box::new(super::onnx::OnnxClassifier::load(
                path,
                super::InputSignature { height, width },
                entry.gradient_output.clone(),
            )?))
        }
        #[cfg(not(feature = "onnx"))]
        "onnx" => Err(InferenceError::ModelLoadFailure {
            path: path.to_path_buf(),
            reason: "built without the `onnx` feature".into(),
        }),
        other => Err(InferenceError::ModelLoadFailure {
            path: path.to_path_buf(),
            reason: format!("unsupported model format '{other}'"),
        }),
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

pub struct TrainedModel {
    pub label: DiseaseLabel,
    pub classifier: Box<dyn DiseaseClassifier>,
    /// `None` when Grad-CAM is unavailable for this model.
    pub gradcam_layer: Option<String>,
    pub class_index: usize,
    pub source: PathBuf,
}

impl std::fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainedModel")
            .field("label", &self.label)
            .field("gradcam_layer", &self.gradcam_layer)
            .field("class_index", &self.class_index)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl TrainedModel {
    /// Wrap a classifier and settle which layer Grad-CAM probes.
    ///
    /// An explicit layer wins when the model has it; otherwise the last
    /// convolution found by the graph walk.
    pub fn new(
        label: DiseaseLabel,
        classifier: Box<dyn DiseaseClassifier>,
        explicit_layer: Option<&str>,
        class_index: usize,
        source: PathBuf,
    ) -> Self {
        let gradcam_layer = match explicit_layer {
            Some(layer) if classifier.has_layer(layer) => Some(layer.to_string()),
            Some(layer) => {
                tracing::warn!(%label, layer, "Configured Grad-CAM layer not found in model");
                None
            }
            None => classifier.last_conv_layer(),
        };
        if gradcam_layer.is_none() {
            tracing::warn!(%label, "No convolution layer found, Grad-CAM disabled for this model");
        }
        Self {
            label,
            classifier,
            gradcam_layer,
            class_index,
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub label: DiseaseLabel,
    pub display_name: &'static str,
    pub loaded: bool,
    pub path_exists: bool,
    pub model_path: String,
    pub gradcam_layer: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ModelRegistry {
    models: BTreeMap<DiseaseLabel, TrainedModel>,
    statuses: Vec<ModelStatus>,
    models_dir: PathBuf,
}

impl ModelRegistry {
    /// Load every label's model. Never fails; see `statuses()` for what went wrong.
    pub fn load(models_dir: &Path, manifest_path: &Path) -> Self {
        let manifest = ModelManifest::load_or_default(manifest_path);
        let mut models = BTreeMap::new();
        let mut statuses = Vec::with_capacity(DiseaseLabel::ALL.len());

        for &label in DiseaseLabel::ALL {
            let entry = manifest.entry_for(label, models_dir);
            let path = entry.resolve_path(models_dir);
            let path_exists = path.exists();

            let (gradcam_layer, error) = match load_classifier(&path, &entry) {
                Ok(classifier) => {
                    let model = TrainedModel::new(
                        label,
                        classifier,
                        entry.conv_layer.as_deref(),
                        entry.class_index,
                        path.clone(),
                    );
                    tracing::info!(
                        %label,
                        path = %path.display(),
                        gradcam_layer = model.gradcam_layer.as_deref().unwrap_or("-"),
                        "Model loaded"
                    );
                    let layer = model.gradcam_layer.clone();
                    models.insert(label, model);
                    (layer, None)
                }
                Err(e) => {
                    tracing::warn!(%label, path = %path.display(), error = %e, "Model not loaded");
                    (None, Some(e.to_string()))
                }
            };

            statuses.push(ModelStatus {
                label,
                display_name: label.display_name(),
                loaded: error.is_none(),
                path_exists,
                model_path: path.display().to_string(),
                gradcam_layer,
                error,
            });
        }

        tracing::info!(
            loaded = models.len(),
            total = DiseaseLabel::ALL.len(),
            models_dir = %models_dir.display(),
            "Model registry ready"
        );

        Self {
            models,
            statuses,
            models_dir: models_dir.to_path_buf(),
        }
    }

    /// Registry over already-built models.
    pub fn from_models(models: Vec<TrainedModel>) -> Self {
        let models: BTreeMap<_, _> = models.into_iter().map(|m| (m.label, m)).collect();
        let statuses = DiseaseLabel::ALL
            .iter()
            .map(|&label| {
                let model = models.get(&label);
                ModelStatus {
                    label,
                    display_name: label.display_name(),
                    loaded: model.is_some(),
                    path_exists: model.is_some_and(|m| m.source.exists()),
                    model_path: model
                        .map(|m| m.source.display().to_string())
                        .unwrap_or_default(),
                    gradcam_layer: model.and_then(|m| m.gradcam_layer.clone()),
                    error: model.is_none().then(|| "not provided".to_string()),
                }
            })
            .collect();
        Self {
            models,
            statuses,
            models_dir: PathBuf::new(),
        }
    }

    pub fn empty() -> Self {
        Self::from_models(Vec::new())
    }

    pub fn get(&self, label: DiseaseLabel) -> Result<&TrainedModel, InferenceError> {
        self.models
            .get(&label)
            .ok_or(InferenceError::ModelNotLoaded(label))
    }

    /// Loaded models in label order.
    pub fn iter(&self) -> impl Iterator<Item = &TrainedModel> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn loaded_labels(&self) -> Vec<DiseaseLabel> {
        self.models.keys().copied().collect()
    }

    pub fn statuses(&self) -> &[ModelStatus] {
        &self.statuses
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }
}
