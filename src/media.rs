//! On-disk storage for uploaded X-rays and rendered Grad-CAM overlays.
//!
//! Paths stored in the database are relative to the media root, e.g.
//! `xray_uploads/<uuid>.png` and `gradcam_uploads/gradcam_<id>_<label>.png`.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::models::DiseaseLabel;

pub const XRAY_DIR: &str = "xray_uploads";
pub const GRADCAM_DIR: &str = "gradcam_uploads";

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid media path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the upload directories.
    pub fn ensure_dirs(&self) -> Result<(), MediaError> {
        std::fs::create_dir_all(self.root.join(XRAY_DIR))?;
        std::fs::create_dir_all(self.root.join(GRADCAM_DIR))?;
        Ok(())
    }

    /// Store an uploaded image under a fresh name; returns its relative path.
    pub fn save_upload(&self, bytes: &[u8]) -> Result<String, MediaError> {
        let ext = image::guess_format(bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin");
        let relative = format!("{XRAY_DIR}/{}.{ext}", Uuid::new_v4());
        self.write(&relative, bytes)?;
        Ok(relative)
    }

    pub fn gradcam_path(prediction_id: i64, label: DiseaseLabel) -> String {
        format!("{GRADCAM_DIR}/gradcam_{prediction_id}_{label}.png")
    }

    /// Write (or overwrite) the overlay for a prediction and label.
    pub fn save_gradcam(
        &self,
        prediction_id: i64,
        label: DiseaseLabel,
        png: &[u8],
    ) -> Result<String, MediaError> {
        let relative = Self::gradcam_path(prediction_id, label);
        self.write(&relative, png)?;
        Ok(relative)
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>, MediaError> {
        Ok(std::fs::read(self.resolve(relative)?)?)
    }

    /// Delete a stored file; missing files are not an error.
    pub fn remove(&self, relative: &str) -> Result<(), MediaError> {
        match std::fs::remove_file(self.resolve(relative)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Absolute path for a stored relative path. Rejects escapes from the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, MediaError> {
        let path = Path::new(relative);
        let safe = !relative.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(MediaError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn write(&self, relative: &str, bytes: &[u8]) -> Result<(), MediaError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        tracing::debug!(path = %relative, bytes = bytes.len(), "Media file written");
        Ok(())
    }
}
