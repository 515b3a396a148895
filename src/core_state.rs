//! Shared service state: configuration, the model registry and media storage.
//!
//! Built once at startup and wrapped in `Arc`; every request handler gets a
//! cheap clone. Database connections are opened per request.

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::db;
use crate::inference::ModelRegistry;
use crate::media::{MediaError, MediaStore};

pub struct CoreState {
    pub config: ServiceConfig,
    /// Immutable after startup; no reload path.
    pub registry: Arc<ModelRegistry>,
    pub media: MediaStore,
}

impl CoreState {
    pub fn new(config: ServiceConfig, registry: ModelRegistry) -> Self {
        let media = MediaStore::new(config.media_dir.clone());
        Self {
            config,
            registry: Arc::new(registry),
            media,
        }
    }

    /// Prepare the data directories and the database schema.
    pub fn initialize(&self) -> Result<(), CoreError> {
        std::fs::create_dir_all(&self.config.data_dir).map_err(MediaError::from)?;
        self.media.ensure_dirs()?;
        // Opening runs pending migrations.
        self.open_db()?;
        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            db = %self.config.db_path.display(),
            models_loaded = self.registry.len(),
            "Core state initialized"
        );
        Ok(())
    }

    /// Open a database connection for one request.
    pub fn open_db(&self) -> Result<rusqlite::Connection, CoreError> {
        db::open_database(&self.config.db_path).map_err(CoreError::Database)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] db::DatabaseError),
    #[error("Media storage error: {0}")]
    Media(#[from] MediaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_creates_layout_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let core = CoreState::new(ServiceConfig::rooted_at(dir.path()), ModelRegistry::empty());
        core.initialize().unwrap();

        assert!(dir.path().join("media").join("xray_uploads").is_dir());
        assert!(dir.path().join("media").join("gradcam_uploads").is_dir());
        let conn = core.open_db().unwrap();
        assert_eq!(db::count_tables(&conn).unwrap(), 3);
    }
}
