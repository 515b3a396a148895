use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Application-level constants
pub const APP_NAME: &str = "ChestCare";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default bind address for the HTTP API.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";

/// Maximum accepted upload size for a single X-ray (50 MB).
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Model manifest file name inside the models directory.
pub const MODEL_MANIFEST_FILE: &str = "models.json";

const ENV_HOME: &str = "CHESTCARE_HOME";
const ENV_MODELS_DIR: &str = "CHESTCARE_MODELS_DIR";
const ENV_BIND: &str = "CHESTCARE_BIND";
const ENV_DB: &str = "CHESTCARE_DB";

/// Default `tracing` filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,chestcare_lib=debug"
}

/// Get the application data directory.
/// `$CHESTCARE_HOME` when set, otherwise ~/ChestCare/.
pub fn app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_HOME) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Get the models directory (one classifier file per disease label).
pub fn models_dir() -> PathBuf {
    std::env::var_os(ENV_MODELS_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| app_data_dir().join("models"))
}

/// Get the media directory (uploaded X-rays and rendered heatmaps).
pub fn media_dir() -> PathBuf {
    app_data_dir().join("media")
}

/// Get the prediction database path.
pub fn database_path() -> PathBuf {
    std::env::var_os(ENV_DB)
        .map(PathBuf::from)
        .unwrap_or_else(|| app_data_dir().join("chestcare.db"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid bind address '{value}': {reason}")]
    InvalidBindAddr { value: String, reason: String },
}

/// Resolved runtime configuration for the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub media_dir: PathBuf,
    pub db_path: PathBuf,
    pub max_upload_bytes: usize,
}

impl ServiceConfig {
    /// Build configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = std::env::var(ENV_BIND).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidBindAddr {
                value: bind.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            bind_addr,
            data_dir: app_data_dir(),
            models_dir: models_dir(),
            media_dir: media_dir(),
            db_path: database_path(),
            max_upload_bytes: MAX_UPLOAD_BYTES,
        })
    }

    /// Configuration rooted at an arbitrary directory (tests, embedding).
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            data_dir: root.to_path_buf(),
            models_dir: root.join("models"),
            media_dir: root.join("media"),
            db_path: root.join("chestcare.db"),
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }

    /// Path of the optional model manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.models_dir.join(MODEL_MANIFEST_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_keeps_everything_under_root() {
        let root = Path::new("/tmp/chestcare-test");
        let cfg = ServiceConfig::rooted_at(root);
        assert!(cfg.models_dir.starts_with(root));
        assert!(cfg.media_dir.starts_with(root));
        assert!(cfg.db_path.starts_with(root));
        assert_eq!(cfg.manifest_path(), root.join("models").join("models.json"));
    }

    #[test]
    fn default_bind_addr_parses() {
        assert!(DEFAULT_BIND_ADDR.parse::<SocketAddr>().is_ok());
    }

    #[test]
    fn app_name_is_chestcare() {
        assert_eq!(APP_NAME, "ChestCare");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
