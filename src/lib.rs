pub mod api; // HTTP surface
pub mod config;
pub mod core_state; // Shared service state
pub mod db;
pub mod inference; // Classifier runtime, ensemble, Grad-CAM
pub mod media;
pub mod models;
pub mod workflow; // Upload -> prediction record -> heatmap

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Core(#[from] core_state::CoreError),
    #[error(transparent)]
    Server(#[from] api::ServerError),
    #[error("Model loading task failed: {0}")]
    ModelLoad(#[from] tokio::task::JoinError),
    #[error("Signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// Start the service and block until Ctrl-C.
pub async fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let cfg = config::ServiceConfig::from_env()?;

    // Model files can be large; load them off the async runtime.
    let models_dir = cfg.models_dir.clone();
    let manifest = cfg.manifest_path();
    let registry = tokio::task::spawn_blocking(move || {
        inference::ModelRegistry::load(&models_dir, &manifest)
    })
    .await?;
    if registry.is_empty() {
        tracing::warn!(
            models_dir = %cfg.models_dir.display(),
            "No disease models loaded; predictions will fail until models are installed"
        );
    }

    let bind_addr = cfg.bind_addr;
    let core = std::sync::Arc::new(core_state::CoreState::new(cfg, registry));
    core.initialize()?;

    let mut server = api::start_api_server(core, bind_addr).await?;
    tracing::info!(addr = %server.session.server_addr, "Listening");

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    server.wait().await;

    tracing::info!("{} stopped", config::APP_NAME);
    Ok(())
}
