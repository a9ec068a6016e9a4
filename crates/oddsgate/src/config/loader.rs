//! Configuration loading and merging logic.

use std::path::PathBuf;

use crate::error::ConfigError;

use super::{Config, Settings};

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Skip `ODDSGATE_*` environment overrides.
    pub ignore_env: bool,
}

/// Resolve settings: defaults, then the config file, then the environment.
///
/// An explicit `config_path` must load; a discovered file that fails to
/// parse is logged and skipped.
pub async fn load_settings(options: &LoadOptions) -> Result<(Settings, Config), ConfigError> {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings)?;

    if let Some(ref path) = config.source_path {
        tracing::debug!("Loaded configuration from {}", path.display());
    }

    if !options.ignore_env {
        settings = settings.with_env_overrides();
    }

    Ok((settings, config))
}
