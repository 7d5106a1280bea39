//! Configuration loader with dual-location support
//!
//! Loads configuration from:
//! 1. Default values
//! 2. User-level config: ~/.farescan/farescan.toml
//! 3. Project-level config: ./.farescan/farescan.toml (or an explicit path)
//! 4. Environment overrides (`WORKER_CONCURRENCY`, `LOG_LEVEL`, ...)
//!
//! Later sources override earlier ones key by key, so a project file that
//! sets only `worker.concurrency` keeps every other user-level setting.

use crate::config::schema::WorkerConfig;
use crate::error::{Result, WorkerError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration loader that handles both user and project configs
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
    project_config_path: PathBuf,
    /// Whether the project-level file must exist
    explicit: bool,
    use_env: bool,
}

impl ConfigLoader {
    /// Loader for the default locations
    pub fn new() -> Self {
        Self {
            user_config_path: Self::user_config_path(),
            project_config_path: PathBuf::from(".farescan").join("farescan.toml"),
            explicit: false,
            use_env: true,
        }
    }

    /// Loader that reads `path` in place of the project-level file.
    ///
    /// Unlike the default location, an explicit file must exist.
    pub fn with_explicit_path(path: impl Into<PathBuf>) -> Self {
        Self {
            project_config_path: path.into(),
            explicit: true,
            ..Self::new()
        }
    }

    /// Loader over arbitrary locations without environment overrides
    pub fn with_paths(user: Option<PathBuf>, project: PathBuf) -> Self {
        Self {
            user_config_path: user,
            project_config_path: project,
            explicit: false,
            use_env: false,
        }
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".farescan").join("farescan.toml"))
    }

    pub fn get_user_config_path(&self) -> Option<&Path> {
        self.user_config_path.as_deref()
    }

    pub fn get_project_config_path(&self) -> &Path {
        &self.project_config_path
    }

    /// Load, merge, override and validate
    pub async fn load(&self) -> Result<WorkerConfig> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        if let Some(user_path) = &self.user_config_path {
            if let Some(user) = Self::read_toml(user_path).await? {
                debug!(path = %user_path.display(), "Loaded user-level config");
                merge_values(&mut merged, user);
            }
        }

        match Self::read_toml(&self.project_config_path).await? {
            Some(project) => {
                debug!(path = %self.project_config_path.display(), "Loaded project-level config");
                merge_values(&mut merged, project);
            }
            None if self.explicit => {
                return Err(WorkerError::Config(format!(
                    "Config file not found: {}",
                    self.project_config_path.display()
                )));
            }
            None => {}
        }

        let mut config: WorkerConfig = merged
            .try_into()
            .map_err(|e| WorkerError::Config(format!("Failed to parse config: {}", e)))?;

        if self.use_env {
            config.apply_env_overrides()?;
        }
        config.validate()?;

        info!(
            concurrency = config.worker.concurrency,
            checkpoint_interval = config.worker.checkpoint_interval,
            "Configuration loaded"
        );
        Ok(config)
    }

    async fn read_toml(path: &Path) -> Result<Option<toml::Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| WorkerError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let value = toml::from_str(&content)
            .map_err(|e| WorkerError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(Some(value))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, anything else replaces.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
