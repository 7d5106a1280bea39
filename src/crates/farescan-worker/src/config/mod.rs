//! Configuration management for the worker
//!
//! Supports dual-location configuration:
//! - User-level: ~/.farescan/farescan.toml
//! - Project-level: ./.farescan/farescan.toml
//!
//! Project-level config overrides user-level config; environment variables
//! override both.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    LeaseSettings, LogFormat, LoggingConfig, RetrySettings, StoreFormat, StoreSettings,
    WorkerConfig, WorkerSettings,
};

use crate::Result;
use std::path::PathBuf;

/// Load configuration, reading `explicit` in place of the project-level file
/// when given.
pub async fn load_config(explicit: Option<PathBuf>) -> Result<WorkerConfig> {
    let loader = match explicit {
        Some(path) => ConfigLoader::with_explicit_path(path),
        None => ConfigLoader::new(),
    };
    loader.load().await
}
