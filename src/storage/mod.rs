//! Persistent storage
//!
//! Settings persistence and model file discovery under the application data directory.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\AIRefinery\AIRefinery`
/// - macOS: `/Users/{user}/Library/Application Support/com.AIRefinery.AIRefinery`
/// - Linux: `/home/{user}/.local/share/airefinery`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "AIRefinery", "AIRefinery")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Default location for model files
pub fn default_models_dir() -> PathBuf {
    get_data_dir()
        .map(|d| d.join("models"))
        .unwrap_or_else(|_| PathBuf::from("./models"))
}

/// Initialize the storage directory structure
///
/// Creates `{data_dir}/models/`; `settings.json` is written by the settings module.
pub fn init_storage() -> Result<PathBuf, StorageError> {
    init_storage_at(&get_data_dir()?)
}

/// Creates the storage layout under `data_dir` and returns the models directory
pub fn init_storage_at(data_dir: &Path) -> Result<PathBuf, StorageError> {
    let models_dir = data_dir.join("models");
    std::fs::create_dir_all(&models_dir)?;

    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(models_dir)
}
