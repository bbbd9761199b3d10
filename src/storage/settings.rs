//! Settings storage
//!
//! Manages persistence of generation defaults and service configuration.

use crate::inference::params::{GenerationParams, ThreadPolicy};
use crate::prompt::EXAONE_SYSTEM_PROMPT;
use crate::storage::{default_models_dir, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default tracing filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "airefinery=info";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Model to load; the first model in `models_directory` when unset
    pub model_path: Option<PathBuf>,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Defaults for every generation request
    pub generation: GenerationParams,
    /// Worker thread-count policy
    pub threads: ThreadPolicy,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// System prompt for the chat template
    pub system_prompt: String,
    /// tracing `EnvFilter` directive
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: None,
            models_directory: default_models_dir(),
            generation: GenerationParams::default(),
            threads: ThreadPolicy::default(),
            gpu_layers: 0,
            system_prompt: EXAONE_SYSTEM_PROMPT.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Settings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        self.generation.validate();
        self.threads.validate();

        if self.generation.max_tokens == 0 {
            self.generation.max_tokens = GenerationParams::default().max_tokens;
        }

        if self.log_filter.trim().is_empty() {
            self.log_filter = DEFAULT_LOG_FILTER.to_string();
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> Settings {
    match get_settings_path().and_then(|path| load_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    }
}

/// Loads and validates settings from `path`. A missing file yields defaults.
pub fn load_from(path: &Path) -> Result<Settings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Writes default settings to `path` unless a file is already there.
///
/// `force` overwrites an existing file. Returns whether anything was written.
pub fn init_settings(path: &Path, force: bool) -> Result<bool, StorageError> {
    if path.exists() && !force {
        tracing::info!("Keeping existing settings at {}", path.display());
        return Ok(false);
    }
    save_to(&Settings::default(), path)?;
    Ok(true)
}

/// Writes `settings` to `path` as pretty JSON, creating parent directories.
pub fn save_to(settings: &Settings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
