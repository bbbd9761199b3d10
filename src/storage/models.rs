//! Model file discovery
//!
//! Finds GGUF model files on disk and picks the one to load.

use crate::inference::model::is_gguf_file;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Information about a GGUF model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: SystemTime,
}

impl ModelInfo {
    /// Create a ModelInfo from a file path
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        let bytes = self.size_bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Scan a directory for GGUF model files
///
/// Returns every `.gguf` file with a valid header, sorted by filename. A
/// missing directory is an empty result, not an error.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();

        if !path.is_file() || !is_gguf_file(&path) {
            continue;
        }
        match ModelInfo::from_path(path.clone()) {
            Ok(model_info) => {
                tracing::debug!("Found model: {}", model_info.filename);
                models.push(model_info);
            }
            Err(e) => {
                tracing::warn!("Failed to read model file {:?}: {}", path, e);
            }
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));

    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());

    Ok(models)
}

/// Resolves the model to load: the configured path if any, else the first
/// model found in `directory`.
pub fn find_default_model(
    configured: Option<&Path>,
    directory: &Path,
) -> Result<Option<PathBuf>, StorageError> {
    if let Some(path) = configured {
        return Ok(Some(path.to_path_buf()));
    }
    Ok(scan_models_directory(directory)?
        .into_iter()
        .next()
        .map(|model| model.path))
}
