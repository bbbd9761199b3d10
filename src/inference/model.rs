//! Model handle
//!
//! Owns the loaded model for the lifetime of the service and validates model
//! files before they reach the backend.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::inference::backend::InferenceBackend;
use crate::inference::engine::EngineError;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Errors found while validating a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
///
/// # Arguments
/// * `path` - Path to the GGUF file
///
/// # Returns
/// * `Ok(GgufMetadata)` - Metadata extracted from valid GGUF file
/// * `Err(ModelError)` - If the file is not a valid GGUF file
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(&mut file)?;
    let metadata_kv_count = read_u64(&mut file)?;

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_u32(file: &mut File) -> Result<u32, ModelError> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> Result<u64, ModelError> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Checks if a file appears to be a GGUF model file based on extension and magic bytes.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();

    let has_extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);

    has_extension && validate_gguf(path).is_ok()
}

/// Facts reported by the backend about a loaded model. Zero means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMetadata {
    pub vocab_size: usize,
    /// Context length the model was trained with
    pub context_length: u32,
    pub param_count: u64,
    pub size_bytes: u64,
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: PathBuf,
    pub metadata: ModelMetadata,
}

/// The loaded model, shared read-only by every session.
///
/// Created once by the worker thread and released at shutdown. Releasing is
/// idempotent; a handle that was never loaded simply has nothing to free.
pub struct ModelHandle<B> {
    backend: Option<B>,
    info: LoadedModelInfo,
}

impl<B: InferenceBackend> ModelHandle<B> {
    /// Loads the model at `path`.
    ///
    /// A missing path is reported as [`EngineError::Load`] before the backend
    /// is asked to do anything.
    pub fn load<P: AsRef<Path>>(path: P, options: &B::Options) -> Result<Self, EngineError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(EngineError::Load(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let backend = B::load(path, options)?;
        let info = LoadedModelInfo {
            path: path.to_path_buf(),
            metadata: backend.metadata(),
        };

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            info.path.display(),
            info.metadata.param_count,
            info.metadata.vocab_size,
            info.metadata.context_length
        );

        Ok(Self {
            backend: Some(backend),
            info,
        })
    }

    /// The loaded backend, or `NotInitialized` once released
    pub fn backend(&self) -> Result<&B, EngineError> {
        self.backend.as_ref().ok_or(EngineError::NotInitialized)
    }

    pub fn info(&self) -> &LoadedModelInfo {
        &self.info
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    /// Frees the model. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.backend.take().is_some() {
            tracing::info!("Model released: {}", self.info.path.display());
        }
    }
}
