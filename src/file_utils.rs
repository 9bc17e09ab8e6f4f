use std::{
    fs,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;

use crate::error::ArtifactError;

pub const MODEL_FILE: &str = "ndvi_model.bin";
pub const SCALER_FILE: &str = "scaler.bin";
pub const SCHEMA_FILE: &str = "feature_columns.bin";
pub const METADATA_FILE: &str = "metadata.json";

pub fn data_directory() -> Result<PathBuf, ArtifactError> {
    let project_dirs =
        ProjectDirs::from("org", "agrisense", "crop-health").ok_or(ArtifactError::NoDataDirectory)?;
    Ok(project_dirs.data_local_dir().to_path_buf())
}

pub fn default_model_dir() -> Result<PathBuf, ArtifactError> {
    Ok(data_directory()?.join("model"))
}

pub fn ensure_dir(dir: &Path) -> Result<(), ArtifactError> {
    fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Writes `bytes` next to `path` and renames into place, so readers never see a torn file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes).map_err(|source| ArtifactError::Io {
        path: staging.clone(),
        source,
    })?;
    fs::rename(&staging, path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, ArtifactError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
