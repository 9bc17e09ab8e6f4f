use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading the historical band and soil corpus.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Column `{0}` is missing")]
    MissingColumn(String),

    #[error("Invalid date `{value}` on row {row}")]
    InvalidDate { value: String, row: usize },

    #[error("Dataset contains no observations")]
    Empty,
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode artifact: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Failed to encode metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine a data directory")]
    NoDataDirectory,

    #[error("Invalid feature schema: {0}")]
    InvalidSchema(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Cannot fit on an empty training set")]
    EmptyTrainingSet,

    #[error("Targets ({targets}) do not match rows ({rows})")]
    TargetMismatch { rows: usize, targets: usize },
}

/// Failures of the live imagery connection. These never leave the acquisition chain.
#[derive(Error, Debug)]
pub enum ImageryError {
    #[error("Imagery access is not configured: {0}")]
    NotConfigured(String),

    #[error("Key file {path} is unreadable: {reason}")]
    KeyFile { path: PathBuf, reason: String },

    #[error("Imagery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Imagery gateway returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Training data is unusable: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Need at least {required} observations, found {found}")]
    NotEnoughObservations { required: usize, found: usize },
}

/// Errors surfaced by the request-handling operations of the service context.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model metadata not found")]
    MetadataUnavailable,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl ServiceError {
    /// Whether this condition should be reported as "service unavailable" rather than a bad request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ServiceError::ModelUnavailable(_)
                | ServiceError::MetadataUnavailable
                | ServiceError::Model(_)
        )
    }
}
