use std::{path::Path, sync::Arc, time::Instant};

use tracing::info;

use config::ServiceConfig;
use error::TrainingError;
use service::ServiceContext;
use training::TrainingOptions;

pub mod acquisition;
pub mod artifacts;
pub mod bands;
pub mod config;
pub mod error;
pub mod feature_schema;
pub mod feature_transform;
mod file_utils;
pub mod historical;
pub mod imagery;
pub mod model;
pub mod score;
pub mod service;
pub mod training;

/// Trains on the historical band and soil exports and writes the artifacts into the
/// configured model directory.
pub fn train_model(
    bands_csv: &Path,
    soil_csv: &Path,
    config: &ServiceConfig,
    options: &TrainingOptions,
) -> Result<artifacts::ModelMetadata, TrainingError> {
    let start_time = Instant::now();
    let model_dir = config.resolve_model_dir()?;
    let metadata = training::train(bands_csv, soil_csv, &model_dir, options)?;
    info!(elapsed = ?start_time.elapsed(), "Training finished");
    Ok(metadata)
}

/// Loads whatever artifacts exist and returns the shared, read-only service context.
pub fn start_service(config: &ServiceConfig) -> Arc<ServiceContext> {
    let start_time = Instant::now();
    let context = Arc::new(ServiceContext::from_config(config));
    info!(elapsed = ?start_time.elapsed(), "Service context ready");
    context
}
