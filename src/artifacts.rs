//! Model directory layout: the fitted regressor, scaler, feature schema and the
//! human-readable training summary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::error::ArtifactError;
use crate::feature_schema::FeatureSchemaRegistry;
use crate::file_utils::{self, METADATA_FILE, MODEL_FILE, SCALER_FILE};
use crate::model::{LinearNdviModel, StandardScaler, TrainerParams};

pub const TOP_FEATURE_COUNT: usize = 15;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub train_r2: f64,
    pub test_r2: f64,
    pub test_rmse: f64,
    pub test_mae: f64,
    pub cv_r2_mean: f64,
    pub cv_r2_std: f64,
}

impl TrainingMetrics {
    /// Rounds every metric to 4 decimals for reporting.
    pub fn rounded(&self) -> Self {
        let r = |v: f64| (v * 1e4).round() / 1e4;
        Self {
            train_r2: r(self.train_r2),
            test_r2: r(self.test_r2),
            test_rmse: r(self.test_rmse),
            test_mae: r(self.test_mae),
            cv_r2_mean: r(self.cv_r2_mean),
            cv_r2_std: r(self.cv_r2_std),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub name: String,
    pub importance: f64,
}

/// Summary written next to the binary artifacts as `metadata.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub target: String,
    pub n_features: usize,
    pub feature_columns: Vec<String>,
    pub n_train_samples: usize,
    pub n_test_samples: usize,
    pub metrics: TrainingMetrics,
    pub top_features: Vec<FeatureImportance>,
    pub trainer_params: TrainerParams,
    /// Where the `nitrogen_ndvi` interaction took its NDVI from during training.
    pub interaction_ndvi_source: String,
    /// How `day_of_year` was derived during training.
    pub day_of_year_source: String,
    pub trained_at: DateTime<Utc>,
}

/// The `limit` most important features, most important first. Ties keep column order.
pub fn top_features(columns: &[String], importances: &[f64], limit: usize) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = columns
        .iter()
        .zip(importances)
        .map(|(name, importance)| FeatureImportance {
            name: name.clone(),
            importance: (importance * 1e4).round() / 1e4,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked.truncate(limit);
    ranked
}

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema_registry(&self) -> FeatureSchemaRegistry {
        FeatureSchemaRegistry::in_dir(&self.dir)
    }

    pub fn save_model(&self, model: &LinearNdviModel) -> Result<(), ArtifactError> {
        self.write_binary(MODEL_FILE, model)
    }

    pub fn save_scaler(&self, scaler: &StandardScaler) -> Result<(), ArtifactError> {
        self.write_binary(SCALER_FILE, scaler)
    }

    pub fn save_metadata(&self, metadata: &ModelMetadata) -> Result<(), ArtifactError> {
        let json = serde_json::to_vec_pretty(metadata)?;
        file_utils::write_atomically(&self.dir.join(METADATA_FILE), &json)?;
        info!(dir = %self.dir.display(), "Model metadata written");
        Ok(())
    }

    pub fn load_model(&self) -> Result<Option<LinearNdviModel>, ArtifactError> {
        self.read_binary(MODEL_FILE)
    }

    pub fn load_scaler(&self) -> Result<Option<StandardScaler>, ArtifactError> {
        self.read_binary(SCALER_FILE)
    }

    pub fn load_metadata(&self) -> Result<Option<ModelMetadata>, ArtifactError> {
        file_utils::read_optional(&self.dir.join(METADATA_FILE))?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(ArtifactError::from)
    }

    fn write_binary<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ArtifactError> {
        let bytes = bincode::serialize(value)?;
        file_utils::write_atomically(&self.dir.join(name), &bytes)
    }

    fn read_binary<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ArtifactError> {
        file_utils::read_optional(&self.dir.join(name))?
            .map(|bytes| bincode::deserialize(&bytes))
            .transpose()
            .map_err(ArtifactError::from)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn metadata(columns: &[&str]) -> ModelMetadata {
        ModelMetadata {
            target: "NDVI".to_string(),
            n_features: columns.len(),
            feature_columns: columns.iter().map(|c| c.to_string()).collect(),
            n_train_samples: 8,
            n_test_samples: 2,
            metrics: TrainingMetrics {
                train_r2: 0.9,
                test_r2: 0.8,
                test_rmse: 0.05,
                test_mae: 0.04,
                cv_r2_mean: 0.75,
                cv_r2_std: 0.1,
            },
            top_features: Vec::new(),
            trainer_params: TrainerParams::default(),
            interaction_ndvi_source: "ground_truth".to_string(),
            day_of_year_source: "date".to_string(),
            trained_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
        }
    }
}
