//! Request handling on top of the loaded artifacts.
//!
//! [`ServiceContext`] is built once at startup and never mutated afterwards; share it
//! behind an [`Arc`]. Missing artifacts degrade the context instead of failing startup:
//! model-dependent operations then answer with [`ServiceError::ModelUnavailable`],
//! while band acquisition keeps working.

use std::{
    path::Path,
    sync::{mpsc, Arc},
};

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;
use tracing::{debug, info, warn};

use crate::acquisition::{
    AcquisitionChain, AcquisitionRequest, AcquisitionResult, Polygon, Provenance, Source,
};
use crate::artifacts::{ArtifactStore, FeatureImportance, ModelMetadata, TrainingMetrics};
use crate::bands::{BandSample, SoilSample};
use crate::config::ServiceConfig;
use crate::error::{ModelError, ServiceError};
use crate::feature_schema::FeatureSchema;
use crate::feature_transform::prepare_prediction_input;
use crate::imagery::{ImageryConnection, ImageryStatus};
use crate::model::{FeatureScaler, NdviRegressor};
use crate::score::{assess, HealthAssessment};
use crate::training::{DAY_OF_YEAR_SOURCE, INTERACTION_NDVI_SOURCE};

#[derive(Clone, Debug, Deserialize)]
pub struct PredictRequest {
    pub bands: BandSample,
    #[serde(default)]
    pub soil: Option<SoilSample>,
    /// 1-12; the current month when omitted.
    #[serde(default)]
    pub month: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BatchRequest {
    pub samples: Vec<PredictRequest>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PolygonRequest {
    pub polygon: Polygon,
    #[serde(default)]
    pub soil: Option<SoilSample>,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FetchRequest {
    pub polygon: Polygon,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchResponse {
    pub predictions: Vec<HealthAssessment>,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SatelliteData {
    pub source: Source,
    pub bands: BandSample,
    pub metadata: Provenance,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PolygonAssessment {
    #[serde(flatten)]
    pub health: HealthAssessment,
    pub satellite_data: SatelliteData,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelInfo {
    pub target: String,
    pub n_features: usize,
    pub metrics: TrainingMetrics,
    pub top_features: Vec<FeatureImportance>,
    pub feature_columns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model_loaded: bool,
    pub schema_loaded: bool,
    pub imagery_connected: bool,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}

/// A scaler and regressor that were fitted together.
pub struct LoadedModel {
    scaler: Box<dyn FeatureScaler>,
    regressor: Box<dyn NdviRegressor>,
}

impl LoadedModel {
    pub fn new(
        scaler: impl FeatureScaler + 'static,
        regressor: impl NdviRegressor + 'static,
    ) -> Self {
        Self {
            scaler: Box::new(scaler),
            regressor: Box::new(regressor),
        }
    }

    fn predict(&self, row: &[f64]) -> Result<f64, ModelError> {
        let scaled = self.scaler.transform(row)?;
        self.regressor.predict(&scaled)
    }
}

/// Everything read from the model directory at startup.
pub struct LoadedArtifacts {
    /// The reason the model cannot be used, when it cannot.
    pub model: Result<LoadedModel, String>,
    pub schema: Option<FeatureSchema>,
    pub metadata: Option<ModelMetadata>,
}

impl LoadedArtifacts {
    pub fn load(model_dir: &Path) -> Self {
        let store = ArtifactStore::new(model_dir);
        let model = match (store.load_model(), store.load_scaler()) {
            (Ok(Some(model)), Ok(Some(scaler))) => Ok(LoadedModel::new(scaler, model)),
            (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
            _ => Err(format!(
                "no trained model in {}; run `crop-health train` first",
                model_dir.display()
            )),
        };
        let schema = store.schema_registry().load().unwrap_or_else(|e| {
            warn!(error = %e, "Feature schema unreadable; using natural column order");
            None
        });
        let metadata = store.load_metadata().unwrap_or_else(|e| {
            warn!(error = %e, "Model metadata unreadable");
            None
        });
        Self {
            model,
            schema,
            metadata,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            model: Err(reason.into()),
            schema: None,
            metadata: None,
        }
    }
}

pub struct ServiceContext {
    model: Result<LoadedModel, String>,
    schema: Option<FeatureSchema>,
    metadata: Option<ModelMetadata>,
    imagery: Arc<ImageryConnection>,
    chain: AcquisitionChain,
}

impl ServiceContext {
    pub fn new(
        artifacts: LoadedArtifacts,
        imagery: Arc<ImageryConnection>,
        chain: AcquisitionChain,
    ) -> Self {
        match &artifacts.model {
            Ok(_) => info!(
                schema_columns = artifacts.schema.as_ref().map(FeatureSchema::len),
                "Model loaded"
            ),
            Err(reason) => warn!(%reason, "Model unavailable; predictions are disabled"),
        }
        if let Some(metadata) = &artifacts.metadata {
            if metadata.interaction_ndvi_source == INTERACTION_NDVI_SOURCE
                || metadata.day_of_year_source == DAY_OF_YEAR_SOURCE
            {
                warn!(
                    interaction_ndvi_source = %metadata.interaction_ndvi_source,
                    day_of_year_source = %metadata.day_of_year_source,
                    "Model was trained on measured NDVI and exact dates; serving uses the band \
                     estimate and month * 30"
                );
            }
        }

        Self {
            model: artifacts.model,
            schema: artifacts.schema,
            metadata: artifacts.metadata,
            imagery,
            chain,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let imagery = Arc::new(ImageryConnection::new(config.imagery.clone()));
        let chain = AcquisitionChain::standard(imagery.clone(), config.historical_bands_csv.clone());
        let artifacts = match config.resolve_model_dir() {
            Ok(dir) => {
                debug!(dir = %dir.display(), "Loading model artifacts");
                LoadedArtifacts::load(&dir)
            }
            Err(e) => LoadedArtifacts::unavailable(e.to_string()),
        };
        Self::new(artifacts, imagery, chain)
    }

    fn model(&self) -> Result<&LoadedModel, ServiceError> {
        self.model
            .as_ref()
            .map_err(|reason| ServiceError::ModelUnavailable(reason.clone()))
    }

    fn score(
        &self,
        model: &LoadedModel,
        bands: &BandSample,
        soil: Option<&SoilSample>,
        month: u32,
    ) -> Result<HealthAssessment, ServiceError> {
        let features = prepare_prediction_input(bands, soil, month, self.schema.as_ref());
        Ok(assess(model.predict(features.values())?))
    }

    /// Scores one pre-fetched sample.
    pub fn predict(&self, request: &PredictRequest) -> Result<HealthAssessment, ServiceError> {
        let model = self.model()?;
        let month = resolve_month(request.month)?;
        self.score(model, &request.bands, request.soil.as_ref(), month)
    }

    /// Scores every sample on a worker pool. Output order follows input order; any
    /// failure fails the whole batch.
    pub fn predict_batch(
        self: &Arc<Self>,
        samples: Vec<PredictRequest>,
    ) -> Result<BatchResponse, ServiceError> {
        self.model()?;
        let months = samples
            .iter()
            .map(|sample| resolve_month(sample.month))
            .collect::<Result<Vec<_>, _>>()?;

        let count = samples.len();
        let thread_pool = ThreadPool::new(num_cpus::get().max(1));
        let (sender, receiver) = mpsc::channel();
        for (index, (sample, month)) in samples.into_iter().zip(months).enumerate() {
            let context = Arc::clone(self);
            let sender = sender.clone();
            thread_pool.execute(move || {
                let result = context.model().and_then(|model| {
                    context.score(model, &sample.bands, sample.soil.as_ref(), month)
                });
                let _ = sender.send((index, result));
            });
        }
        drop(sender);

        let mut results: Vec<(usize, Result<HealthAssessment, ServiceError>)> =
            receiver.iter().collect();
        results.sort_by_key(|(index, _)| *index);
        let predictions = results
            .into_iter()
            .map(|(_, result)| result)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count, "Batch scored");
        Ok(BatchResponse { predictions, count })
    }

    /// Acquires bands for the polygon, then scores them for the current month.
    pub fn predict_polygon(
        &self,
        request: &PolygonRequest,
    ) -> Result<PolygonAssessment, ServiceError> {
        let model = self.model()?;
        let today = Local::now().date_naive();
        let acquired = self.acquire(&request.polygon, request.date_from, request.date_to, today)?;
        let health = self.score(model, &acquired.bands, request.soil.as_ref(), today.month())?;
        Ok(PolygonAssessment {
            health,
            satellite_data: SatelliteData {
                source: acquired.source(),
                bands: acquired.bands,
                metadata: acquired.metadata,
            },
        })
    }

    /// Band acquisition alone. Works without a trained model.
    pub fn fetch_bands(&self, request: &FetchRequest) -> Result<AcquisitionResult, ServiceError> {
        self.acquire(
            &request.polygon,
            request.date_from,
            request.date_to,
            Local::now().date_naive(),
        )
    }

    fn acquire(
        &self,
        polygon: &Polygon,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<AcquisitionResult, ServiceError> {
        if let Some(from) = date_from {
            let to = date_to.unwrap_or(today);
            if from > to {
                return Err(ServiceError::InvalidInput(format!(
                    "date_from {from} is after date_to {to}"
                )));
            }
        }
        Ok(self.chain.acquire(&AcquisitionRequest {
            polygon: polygon.clone(),
            date_from,
            date_to,
            today,
        }))
    }

    pub fn model_info(&self) -> Result<ModelInfo, ServiceError> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or(ServiceError::MetadataUnavailable)?;
        Ok(ModelInfo {
            target: metadata.target.clone(),
            n_features: metadata.n_features,
            metrics: metadata.metrics.clone(),
            top_features: metadata.top_features.clone(),
            feature_columns: metadata.feature_columns.clone(),
        })
    }

    pub fn imagery_status(&self) -> ImageryStatus {
        self.imagery.status()
    }

    /// Attempts the imagery connection now instead of on the first live acquisition.
    pub fn connect_imagery(&self) -> bool {
        self.imagery.initialize()
    }

    pub fn health(&self) -> HealthReport {
        let model_loaded = self.model.is_ok();
        HealthReport {
            status: if model_loaded { "healthy" } else { "degraded" },
            model_loaded,
            schema_loaded: self.schema.is_some(),
            imagery_connected: self.imagery.status().connected,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

fn resolve_month(month: Option<u32>) -> Result<u32, ServiceError> {
    match month {
        None => Ok(Local::now().month()),
        Some(month @ 1..=12) => Ok(month),
        Some(other) => Err(ServiceError::InvalidInput(format!(
            "month must be between 1 and 12, got {other}"
        ))),
    }
}
