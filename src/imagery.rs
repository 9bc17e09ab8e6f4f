//! Access to the external Sentinel-2 imagery index used by the live acquisition tier.

use std::{
    collections::HashMap,
    fs,
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, NaiveDate};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

use crate::acquisition::{DateWindow, Polygon};
use crate::bands::Band;
use crate::config::ImageryConfig;
use crate::error::ImageryError;

pub const DEFAULT_COLLECTION: &str = "COPERNICUS/S2_SR_HARMONIZED";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub acquired_at_ms: i64,
    pub cloud_cover: f64,
}

impl Scene {
    pub fn acquisition_date(&self) -> Option<NaiveDate> {
        DateTime::from_timestamp_millis(self.acquired_at_ms).map(|dt| dt.date_naive())
    }
}

/// Search and region statistics over a scene collection.
pub trait ImageryIndex: Send + Sync {
    fn collection(&self) -> &str;

    /// The account the index authenticates as, when it knows one.
    fn service_account(&self) -> Option<&str> {
        None
    }

    /// The scene with the lowest cloud cover below `max_cloud_cover` percent, if any.
    fn least_cloudy_scene(
        &self,
        polygon: &Polygon,
        window: &DateWindow,
        max_cloud_cover: f64,
    ) -> Result<Option<Scene>, ImageryError>;

    /// Mean of each band over the polygon; `None` where the scene has no valid pixels.
    fn region_mean(
        &self,
        scene: &Scene,
        polygon: &Polygon,
        bands: &[Band],
        scale_m: f64,
    ) -> Result<HashMap<String, Option<f64>>, ImageryError>;
}

#[derive(Deserialize)]
struct KeyFile {
    #[serde(default)]
    client_email: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    collection: &'a str,
    polygon: &'a Polygon,
    date_from: NaiveDate,
    date_to: NaiveDate,
    max_cloud_cover: f64,
    sort_by: &'static str,
    limit: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    scenes: Vec<Scene>,
}

#[derive(Serialize)]
struct ReduceRequest<'a> {
    scene_id: &'a str,
    polygon: &'a Polygon,
    bands: Vec<&'static str>,
    reducer: &'static str,
    scale: f64,
    max_pixels: f64,
}

#[derive(Deserialize)]
struct ReduceResponse {
    #[serde(default)]
    values: HashMap<String, Option<f64>>,
}

/// JSON gateway in front of the scene archive.
pub struct HttpImageryIndex {
    client: reqwest::blocking::Client,
    endpoint: String,
    collection: String,
    service_account: String,
    token: Option<String>,
}

impl HttpImageryIndex {
    pub fn connect(config: &ImageryConfig) -> Result<Self, ImageryError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| ImageryError::NotConfigured("IMAGERY_ENDPOINT is not set".into()))?;
        let key_path = config
            .key_file
            .clone()
            .ok_or_else(|| ImageryError::NotConfigured("IMAGERY_KEY_FILE is not set".into()))?;

        let key_text = fs::read_to_string(&key_path).map_err(|e| ImageryError::KeyFile {
            path: key_path.clone(),
            reason: e.to_string(),
        })?;
        let key: KeyFile = serde_json::from_str(&key_text).map_err(|e| ImageryError::KeyFile {
            path: key_path.clone(),
            reason: e.to_string(),
        })?;

        let service_account = config
            .service_account
            .clone()
            .filter(|email| !email.is_empty())
            .or(key.client_email)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                ImageryError::NotConfigured("service account email not found".into())
            })?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            service_account,
            token: key.token,
        })
    }

    fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ImageryError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .header("x-service-account", &self.service_account)
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageryError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }
}

impl ImageryIndex for HttpImageryIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn service_account(&self) -> Option<&str> {
        Some(self.service_account.as_str())
    }

    fn least_cloudy_scene(
        &self,
        polygon: &Polygon,
        window: &DateWindow,
        max_cloud_cover: f64,
    ) -> Result<Option<Scene>, ImageryError> {
        let response: SearchResponse = self.post(
            "/v1/scenes:search",
            &SearchRequest {
                collection: &self.collection,
                polygon,
                date_from: window.from,
                date_to: window.to,
                max_cloud_cover,
                sort_by: "cloud_cover",
                limit: 1,
            },
        )?;
        Ok(response
            .scenes
            .into_iter()
            .filter(|scene| scene.cloud_cover < max_cloud_cover)
            .min_by(|a, b| a.cloud_cover.total_cmp(&b.cloud_cover)))
    }

    fn region_mean(
        &self,
        scene: &Scene,
        polygon: &Polygon,
        bands: &[Band],
        scale_m: f64,
    ) -> Result<HashMap<String, Option<f64>>, ImageryError> {
        let response: ReduceResponse = self.post(
            "/v1/scenes:reduceRegion",
            &ReduceRequest {
                scene_id: &scene.id,
                polygon,
                bands: bands.iter().map(|b| b.column()).collect(),
                reducer: "mean",
                scale: scale_m,
                max_pixels: 1e9,
            },
        )?;
        Ok(response.values)
    }
}

type Connector = Box<dyn Fn() -> Result<Arc<dyn ImageryIndex>, ImageryError> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageryStatus {
    pub connected: bool,
    pub service_account: String,
    pub error: Option<String>,
}

/// Lazily established, process-wide handle to the imagery index.
///
/// The connector runs at most once; every later call sees the cached outcome, success
/// or failure.
pub struct ImageryConnection {
    service_account: Option<String>,
    connector: Connector,
    state: OnceLock<Result<Arc<dyn ImageryIndex>, String>>,
}

impl ImageryConnection {
    pub fn new(config: ImageryConfig) -> Self {
        let service_account = config.service_account.clone();
        Self::with_connector(service_account, move || {
            HttpImageryIndex::connect(&config).map(|index| Arc::new(index) as Arc<dyn ImageryIndex>)
        })
    }

    pub fn with_connector(
        service_account: Option<String>,
        connector: impl Fn() -> Result<Arc<dyn ImageryIndex>, ImageryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            service_account,
            connector: Box::new(connector),
            state: OnceLock::new(),
        }
    }

    pub fn index(&self) -> Result<Arc<dyn ImageryIndex>, String> {
        self.state
            .get_or_init(|| match (self.connector)() {
                Ok(index) => {
                    info!(collection = index.collection(), "Imagery connection initialized");
                    Ok(index)
                }
                Err(e) => {
                    warn!(error = %e, "Imagery connection unavailable");
                    Err(e.to_string())
                }
            })
            .clone()
    }

    /// Attempts the connection if it has not been attempted yet.
    pub fn initialize(&self) -> bool {
        self.index().is_ok()
    }

    /// Reports the cached state without triggering a connection attempt.
    pub fn status(&self) -> ImageryStatus {
        let (connected, used_account, error) = match self.state.get() {
            Some(Ok(index)) => (true, index.service_account().map(str::to_string), None),
            Some(Err(e)) => (false, None, Some(e.clone())),
            None => (false, None, None),
        };
        ImageryStatus {
            connected,
            service_account: used_account
                .or_else(|| self.service_account.clone())
                .unwrap_or_else(|| "not set".to_string()),
            error,
        }
    }
}
