use std::path::PathBuf;

use clap::Args;

use crate::error::ArtifactError;
use crate::file_utils;
use crate::imagery::DEFAULT_COLLECTION;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the live imagery gateway. Everything is optional; an
/// incomplete configuration only disables the live acquisition tier.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ImageryConfig {
    /// Base URL of the imagery gateway.
    #[arg(long = "imagery-endpoint", env = "IMAGERY_ENDPOINT")]
    pub endpoint: Option<String>,

    /// JSON key file holding `client_email` and an optional bearer `token`.
    #[arg(long = "imagery-key-file", env = "IMAGERY_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Overrides the `client_email` of the key file.
    #[arg(long = "imagery-service-account", env = "IMAGERY_SERVICE_ACCOUNT_EMAIL")]
    pub service_account: Option<String>,

    #[arg(long = "imagery-timeout-secs", env = "IMAGERY_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    #[arg(long = "imagery-collection", env = "IMAGERY_COLLECTION", default_value = DEFAULT_COLLECTION)]
    pub collection: String,
}

impl Default for ImageryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key_file: None,
            service_account: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

#[derive(Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Directory holding the trained model artifacts.
    #[arg(long, global = true, env = "CROP_HEALTH_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Historical band export used by the cache acquisition tier.
    #[arg(long = "historical-csv", global = true, env = "CROP_HEALTH_HISTORICAL_CSV")]
    pub historical_bands_csv: Option<PathBuf>,

    #[command(flatten)]
    pub imagery: ImageryConfig,
}

impl ServiceConfig {
    pub fn with_model_dir(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: Some(model_dir.into()),
            ..Self::default()
        }
    }

    /// The configured model directory, or `model/` under the per-user data directory.
    pub fn resolve_model_dir(&self) -> Result<PathBuf, ArtifactError> {
        match &self.model_dir {
            Some(dir) => Ok(dir.clone()),
            None => file_utils::default_model_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: ServiceConfig,
    }

    #[test]
    fn flags_populate_config() {
        let harness = Harness::parse_from([
            "crop-health",
            "--model-dir",
            "/tmp/model",
            "--imagery-endpoint",
            "https://imagery.example.org",
            "--imagery-timeout-secs",
            "5",
        ]);
        let config = harness.config;
        assert_eq!(config.resolve_model_dir().unwrap(), PathBuf::from("/tmp/model"));
        assert_eq!(
            config.imagery.endpoint.as_deref(),
            Some("https://imagery.example.org")
        );
        assert_eq!(config.imagery.timeout_secs, 5);
        assert_eq!(config.imagery.collection, DEFAULT_COLLECTION);
    }

    #[test]
    fn default_matches_cli_defaults() {
        let imagery = ImageryConfig::default();
        assert_eq!(imagery.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(imagery.collection, DEFAULT_COLLECTION);
        assert!(imagery.endpoint.is_none());
    }
}
