use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::classifier::{DecisionPolicy, DEFAULT_KEEP_LABEL, DEFAULT_REMOVE_LABEL};
use crate::fetch::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_IMAGE_BYTES};
use crate::model_store::{LoadOptions, DEFAULT_MODEL_DIR};
use crate::reclaimer::{DEFAULT_RECLAIM_EVERY, DEFAULT_RECLAIM_INTERVAL};
use crate::runtime::RuntimeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_TOKEN environment variable is required")]
    MissingApiToken,
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Service settings, read from flags with environment-variable fallbacks.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Background removal classifier service", long_about = None)]
pub struct ServiceConfig {
    /// Directory containing model.onnx and metadata.json
    #[arg(long, env = "MODEL_PATH", default_value = DEFAULT_MODEL_DIR)]
    pub model_path: PathBuf,

    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Shared secret expected in the Authorization header
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Upper bound on the image download, in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs())]
    pub fetch_timeout_secs: u64,

    /// Largest accepted image, in bytes
    #[arg(long, env = "MAX_IMAGE_BYTES", default_value_t = DEFAULT_MAX_IMAGE_BYTES)]
    pub max_image_bytes: usize,

    /// Seconds between background memory reclaims
    #[arg(
        long,
        env = "RECLAIM_INTERVAL_SECS",
        default_value_t = DEFAULT_RECLAIM_INTERVAL.as_secs()
    )]
    pub reclaim_interval_secs: u64,

    /// Reclaim after this many completed inferences (0 disables)
    #[arg(long, env = "RECLAIM_EVERY", default_value_t = DEFAULT_RECLAIM_EVERY)]
    pub reclaim_every: u64,

    /// ONNX Runtime intra-op threads (0 lets the runtime decide)
    #[arg(long, env = "ORT_INTRA_THREADS", default_value_t = 0)]
    pub intra_threads: usize,

    /// Expected sha256 of model.onnx
    #[arg(long, env = "MODEL_SHA256")]
    pub model_sha256: Option<String>,

    #[arg(long, env = "REMOVE_LABEL", default_value = DEFAULT_REMOVE_LABEL)]
    pub remove_label: String,

    #[arg(long, env = "KEEP_LABEL", default_value = DEFAULT_KEEP_LABEL)]
    pub keep_label: String,

    /// Serve /predict-base64 without authentication
    #[arg(long, env = "PUBLIC_BASE64")]
    pub public_base64: bool,
}

impl ServiceConfig {
    /// Checks the settings and returns the API token.
    pub fn validate(&self) -> Result<&str, ConfigError> {
        let token = self
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingApiToken)?;

        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "FETCH_TIMEOUT_SECS",
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "MAX_IMAGE_BYTES",
                reason: "must be greater than 0".into(),
            });
        }
        if self.reclaim_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "RECLAIM_INTERVAL_SECS",
                reason: "must be greater than 0".into(),
            });
        }
        if self.remove_label.is_empty()
            || self.keep_label.is_empty()
            || self.remove_label == self.keep_label
        {
            return Err(ConfigError::Invalid {
                field: "REMOVE_LABEL/KEEP_LABEL",
                reason: "labels must be non-empty and distinct".into(),
            });
        }
        self.socket_addr()?;
        Ok(token)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.host.parse().map_err(|e| ConfigError::Invalid {
            field: "HOST",
            reason: format!("{}: {}", self.host, e),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy::new(self.remove_label.clone(), self.keep_label.clone())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            runtime: RuntimeConfig::default().with_intra_threads(self.intra_threads),
            required_labels: vec![self.remove_label.clone(), self.keep_label.clone()],
            expected_sha256: self.model_sha256.clone(),
        }
    }
}
