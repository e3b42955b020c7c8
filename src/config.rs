use serde::{Deserialize, Serialize};
use std::path::Path;

pub const BACKEND_URL_ENV: &str = "TRANSPECTOR_BACKEND_URL";
pub const MODEL_ENV: &str = "TRANSPECTOR_MODEL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend_url: String,
    pub default_model: String,
    /// No timeout when unset; a stalled request then simply never completes.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".to_string(),
            default_model: "gpt2".to_string(),
            request_timeout_secs: None,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Defaults, overridden by the `TRANSPECTOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(BACKEND_URL_ENV).ok(),
            std::env::var(MODEL_ENV).ok(),
        )
    }

    fn with_overrides(mut self, backend_url: Option<String>, model: Option<String>) -> Self {
        if let Some(backend_url) = backend_url {
            self.backend_url = backend_url;
        }
        if let Some(model) = model {
            self.default_model = model;
        }
        self
    }
}
