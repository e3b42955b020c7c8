use crate::config::ClientConfig;
use crate::model_config::ModelDescriptor;
use crate::protocol::{
    ABLATION_SYNC_PATH, AblationSyncRequest, AblationSyncResponse, GET_MODEL_CONFIG_PATH,
    GET_MODELS_PATH, INFERENCE_RUN_PATH, InferenceResponse, ModelConfigResponse, PATCH_SYNC_PATH,
    PatchSyncRequest, PatchSyncResponse, SET_MODEL_PATH, SetModelRequest, TO_STRING_TOKENS_PATH,
    TO_TOKENS_PATH, ToStringTokensResponse, ToTokensResponse, TokenizeRequest,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Everything outside the RFC 3986 unreserved set.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn model_config_path(model_name: &str) -> String {
    format!(
        "{GET_MODEL_CONFIG_PATH}/{}",
        utf8_percent_encode(model_name, PATH_SEGMENT)
    )
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Request to {path} failed: {message}")]
    Transport { path: String, message: String },
    #[error("Backend answered {path} with status {status}")]
    Status { path: String, status: u16 },
    #[error("Could not decode response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl BackendError {
    fn from_ureq(path: &str, error: ureq::Error) -> Self {
        match error {
            ureq::Error::StatusCode(status) => BackendError::Status {
                path: path.to_string(),
                status,
            },
            other => BackendError::Transport {
                path: path.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Everything the client needs from the model-serving process.
pub trait Backend {
    fn get_models(&self) -> Result<Vec<ModelDescriptor>, BackendError>;

    fn get_model_config(&self, model_name: &str) -> Result<ModelConfigResponse, BackendError>;

    fn set_model(&self, model_name: &str) -> Result<(), BackendError>;

    fn to_tokens(&self, input: &[String]) -> Result<ToTokensResponse, BackendError>;

    fn to_string_tokens(&self, input: &[String]) -> Result<ToStringTokensResponse, BackendError>;

    fn run_inference(&self) -> Result<InferenceResponse, BackendError>;

    fn sync_ablations(
        &self,
        request: &AblationSyncRequest,
    ) -> Result<AblationSyncResponse, BackendError>;

    fn sync_patches(&self, request: &PatchSyncRequest) -> Result<PatchSyncResponse, BackendError>;
}

/// Blocking JSON-over-HTTP client for the backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(config.request_timeout_secs.map(Duration::from_secs))
            .build();
        Self {
            agent: agent_config.into(),
            base_url: config.backend_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        log::debug!("GET {path}");
        let mut response = self
            .agent
            .get(&self.url(path))
            .call()
            .map_err(|error| BackendError::from_ureq(path, error))?;
        Self::read_json(path, &mut response)
    }

    fn read_json<T: DeserializeOwned>(
        path: &str,
        response: &mut ureq::http::Response<ureq::Body>,
    ) -> Result<T, BackendError> {
        response
            .body_mut()
            .read_json()
            .map_err(|error| BackendError::Decode {
                path: path.to_string(),
                message: error.to_string(),
            })
    }

    fn put(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<ureq::http::Response<ureq::Body>, BackendError> {
        log::debug!("PUT {path}");
        self.agent
            .put(&self.url(path))
            .send_json(body)
            .map_err(|error| BackendError::from_ureq(path, error))
    }

    fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, BackendError> {
        let mut response = self.put(path, body)?;
        Self::read_json(path, &mut response)
    }
}

impl Backend for HttpBackend {
    fn get_models(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        self.get_json(GET_MODELS_PATH)
    }

    fn get_model_config(&self, model_name: &str) -> Result<ModelConfigResponse, BackendError> {
        self.get_json(&model_config_path(model_name))
    }

    fn set_model(&self, model_name: &str) -> Result<(), BackendError> {
        self.put(
            SET_MODEL_PATH,
            &SetModelRequest {
                model_name: model_name.to_string(),
            },
        )?;
        Ok(())
    }

    fn to_tokens(&self, input: &[String]) -> Result<ToTokensResponse, BackendError> {
        self.put_json(
            TO_TOKENS_PATH,
            &TokenizeRequest {
                input: input.to_vec(),
            },
        )
    }

    fn to_string_tokens(&self, input: &[String]) -> Result<ToStringTokensResponse, BackendError> {
        self.put_json(
            TO_STRING_TOKENS_PATH,
            &TokenizeRequest {
                input: input.to_vec(),
            },
        )
    }

    fn run_inference(&self) -> Result<InferenceResponse, BackendError> {
        self.get_json(INFERENCE_RUN_PATH)
    }

    fn sync_ablations(
        &self,
        request: &AblationSyncRequest,
    ) -> Result<AblationSyncResponse, BackendError> {
        self.put_json(ABLATION_SYNC_PATH, request)
    }

    fn sync_patches(&self, request: &PatchSyncRequest) -> Result<PatchSyncResponse, BackendError> {
        self.put_json(PATCH_SYNC_PATH, request)
    }
}
