//! Reference session server for the transpector client.
//!
//! Serves the model registry and the two intervention sync channels. It runs
//! no model itself: tokenization and inference belong to a real model server.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use transpector::protocol::{
    ABLATION_SYNC_PATH, AblationSyncRequest, AblationSyncResponse, GET_MODEL_CONFIG_PATH,
    GET_MODELS_PATH, ModelConfigResponse, PATCH_SYNC_PATH, PatchSyncRequest, PatchSyncResponse,
    SET_MODEL_PATH, SessionConfig, SetModelRequest,
};
use transpector::{ModelAblations, ModelConfig, ModelDescriptor, ModelPatches};

pub const SERVER_CONFIG_ENV: &str = "TRANSPECTOR_SERVER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ServerConfigError {
    #[error("Could not read {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub model_name: String,
    pub config: ModelConfig,
}

impl RegisteredModel {
    fn descriptor(&self) -> ModelDescriptor {
        let details = match serde_json::to_value(self.config) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        ModelDescriptor {
            model_name: self.model_name.clone(),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Frontend bundle served for every path the API does not claim.
    pub static_dir: Option<PathBuf>,
    pub models: Vec<RegisteredModel>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            static_dir: None,
            models: vec![],
        }
    }
}

impl ServerConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ServerConfigError> {
        let data = std::fs::read_to_string(path).map_err(|error| ServerConfigError::Io {
            path: path.to_path_buf(),
            error,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load from `path`, falling back to `TRANSPECTOR_SERVER_CONFIG`, then to
    /// the defaults.
    pub fn from_path_or_env(path: Option<PathBuf>) -> Result<Self, ServerConfigError> {
        match path.or_else(|| std::env::var_os(SERVER_CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn model(&self, model_name: &str) -> Option<&RegisteredModel> {
        self.models.iter().find(|model| model.model_name == model_name)
    }
}

/// Intervention state shared by every connected client.
///
/// A proposal is accepted when its clock is not behind the server's; the clock
/// then advances by one. Both channels share the clock. Every answer carries
/// the server's state, accepted or not.
#[derive(Debug, Clone, Default)]
pub struct InterventionState {
    logical_clock: u64,
    ablations: ModelAblations,
    patches: ModelPatches,
}

impl InterventionState {
    pub fn logical_clock(&self) -> u64 {
        self.logical_clock
    }

    pub fn ablations(&self) -> &ModelAblations {
        &self.ablations
    }

    pub fn patches(&self) -> &ModelPatches {
        &self.patches
    }

    fn accept(&mut self, client_clock: u64) -> bool {
        if client_clock >= self.logical_clock {
            self.logical_clock += 1;
            true
        } else {
            log::info!(
                "Rejecting stale proposal at clock {client_clock}, server is at {}",
                self.logical_clock
            );
            false
        }
    }

    pub fn sync_ablations(&mut self, request: AblationSyncRequest) -> AblationSyncResponse {
        if self.accept(request.client_logical_clock) {
            log::debug!("Accepted {} ablated components", request.ablations.len());
            self.ablations = request.ablations;
        }
        AblationSyncResponse {
            ablations: self.ablations.clone(),
            server_logical_clock: self.logical_clock,
        }
    }

    pub fn sync_patches(&mut self, request: PatchSyncRequest) -> PatchSyncResponse {
        if self.accept(request.client_logical_clock) {
            log::debug!("Accepted {} patched components", request.patches.len());
            self.patches = request.patches;
        }
        PatchSyncResponse {
            patches: self.patches.clone(),
            server_logical_clock: self.logical_clock,
        }
    }
}

pub struct AppState {
    config: ServerConfig,
    interventions: Mutex<InterventionState>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            interventions: Mutex::new(InterventionState::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn interventions(&self) -> InterventionState {
        self.interventions.lock().await.clone()
    }
}

async fn get_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelDescriptor>> {
    Json(state.config.models.iter().map(RegisteredModel::descriptor).collect())
}

async fn get_model_config(
    State(state): State<Arc<AppState>>,
    Path(model_name): Path<String>,
) -> Result<Json<ModelConfigResponse>, StatusCode> {
    let model = state.config.model(&model_name).ok_or_else(|| {
        tracing::warn!("Config requested for unknown model {model_name}");
        StatusCode::NOT_FOUND
    })?;
    let ablations = state.interventions.lock().await.ablations.clone();
    Ok(Json(ModelConfigResponse {
        config: model.config,
        session_config: Some(SessionConfig { ablations }),
    }))
}

async fn set_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetModelRequest>,
) -> Result<Json<Value>, StatusCode> {
    if state.config.model(&request.model_name).is_none() {
        tracing::warn!("Cannot switch to unknown model {}", request.model_name);
        return Err(StatusCode::NOT_FOUND);
    }
    tracing::info!("Switching to model {}", request.model_name);
    Ok(Json(serde_json::json!({ "Loaded model": request })))
}

async fn ablation_sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AblationSyncRequest>,
) -> Json<AblationSyncResponse> {
    Json(state.interventions.lock().await.sync_ablations(request))
}

async fn patch_sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PatchSyncRequest>,
) -> Json<PatchSyncResponse> {
    Json(state.interventions.lock().await.sync_patches(request))
}

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(GET_MODELS_PATH, get(get_models))
        .route(
            &format!("{GET_MODEL_CONFIG_PATH}/{{model_name}}"),
            get(get_model_config),
        )
        .route(SET_MODEL_PATH, put(set_model))
        .route(ABLATION_SYNC_PATH, put(ablation_sync))
        .route(PATCH_SYNC_PATH, put(patch_sync))
        .with_state(state);
    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}
