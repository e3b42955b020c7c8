//! Request and response bodies of the model-serving HTTP API.
//!
//! Field names follow the backend exactly, including its mix of camelCase and
//! snake_case, so these types can be used on either side of the wire.

use crate::activation_cache::RawTensor;
use crate::interventions::{ModelAblations, ModelPatches};
use crate::model_config::ModelConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const GET_MODELS_PATH: &str = "/api/models/getModels";
pub const GET_MODEL_CONFIG_PATH: &str = "/api/models/getModelConfig";
pub const SET_MODEL_PATH: &str = "/api/models/setModel";
pub const TO_TOKENS_PATH: &str = "/api/tokenize/toTokens";
pub const TO_STRING_TOKENS_PATH: &str = "/api/tokenize/toStringTokens";
pub const INFERENCE_RUN_PATH: &str = "/api/inference/run";
pub const ABLATION_SYNC_PATH: &str = "/api/ablation/sync";
pub const PATCH_SYNC_PATH: &str = "/api/patch/sync";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub ablations: ModelAblations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigResponse {
    pub config: ModelConfig,
    #[serde(rename = "sessionConfig", default, skip_serializing_if = "Option::is_none")]
    pub session_config: Option<SessionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetModelRequest {
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeRequest {
    pub input: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToTokensResponse {
    pub tokens: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToStringTokensResponse {
    pub string_tokens: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub inference_prompt: Vec<String>,
    pub inference_sub_words: Vec<Vec<String>>,
    pub logits: RawTensor,
    pub tokens: Vec<Vec<u32>>,
    pub sub_words: Vec<Vec<String>>,
    pub token_loss: RawTensor,
    pub final_loss: f32,
    pub activation_data: HashMap<String, RawTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationSyncRequest {
    pub ablations: ModelAblations,
    #[serde(rename = "clientLogicalClock")]
    pub client_logical_clock: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationSyncResponse {
    pub ablations: ModelAblations,
    pub server_logical_clock: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSyncRequest {
    pub patches: ModelPatches,
    #[serde(rename = "clientLogicalClock")]
    pub client_logical_clock: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSyncResponse {
    pub patches: ModelPatches,
    pub server_logical_clock: u64,
}
