#![allow(dead_code)]

use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::Once;
use transpector::protocol::{
    AblationSyncRequest, AblationSyncResponse, InferenceResponse, ModelConfigResponse,
    PatchSyncRequest, PatchSyncResponse, SessionConfig, ToStringTokensResponse, ToTokensResponse,
};
use transpector::{
    Backend, BackendError, ModelAblations, ModelConfig, ModelDescriptor, ModelPatches, RawTensor,
};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub clock: u64,
    pub ablations: ModelAblations,
    pub patches: ModelPatches,
    pub model_name: Option<String>,
    pub sync_requests: usize,
}

/// In-process backend that resolves sync conflicts like the reference server:
/// a proposal is accepted when its clock is not behind the server's.
#[derive(Default)]
pub struct MockBackend {
    pub state: RefCell<ServerState>,
    pub configs: HashMap<String, ModelConfigResponse>,
    pub inference_responses: RefCell<VecDeque<Result<InferenceResponse, BackendError>>>,
    pub offline: Cell<bool>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: &str, config: ModelConfig) -> Self {
        self.configs.insert(
            name.to_string(),
            ModelConfigResponse {
                config,
                session_config: None,
            },
        );
        self
    }

    pub fn with_session_ablations(mut self, name: &str, ablations: ModelAblations) -> Self {
        if let Some(response) = self.configs.get_mut(name) {
            response.session_config = Some(SessionConfig { ablations });
        }
        self
    }

    pub fn push_inference(&self, response: Result<InferenceResponse, BackendError>) {
        self.inference_responses.borrow_mut().push_back(response);
    }

    /// Another client writing ablations directly with the given clock.
    pub fn remote_ablations(&self, ablations: ModelAblations, clock: u64) {
        let mut state = self.state.borrow_mut();
        state.ablations = ablations;
        state.clock = clock;
    }

    /// Another client writing patches directly with the given clock.
    pub fn remote_patches(&self, patches: ModelPatches, clock: u64) {
        let mut state = self.state.borrow_mut();
        state.patches = patches;
        state.clock = clock;
    }

    pub fn server_clock(&self) -> u64 {
        self.state.borrow().clock
    }

    fn check_online(&self, path: &str) -> Result<(), BackendError> {
        if self.offline.get() {
            Err(BackendError::Transport {
                path: path.to_string(),
                message: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn accept(state: &mut ServerState, client_clock: u64) -> bool {
        state.sync_requests += 1;
        if client_clock >= state.clock {
            state.clock += 1;
            true
        } else {
            false
        }
    }
}

impl Backend for MockBackend {
    fn get_models(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        self.check_online("/api/models/getModels")?;
        let mut names: Vec<&String> = self.configs.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| ModelDescriptor {
                model_name: name.clone(),
                details: serde_json::Map::new(),
            })
            .collect())
    }

    fn get_model_config(&self, model_name: &str) -> Result<ModelConfigResponse, BackendError> {
        self.check_online("/api/models/getModelConfig")?;
        self.configs
            .get(model_name)
            .cloned()
            .ok_or_else(|| BackendError::Status {
                path: format!("/api/models/getModelConfig/{model_name}"),
                status: 404,
            })
    }

    fn set_model(&self, model_name: &str) -> Result<(), BackendError> {
        self.check_online("/api/models/setModel")?;
        self.state.borrow_mut().model_name = Some(model_name.to_string());
        Ok(())
    }

    fn to_tokens(&self, input: &[String]) -> Result<ToTokensResponse, BackendError> {
        self.check_online("/api/tokenize/toTokens")?;
        Ok(ToTokensResponse {
            tokens: input
                .iter()
                .map(|text| text.split_whitespace().map(|word| word.len() as u32).collect())
                .collect(),
        })
    }

    fn to_string_tokens(&self, input: &[String]) -> Result<ToStringTokensResponse, BackendError> {
        self.check_online("/api/tokenize/toStringTokens")?;
        Ok(ToStringTokensResponse {
            string_tokens: input
                .iter()
                .map(|text| text.split_whitespace().map(str::to_string).collect())
                .collect(),
        })
    }

    fn run_inference(&self) -> Result<InferenceResponse, BackendError> {
        self.check_online("/api/inference/run")?;
        self.inference_responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(inference_response(&["hook_embed"])))
    }

    fn sync_ablations(
        &self,
        request: &AblationSyncRequest,
    ) -> Result<AblationSyncResponse, BackendError> {
        self.check_online("/api/ablation/sync")?;
        let mut state = self.state.borrow_mut();
        if Self::accept(&mut state, request.client_logical_clock) {
            state.ablations = request.ablations.clone();
        }
        Ok(AblationSyncResponse {
            ablations: state.ablations.clone(),
            server_logical_clock: state.clock,
        })
    }

    fn sync_patches(&self, request: &PatchSyncRequest) -> Result<PatchSyncResponse, BackendError> {
        self.check_online("/api/patch/sync")?;
        let mut state = self.state.borrow_mut();
        if Self::accept(&mut state, request.client_logical_clock) {
            state.patches = request.patches.clone();
        }
        Ok(PatchSyncResponse {
            patches: state.patches.clone(),
            server_logical_clock: state.clock,
        })
    }
}

/// A small inference answer carrying a `[1, 2, 3]` tensor per relation id.
pub fn inference_response(relation_ids: &[&str]) -> InferenceResponse {
    InferenceResponse {
        inference_prompt: vec!["Hello world".to_string()],
        inference_sub_words: vec![vec!["Hello".to_string(), " world".to_string()]],
        logits: RawTensor(json!([[[0.0, 1.0], [1.0, 0.0]]])),
        tokens: vec![vec![1, 0]],
        sub_words: vec![vec![" world".to_string(), ".".to_string()]],
        token_loss: RawTensor(json!([[3.5, 1.25]])),
        final_loss: 2.375,
        activation_data: relation_ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    RawTensor(json!([[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]])),
                )
            })
            .collect(),
    }
}
