use crate::activation_cache::{ActivationCache, TensorDecodeError};
use crate::backend::{Backend, BackendError, HttpBackend};
use crate::config::ClientConfig;
use crate::graph::HookBinding;
use crate::inference::{InferenceOutput, InferenceTicket, InferenceTracker, PromptState};
use crate::interventions::{AblationType, InterventionStore};
use crate::model_config::{ModelConfig, ModelDescriptor};
use crate::protocol::{InferenceResponse, ModelConfigResponse};
use crate::runtime::{ConnectionError, GraphRuntimeStore};
use crate::slice::SliceSpec;
use ndarray::ArrayViewD;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Tensor(#[from] TensorDecodeError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// All client state for one debugging session, bound to one backend.
///
/// Each store is owned here and only reachable through the session, so tests
/// can build as many isolated sessions as they like.
pub struct Session<B: Backend> {
    backend: B,
    default_model: String,
    models: Vec<ModelDescriptor>,
    model_name: Option<String>,
    model_config: Option<ModelConfig>,
    graph: GraphRuntimeStore,
    interventions: InterventionStore,
    activations: ActivationCache,
    tracker: InferenceTracker,
    output: Option<InferenceOutput>,
    prompt: PromptState,
}

impl Session<HttpBackend> {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(HttpBackend::new(config)).with_default_model(&config.default_model)
    }
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            default_model: ClientConfig::default().default_model,
            models: vec![],
            model_name: None,
            model_config: None,
            graph: GraphRuntimeStore::new(),
            interventions: InterventionStore::new(),
            activations: ActivationCache::new(),
            tracker: InferenceTracker::new(),
            output: None,
            prompt: PromptState::new(),
        }
    }

    pub fn with_default_model(mut self, model_name: &str) -> Self {
        self.default_model = model_name.to_string();
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn model_config(&self) -> Option<&ModelConfig> {
        self.model_config.as_ref()
    }

    pub fn graph(&self) -> &GraphRuntimeStore {
        &self.graph
    }

    /// For drag, select and resize events; interventions go through the session.
    pub fn graph_mut(&mut self) -> &mut GraphRuntimeStore {
        &mut self.graph
    }

    pub fn interventions(&self) -> &InterventionStore {
        &self.interventions
    }

    pub fn activations(&self) -> &ActivationCache {
        &self.activations
    }

    pub fn output(&self) -> Option<&InferenceOutput> {
        self.output.as_ref()
    }

    pub fn prompt(&self) -> &PromptState {
        &self.prompt
    }

    pub fn inferencing(&self) -> bool {
        self.tracker.inferencing()
    }

    pub fn list_models(&mut self) -> Result<&[ModelDescriptor], SessionError> {
        self.models = self.backend.get_models()?;
        log::info!("Backend offers {} models", self.models.len());
        Ok(self.models.as_slice())
    }

    /// Fetch the config of `model_name` and rebuild the graph from it. Ablations
    /// handed out with the config replace the local ones.
    pub fn load_model_config(&mut self, model_name: &str) -> Result<&ModelConfig, SessionError> {
        let response = self.backend.get_model_config(model_name)?;
        Ok(self.apply_model_config(model_name, response))
    }

    fn apply_model_config(
        &mut self,
        model_name: &str,
        response: ModelConfigResponse,
    ) -> &ModelConfig {
        log::info!(
            "Loaded config for {model_name}: {} layers, {} heads, attn_only={}",
            response.config.n_layers,
            response.config.n_heads,
            response.config.attn_only
        );
        self.graph.reset(&response.config);
        self.graph.sync_patch_edges(self.interventions.patches());
        if let Some(session_config) = response.session_config {
            self.interventions.adopt_ablations(session_config.ablations);
        }
        self.model_name = Some(model_name.to_string());
        &*self.model_config.insert(response.config)
    }

    /// Switch the backend to `model_name`. Nothing changes locally unless both
    /// the config fetch and the switch succeed; results of the previous model,
    /// including answers still in flight, are then discarded.
    pub fn select_model(&mut self, model_name: &str) -> Result<&ModelConfig, SessionError> {
        let response = self.backend.get_model_config(model_name)?;
        self.backend.set_model(model_name)?;
        self.tracker.invalidate();
        self.activations.clear();
        self.output = None;
        Ok(self.apply_model_config(model_name, response))
    }

    pub fn select_default_model(&mut self) -> Result<&ModelConfig, SessionError> {
        let model_name = self.default_model.clone();
        self.select_model(&model_name)
    }

    pub fn update_input_text(&mut self, text: &str) -> Result<(), SessionError> {
        Ok(self.prompt.update_input_text(&self.backend, text)?)
    }

    /// Issue an inference request and apply its answer.
    pub fn run_inference(&mut self) -> Result<bool, SessionError> {
        let ticket = self.begin_inference();
        let response = self.backend.run_inference();
        self.complete_inference(ticket, response)
    }

    /// First half of [`Self::run_inference`] for callers that perform the
    /// request themselves.
    pub fn begin_inference(&mut self) -> InferenceTicket {
        let ticket = self.tracker.begin();
        log::debug!("Issued inference request {}", ticket.id());
        ticket
    }

    /// Apply the answer to `ticket`. Returns `Ok(false)` if a newer request has
    /// been issued since, in which case nothing changes.
    pub fn complete_inference(
        &mut self,
        ticket: InferenceTicket,
        response: Result<InferenceResponse, BackendError>,
    ) -> Result<bool, SessionError> {
        if !self.tracker.finish(ticket) {
            return Ok(false);
        }
        let (output, activations) = InferenceOutput::decode(response?)?;
        self.activations.replace_decoded(activations);
        self.output = Some(output);
        Ok(true)
    }

    pub fn add_ablation(
        &mut self,
        relation_id: &str,
        slices: &[SliceSpec],
        ablation_type: AblationType,
    ) -> Result<(), SessionError> {
        Ok(self
            .interventions
            .add_ablation(&self.backend, relation_id, slices, ablation_type)?)
    }

    pub fn remove_ablation(
        &mut self,
        relation_id: &str,
        slices: &[SliceSpec],
    ) -> Result<(), SessionError> {
        Ok(self
            .interventions
            .remove_ablation(&self.backend, relation_id, slices)?)
    }

    /// Ablate or restore whatever the node displays.
    pub fn toggle_node_ablation(
        &mut self,
        node_id: &str,
        ablation_type: AblationType,
    ) -> Result<(), SessionError> {
        let HookBinding { relation_id, slice } = self
            .graph
            .node(node_id)
            .ok_or_else(|| ConnectionError::UnknownNode(node_id.to_string()))?
            .hook
            .clone()
            .ok_or_else(|| ConnectionError::Unbound(node_id.to_string()))?;
        match self.graph.node_ablation(node_id, &self.interventions) {
            Some(current) if current == ablation_type => {
                self.remove_ablation(&relation_id, &[slice])
            }
            _ => self.add_ablation(&relation_id, &[slice], ablation_type),
        }
    }

    pub fn ablate_heads(
        &mut self,
        layer: usize,
        heads: &[usize],
        ablation_type: AblationType,
    ) -> Result<(), SessionError> {
        Ok(self
            .interventions
            .ablate_heads(&self.backend, layer, heads, ablation_type)?)
    }

    pub fn restore_heads(&mut self, layer: usize, heads: &[usize]) -> Result<(), SessionError> {
        Ok(self.interventions.restore_heads(&self.backend, layer, heads)?)
    }

    pub fn add_patch(
        &mut self,
        source_relation_id: &str,
        source_slice: &SliceSpec,
        target_relation_id: &str,
        target_slice: &SliceSpec,
    ) -> Result<(), SessionError> {
        self.interventions.add_patch(
            &self.backend,
            source_relation_id,
            source_slice,
            target_relation_id,
            target_slice,
        )?;
        self.graph.sync_patch_edges(self.interventions.patches());
        Ok(())
    }

    pub fn remove_patch(
        &mut self,
        source_relation_id: &str,
        source_slice: &SliceSpec,
        target_relation_id: &str,
        target_slice: &SliceSpec,
    ) -> Result<(), SessionError> {
        self.interventions.remove_patch(
            &self.backend,
            source_relation_id,
            source_slice,
            target_relation_id,
            target_slice,
        )?;
        self.graph.sync_patch_edges(self.interventions.patches());
        Ok(())
    }

    /// Pull in intervention changes made by other clients.
    pub fn refresh_interventions(&mut self) -> Result<(), SessionError> {
        self.interventions.refresh(&self.backend)?;
        self.graph.sync_patch_edges(self.interventions.patches());
        Ok(())
    }

    pub fn complete_connection(
        &mut self,
        source_id: &str,
        target_id: &str,
    ) -> Result<(), SessionError> {
        Ok(self.graph.complete_connection(
            source_id,
            target_id,
            &mut self.interventions,
            &self.backend,
        )?)
    }

    pub fn remove_patch_edge(&mut self, edge_id: &str) -> Result<bool, SessionError> {
        Ok(self
            .graph
            .remove_patch_edge(edge_id, &mut self.interventions, &self.backend)?)
    }

    /// The part of the latest activations a node displays.
    pub fn node_activation(&self, node_id: &str) -> Option<ArrayViewD<'_, f32>> {
        let hook = self.graph.node(node_id)?.hook.as_ref()?;
        self.activations.get_slice(&hook.relation_id, &hook.slice)
    }
}
