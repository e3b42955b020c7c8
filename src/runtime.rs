use crate::backend::{Backend, BackendError};
use crate::graph::{
    Dimensions, EdgeId, EdgeStyle, GraphBuilder, GraphEdge, GraphNode, HookBinding, NodeId,
    Position, ShapeSignature,
};
use crate::interventions::{AblationType, InterventionStore, ModelPatches};
use crate::model_config::ModelConfig;
use crate::slice::SliceKey;
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
    #[error(
        "Cannot patch {source_id} into {target_id}: output {output:?} does not match input {input:?}"
    )]
    SignatureMismatch {
        source_id: NodeId,
        target_id: NodeId,
        output: ShapeSignature,
        input: ShapeSignature,
    },
    #[error("Node {0} does not expose an activation")]
    Unbound(NodeId),
    #[error("Cannot patch {0} into itself")]
    SelfPatch(NodeId),
    #[error("Server did not apply the patch change {source_id} -> {target_id}")]
    Rejected { source_id: NodeId, target_id: NodeId },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// UI driven change to a single node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChange {
    Position {
        id: NodeId,
        position: Option<Position>,
        dragging: bool,
    },
    Select {
        id: NodeId,
        selected: bool,
    },
    Dimensions {
        id: NodeId,
        dimensions: Dimensions,
    },
}

/// UI driven change to a single edge. Edge removal goes through
/// [`GraphRuntimeStore::remove_patch_edge`] so the patch is withdrawn too.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeChange {
    Select { id: EdgeId, selected: bool },
}

/// Live node and edge arrays behind the canvas.
#[derive(Debug, Clone, Default)]
pub struct GraphRuntimeStore {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    patch_targets: Option<HashSet<NodeId>>,
}

impl GraphRuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        let mut store = Self::new();
        store.reset(config);
        store
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|edge| edge.id == id)
    }

    /// Rebuild from scratch; positions, selections and patch edges are dropped.
    pub fn reset(&mut self, config: &ModelConfig) {
        let graph = GraphBuilder::build(config);
        self.nodes = graph.nodes;
        self.edges = graph.edges;
        self.patch_targets = None;
    }

    /// Changes addressing unknown ids are skipped.
    pub fn apply_node_changes(&mut self, changes: impl IntoIterator<Item = NodeChange>) {
        let mut nodes = self.nodes.clone();
        let index: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();
        for change in changes {
            let id = match &change {
                NodeChange::Position { id, .. }
                | NodeChange::Select { id, .. }
                | NodeChange::Dimensions { id, .. } => id,
            };
            let Some(node) = index.get(id).map(|i| &mut nodes[*i]) else {
                log::debug!("Ignoring change for unknown node {id}");
                continue;
            };
            match change {
                NodeChange::Position {
                    position, dragging, ..
                } => {
                    if let Some(position) = position {
                        node.position = position;
                    }
                    node.dragging = dragging;
                }
                NodeChange::Select { selected, .. } => node.selected = selected,
                NodeChange::Dimensions { dimensions, .. } => node.dimensions = Some(dimensions),
            }
        }
        self.nodes = nodes;
    }

    pub fn apply_edge_changes(&mut self, changes: impl IntoIterator<Item = EdgeChange>) {
        let mut edges = self.edges.clone();
        for change in changes {
            match change {
                EdgeChange::Select { id, selected } => {
                    if let Some(edge) = edges.iter_mut().find(|edge| edge.id == id) {
                        edge.selected = selected;
                    }
                }
            }
        }
        self.edges = edges;
    }

    /// Nodes that could receive a patch from `node_id`: those whose input
    /// signature equals its output signature. Returns `None` for an unknown node.
    pub fn begin_patch_drag(&mut self, node_id: &str) -> Option<&HashSet<NodeId>> {
        let Some(source) = self.node(node_id) else {
            self.patch_targets = None;
            return None;
        };
        let targets: HashSet<NodeId> = self
            .nodes
            .iter()
            .filter(|node| node.input_signature == source.output_signature)
            .map(|node| node.id.clone())
            .collect();
        log::debug!("{} patch targets for {node_id}", targets.len());
        self.patch_targets = Some(targets);
        self.patch_targets.as_ref()
    }

    pub fn end_patch_drag(&mut self) {
        self.patch_targets = None;
    }

    pub fn patch_targets(&self) -> Option<&HashSet<NodeId>> {
        self.patch_targets.as_ref()
    }

    pub fn is_patching(&self) -> bool {
        self.patch_targets.is_some()
    }

    /// Whether the canvas should render `node_id` greyed out.
    pub fn is_greyed_out(&self, node_id: &str) -> bool {
        self.patch_targets
            .as_ref()
            .is_some_and(|targets| !targets.contains(node_id))
    }

    /// Direction matters: compares the source's output with the target's input.
    pub fn validate_connection(&self, source_id: &str, target_id: &str) -> bool {
        match (self.node(source_id), self.node(target_id)) {
            (Some(source), Some(target)) => source.output_signature == target.input_signature,
            _ => false,
        }
    }

    fn connection_hooks(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> Result<(HookBinding, HookBinding), ConnectionError> {
        if source_id == target_id {
            return Err(ConnectionError::SelfPatch(source_id.to_string()));
        }
        let source = self
            .node(source_id)
            .ok_or_else(|| ConnectionError::UnknownNode(source_id.to_string()))?;
        let target = self
            .node(target_id)
            .ok_or_else(|| ConnectionError::UnknownNode(target_id.to_string()))?;
        if source.output_signature != target.input_signature {
            return Err(ConnectionError::SignatureMismatch {
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
                output: source.output_signature.clone(),
                input: target.input_signature.clone(),
            });
        }
        let source_hook = source
            .hook
            .clone()
            .ok_or_else(|| ConnectionError::Unbound(source_id.to_string()))?;
        let target_hook = target
            .hook
            .clone()
            .ok_or_else(|| ConnectionError::Unbound(target_id.to_string()))?;
        if source_hook == target_hook {
            return Err(ConnectionError::SelfPatch(source_id.to_string()));
        }
        Ok((source_hook, target_hook))
    }

    fn bound_hook(&self, node_id: &str) -> Result<HookBinding, ConnectionError> {
        self.node(node_id)
            .ok_or_else(|| ConnectionError::UnknownNode(node_id.to_string()))?
            .hook
            .clone()
            .ok_or_else(|| ConnectionError::Unbound(node_id.to_string()))
    }

    /// Replace the patch edges with one edge per patch in `patches`. Selection
    /// carries over to edges that survive; patches between activations no node
    /// displays get no edge.
    pub fn sync_patch_edges(&mut self, patches: &ModelPatches) {
        let by_hook: HashMap<(String, SliceKey), NodeId> = self
            .nodes
            .iter()
            .filter_map(|node| {
                let hook = node.hook.as_ref()?;
                Some(((hook.relation_id.clone(), hook.slice.key()), node.id.clone()))
            })
            .collect();
        let selected: HashSet<EdgeId> = self
            .edges
            .iter()
            .filter(|edge| edge.style == EdgeStyle::Patch && edge.selected)
            .map(|edge| edge.id.clone())
            .collect();
        let mut edges: Vec<GraphEdge> = self
            .edges
            .iter()
            .filter(|edge| edge.style != EdgeStyle::Patch)
            .cloned()
            .collect();
        for (source_relation_id, records) in &patches.0 {
            for (source_key, record) in records {
                let Some(source_id) = by_hook.get(&(source_relation_id.clone(), source_key.clone()))
                else {
                    log::debug!("No node displays patch source {source_relation_id} {source_key:?}");
                    continue;
                };
                for (target_relation_id, targets) in &record.edges {
                    for target_key in targets.keys() {
                        let Some(target_id) =
                            by_hook.get(&(target_relation_id.clone(), target_key.clone()))
                        else {
                            log::debug!(
                                "No node displays patch target {target_relation_id} {target_key:?}"
                            );
                            continue;
                        };
                        let mut edge = GraphEdge::patch(source_id, target_id);
                        edge.selected = selected.contains(&edge.id);
                        edges.push(edge);
                    }
                }
            }
        }
        self.edges = edges;
    }

    /// Turn a dropped connection into a patch. The edge only appears once the
    /// server holds the patch; an invalid connection never reaches the backend.
    pub fn complete_connection<B: Backend + ?Sized>(
        &mut self,
        source_id: &str,
        target_id: &str,
        interventions: &mut InterventionStore,
        backend: &B,
    ) -> Result<(), ConnectionError> {
        let (source, target) = self.connection_hooks(source_id, target_id).inspect_err(|err| {
            log::warn!("Rejected connection: {err}");
        })?;
        interventions.add_patch(
            backend,
            &source.relation_id,
            &source.slice,
            &target.relation_id,
            &target.slice,
        )?;
        self.sync_patch_edges(interventions.patches());
        self.end_patch_drag();
        let applied = interventions
            .patches()
            .get(&source.relation_id, &source.slice)
            .is_some_and(|record| record.has_edge(&target.relation_id, &target.slice));
        if !applied {
            log::warn!("Server answered without the patch {source_id} -> {target_id}");
            return Err(ConnectionError::Rejected {
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
            });
        }
        Ok(())
    }

    /// Withdraw the patch behind a patch edge; the edge goes once the server
    /// no longer holds the patch. Returns `false` for unknown or non-deletable
    /// edges.
    pub fn remove_patch_edge<B: Backend + ?Sized>(
        &mut self,
        edge_id: &str,
        interventions: &mut InterventionStore,
        backend: &B,
    ) -> Result<bool, ConnectionError> {
        let Some(edge) = self.edge(edge_id).filter(|edge| edge.deletable).cloned() else {
            return Ok(false);
        };
        let source = self.bound_hook(&edge.source)?;
        let target = self.bound_hook(&edge.target)?;
        interventions.remove_patch(
            backend,
            &source.relation_id,
            &source.slice,
            &target.relation_id,
            &target.slice,
        )?;
        self.sync_patch_edges(interventions.patches());
        if self.edge(&edge.id).is_some() {
            log::warn!("Server kept the patch {} -> {}", edge.source, edge.target);
            return Err(ConnectionError::Rejected {
                source_id: edge.source,
                target_id: edge.target,
            });
        }
        Ok(true)
    }

    /// Ablation currently applied to the exact region a node displays.
    pub fn node_ablation(
        &self,
        node_id: &str,
        interventions: &InterventionStore,
    ) -> Option<AblationType> {
        let hook = self.node(node_id)?.hook.as_ref()?;
        interventions
            .ablations()
            .get(&hook.relation_id, &hook.slice)
            .map(|record| record.ablation_type)
    }

    pub fn ablated_nodes(&self, interventions: &InterventionStore) -> HashSet<NodeId> {
        self.nodes
            .iter()
            .filter(|node| self.node_ablation(&node.id, interventions).is_some())
            .map(|node| node.id.clone())
            .collect()
    }
}
