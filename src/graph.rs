use crate::model_config::ModelConfig;
use crate::slice::SliceSpec;
use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type EdgeId = String;

/// Semantic tensor axis names used to check patch compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Axis {
    Batch,
    Seq,
    DModel,
    NHeads,
    DHead,
    QueryPos,
    KeyPos,
    DVocab,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeSignature(pub Vec<Axis>);

impl ShapeSignature {
    pub fn new(axes: &[Axis]) -> Self {
        Self(axes.to_vec())
    }

    pub fn empty() -> Self {
        Self(vec![])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum NodeKind {
    Embed,
    Query,
    Key,
    Value,
    Pattern,
    HeadPattern,
    Result,
    Residual,
    LayerNorm,
    Mlp,
    ModelOutput,
    Group,
    TextInput,
    TokenAnnotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Projection {
    Query,
    Key,
    Value,
}

impl Projection {
    pub const ALL: [Projection; 3] = [Projection::Query, Projection::Key, Projection::Value];

    fn name(&self) -> &'static str {
        match self {
            Projection::Query => "query",
            Projection::Key => "key",
            Projection::Value => "value",
        }
    }

    fn hook(&self) -> &'static str {
        match self {
            Projection::Query => "hook_q",
            Projection::Key => "hook_k",
            Projection::Value => "hook_v",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmbedSource {
    Token,
    Position,
}

/// Which sublayer a layer norm feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NormSite {
    Attention,
    Mlp,
}

/// `Mid` follows the attention sublayer, `Post` follows the MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResidualSite {
    Mid,
    Post,
}

/// Per-kind payload of a node. Each variant carries only what its renderer
/// needs; `kind()` gives the flat discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeData {
    TextInput,
    TokenAnnotation { label: String },
    Embed { source: EmbedSource },
    Projection { layer: usize, projection: Projection },
    Pattern { layer: usize },
    HeadPattern { layer: usize, head: usize, colour_id: usize },
    Result { layer: usize },
    Residual { layer: usize, site: ResidualSite },
    LayerNorm { layer: usize, site: NormSite },
    Mlp { layer: usize },
    ModelOutput,
    Group { layer: usize, width: f32, height: f32 },
}

impl NodeData {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeData::TextInput => NodeKind::TextInput,
            NodeData::TokenAnnotation { .. } => NodeKind::TokenAnnotation,
            NodeData::Embed { .. } => NodeKind::Embed,
            NodeData::Projection { projection, .. } => match projection {
                Projection::Query => NodeKind::Query,
                Projection::Key => NodeKind::Key,
                Projection::Value => NodeKind::Value,
            },
            NodeData::Pattern { .. } => NodeKind::Pattern,
            NodeData::HeadPattern { .. } => NodeKind::HeadPattern,
            NodeData::Result { .. } => NodeKind::Result,
            NodeData::Residual { .. } => NodeKind::Residual,
            NodeData::LayerNorm { .. } => NodeKind::LayerNorm,
            NodeData::Mlp { .. } => NodeKind::Mlp,
            NodeData::ModelOutput => NodeKind::ModelOutput,
            NodeData::Group { .. } => NodeKind::Group,
        }
    }

    pub fn label(&self) -> String {
        match self {
            NodeData::TextInput => "Input".to_string(),
            NodeData::TokenAnnotation { label } => label.clone(),
            NodeData::Embed { source } => match source {
                EmbedSource::Token => "Textual Embedding".to_string(),
                EmbedSource::Position => "Positional Embedding".to_string(),
            },
            NodeData::Projection { projection, .. } => projection.name().to_string(),
            NodeData::Pattern { .. } => "Pattern".to_string(),
            NodeData::HeadPattern { head, .. } => format!("Head {head}"),
            NodeData::Result { .. } => "Result".to_string(),
            NodeData::Residual { .. } => "Residual".to_string(),
            NodeData::LayerNorm { .. } => "Layer Norm".to_string(),
            NodeData::Mlp { .. } => "MLP".to_string(),
            NodeData::ModelOutput => "Output".to_string(),
            NodeData::Group { layer, .. } => format!("Layer {}", layer + 1),
        }
    }
}

/// The backend activation a node visualizes, and which part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookBinding {
    pub relation_id: String,
    pub slice: SliceSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: NodeId,
    pub data: NodeData,
    pub hook: Option<HookBinding>,
    pub input_signature: ShapeSignature,
    pub output_signature: ShapeSignature,
    /// Relative to the parent group when `parent_id` is set.
    pub position: Position,
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub dragging: bool,
    #[serde(default)]
    pub dimensions: Option<Dimensions>,
}

impl GraphNode {
    fn new(id: impl Into<NodeId>, data: NodeData, position: Position) -> Self {
        Self {
            id: id.into(),
            data,
            hook: None,
            input_signature: ShapeSignature::empty(),
            output_signature: ShapeSignature::empty(),
            position,
            parent_id: None,
            selected: false,
            dragging: false,
            dimensions: None,
        }
    }

    fn with_hook(mut self, relation_id: impl Into<String>, slice: SliceSpec) -> Self {
        self.hook = Some(HookBinding {
            relation_id: relation_id.into(),
            slice,
        });
        self
    }

    fn with_signatures(mut self, input: &[Axis], output: &[Axis]) -> Self {
        self.input_signature = ShapeSignature::new(input);
        self.output_signature = ShapeSignature::new(output);
        self
    }

    fn within(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    pub fn relation_id(&self) -> Option<&str> {
        self.hook.as_ref().map(|hook| hook.relation_id.as_str())
    }

    pub fn slice_spec(&self) -> Option<&SliceSpec> {
        self.hook.as_ref().map(|hook| &hook.slice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeStyle {
    Topology,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub deletable: bool,
    pub style: EdgeStyle,
    #[serde(default)]
    pub selected: bool,
}

impl GraphEdge {
    pub fn edge_id(source: &str, target: &str) -> EdgeId {
        format!("{source}-{target}")
    }

    pub fn topology(source: &str, target: &str) -> Self {
        Self {
            id: Self::edge_id(source, target),
            source: source.to_string(),
            target: target.to_string(),
            deletable: false,
            style: EdgeStyle::Topology,
            selected: false,
        }
    }

    /// Patch edges live in their own id space so a patch between two nodes
    /// that are also wired topologically never collides with that edge.
    pub fn patch_edge_id(source: &str, target: &str) -> EdgeId {
        format!("patch:{source}-{target}")
    }

    pub fn patch(source: &str, target: &str) -> Self {
        Self {
            id: Self::patch_edge_id(source, target),
            source: source.to_string(),
            target: target.to_string(),
            deletable: true,
            style: EdgeStyle::Patch,
            selected: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

pub const TEXT_NODE_ID: &str = "text";
pub const SUB_WORDS_NODE_ID: &str = "tokenizedWords";
pub const TOKENS_NODE_ID: &str = "tokens";
pub const TOKEN_EMBED_NODE_ID: &str = "we";
pub const POS_EMBED_NODE_ID: &str = "pos";
pub const OUTPUT_NODE_ID: &str = "output";

struct LayoutConstants {
    x_offset: f32,
    layer_padding: f32,
    layer_internal_padding: f32,
    layer_width: f32,
    layer_height: f32,
    x_start_offset: f32,
}

impl LayoutConstants {
    fn for_heads(n_heads: usize) -> Self {
        Self {
            x_offset: 120.0,
            layer_padding: 500.0,
            layer_internal_padding: 20.0,
            layer_width: 20.0 * 2.0 + n_heads as f32 * 120.0,
            layer_height: 900.0,
            x_start_offset: -400.0,
        }
    }

    fn layer_stride(&self) -> f32 {
        self.layer_height + self.layer_padding
    }

    /// Vertical anchor for nodes that sit outside the group of layer `i`.
    fn outside_y(&self, i: usize) -> f32 {
        -self.layer_height - self.layer_padding - i as f32 * self.layer_stride()
    }
}

struct LayerIds {
    layer: String,
    attn_layer_norm: String,
    pattern: String,
    result: String,
    residual: String,
    mlp_layer_norm: String,
    mlp: String,
    mlp_residual: String,
}

impl LayerIds {
    fn new(i: usize) -> Self {
        let layer = format!("blocks.{i}");
        Self {
            attn_layer_norm: format!("{layer}.ln1"),
            pattern: format!("{layer}.pattern"),
            result: format!("{layer}.result"),
            residual: format!("{layer}.hook_resid_mid"),
            mlp_layer_norm: format!("{layer}.ln2"),
            mlp: format!("{layer}.mlp"),
            mlp_residual: format!("{layer}.hook_resid_post"),
            layer,
        }
    }

    fn projection(&self, projection: Projection) -> String {
        format!("{}.{}", self.layer, projection.name())
    }

    fn head_pattern(&self, head: usize) -> String {
        format!("{}.headPattern{head}", self.layer)
    }

    /// The residual this layer hands to the next one.
    fn final_residual(&self, attn_only: bool) -> &str {
        if attn_only { &self.residual } else { &self.mlp_residual }
    }
}

const RESIDUAL_AXES: [Axis; 3] = [Axis::Batch, Axis::Seq, Axis::DModel];
const HEAD_AXES: [Axis; 4] = [Axis::Batch, Axis::Seq, Axis::NHeads, Axis::DHead];
const PATTERN_AXES: [Axis; 4] = [Axis::Batch, Axis::NHeads, Axis::QueryPos, Axis::KeyPos];

/// Head axis of `blocks.{i}.attn.hook_pattern` (`[batch, n_heads, query, key]`).
pub const PATTERN_HEAD_AXIS: usize = 1;

/// Slice of the attention pattern that addresses exactly one head.
pub fn head_slice(head: usize) -> SliceSpec {
    SliceSpec::narrowed(PATTERN_AXES.len(), PATTERN_HEAD_AXIS, head as i64)
}

pub fn pattern_relation(layer: usize) -> String {
    format!("blocks.{layer}.attn.hook_pattern")
}

/// Derives the static computation graph of a transformer from its config.
///
/// Node ids are a pure function of layer and head indices so that other parts
/// of the system can address `blocks.{i}.headPattern{j}` without a lookup.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn build(config: &ModelConfig) -> Graph {
        if !config.is_well_formed() {
            log::warn!(
                "Model config has {} layers and {} heads, building an empty graph",
                config.n_layers,
                config.n_heads
            );
            return Graph::default();
        }
        let n_layers = config.layers();
        let n_heads = config.heads();
        let constants = LayoutConstants::for_heads(n_heads);

        let mut graph = Self::input_prelude();
        for i in 0..n_layers {
            let ids = LayerIds::new(i);
            let previous_residuals: Vec<String> = if i == 0 {
                vec![TOKEN_EMBED_NODE_ID.to_string(), POS_EMBED_NODE_ID.to_string()]
            } else {
                vec![LayerIds::new(i - 1).final_residual(config.attn_only).to_string()]
            };
            Self::push_layer_nodes(&mut graph.nodes, i, n_heads, config.attn_only, &ids, &constants);
            Self::push_layer_edges(
                &mut graph.edges,
                n_heads,
                config.attn_only,
                &ids,
                &previous_residuals,
            );
            if i + 1 == n_layers {
                graph.nodes.push(
                    GraphNode::new(
                        OUTPUT_NODE_ID,
                        NodeData::ModelOutput,
                        Position::new(-200.0, constants.outside_y(i) - 800.0),
                    )
                    .with_signatures(&RESIDUAL_AXES, &[Axis::Batch, Axis::Seq, Axis::DVocab]),
                );
                graph
                    .edges
                    .push(GraphEdge::topology(ids.final_residual(config.attn_only), OUTPUT_NODE_ID));
            }
        }
        log::debug!(
            "Built graph with {} nodes and {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        graph
    }

    fn input_prelude() -> Graph {
        let nodes = vec![
            GraphNode::new(TEXT_NODE_ID, NodeData::TextInput, Position::new(-200.0, 400.0))
                .with_signatures(&[], &[Axis::Batch]),
            GraphNode::new(
                SUB_WORDS_NODE_ID,
                NodeData::TokenAnnotation {
                    label: "Sub Words".to_string(),
                },
                Position::new(-200.0, 300.0),
            )
            .with_signatures(&[Axis::Batch], &[Axis::Batch, Axis::Seq]),
            GraphNode::new(
                TOKENS_NODE_ID,
                NodeData::TokenAnnotation {
                    label: "Tokens".to_string(),
                },
                Position::new(-200.0, 200.0),
            )
            .with_signatures(&[Axis::Batch, Axis::Seq], &[Axis::Batch, Axis::Seq]),
            GraphNode::new(
                TOKEN_EMBED_NODE_ID,
                NodeData::Embed {
                    source: EmbedSource::Token,
                },
                Position::new(-200.0, -200.0),
            )
            .with_hook("hook_embed", SliceSpec::full(RESIDUAL_AXES.len()))
            .with_signatures(&[Axis::Batch, Axis::Seq], &RESIDUAL_AXES),
            GraphNode::new(
                POS_EMBED_NODE_ID,
                NodeData::Embed {
                    source: EmbedSource::Position,
                },
                Position::new(200.0, -200.0),
            )
            .with_hook("hook_pos_embed", SliceSpec::full(RESIDUAL_AXES.len()))
            .with_signatures(&[Axis::Batch, Axis::Seq], &RESIDUAL_AXES),
        ];
        let edges = vec![
            GraphEdge::topology(TEXT_NODE_ID, SUB_WORDS_NODE_ID),
            GraphEdge::topology(SUB_WORDS_NODE_ID, TOKENS_NODE_ID),
            GraphEdge::topology(TOKENS_NODE_ID, TOKEN_EMBED_NODE_ID),
            GraphEdge::topology(TOKENS_NODE_ID, POS_EMBED_NODE_ID),
        ];
        Graph { nodes, edges }
    }

    fn push_layer_nodes(
        nodes: &mut Vec<GraphNode>,
        i: usize,
        n_heads: usize,
        attn_only: bool,
        ids: &LayerIds,
        c: &LayoutConstants,
    ) {
        let layer = i;
        nodes.push(GraphNode::new(
            &ids.layer,
            NodeData::Group {
                layer,
                width: c.layer_width,
                height: c.layer_height,
            },
            Position::new(
                -c.layer_width + c.x_start_offset,
                -((i + 1) as f32) * c.layer_stride(),
            ),
        ));
        nodes.push(
            GraphNode::new(
                &ids.attn_layer_norm,
                NodeData::LayerNorm {
                    layer,
                    site: NormSite::Attention,
                },
                Position::new(c.layer_width / 2.0 - 50.0, 850.0),
            )
            .with_hook(
                format!("{}.ln1.hook_normalized", ids.layer),
                SliceSpec::full(RESIDUAL_AXES.len()),
            )
            .with_signatures(&RESIDUAL_AXES, &RESIDUAL_AXES)
            .within(&ids.layer),
        );
        for (index, projection) in Projection::ALL.into_iter().enumerate() {
            let y = if projection == Projection::Value { 200.0 } else { 700.0 };
            nodes.push(
                GraphNode::new(
                    ids.projection(projection),
                    NodeData::Projection { layer, projection },
                    Position::new(20.0 + index as f32 * 400.0, c.layer_internal_padding + y),
                )
                .with_hook(
                    format!("{}.attn.{}", ids.layer, projection.hook()),
                    SliceSpec::full(HEAD_AXES.len()),
                )
                .with_signatures(&RESIDUAL_AXES, &HEAD_AXES)
                .within(&ids.layer),
            );
        }
        nodes.push(
            GraphNode::new(
                &ids.pattern,
                NodeData::Pattern { layer },
                Position::new(600.0, 200.0 + c.layer_internal_padding),
            )
            .with_hook(pattern_relation(layer), SliceSpec::full(PATTERN_AXES.len()))
            .with_signatures(&PATTERN_AXES, &PATTERN_AXES)
            .within(&ids.layer),
        );
        for head in 0..n_heads {
            nodes.push(
                GraphNode::new(
                    ids.head_pattern(head),
                    NodeData::HeadPattern {
                        layer,
                        head,
                        colour_id: head,
                    },
                    Position::new(
                        20.0 + head as f32 * c.x_offset,
                        400.0 + c.layer_internal_padding,
                    ),
                )
                .with_hook(pattern_relation(layer), head_slice(head))
                .with_signatures(&HEAD_AXES, &PATTERN_AXES)
                .within(&ids.layer),
            );
        }
        nodes.push(
            GraphNode::new(
                &ids.result,
                NodeData::Result { layer },
                Position::new(600.0, c.layer_internal_padding),
            )
            .with_hook(
                format!("{}.attn.hook_z", ids.layer),
                SliceSpec::full(HEAD_AXES.len()),
            )
            .with_signatures(&PATTERN_AXES, &HEAD_AXES)
            .within(&ids.layer),
        );
        nodes.push(
            GraphNode::new(
                &ids.residual,
                NodeData::Residual {
                    layer,
                    site: ResidualSite::Mid,
                },
                Position::new(0.0, c.outside_y(i) - 200.0),
            )
            .with_hook(ids.residual.clone(), SliceSpec::full(RESIDUAL_AXES.len()))
            .with_signatures(&RESIDUAL_AXES, &RESIDUAL_AXES),
        );
        if attn_only {
            return;
        }
        let mlp_x = -c.layer_width / 2.5;
        let mlp_anchor = -((i + 1) as f32) * c.layer_stride();
        nodes.push(
            GraphNode::new(
                &ids.mlp_layer_norm,
                NodeData::LayerNorm {
                    layer,
                    site: NormSite::Mlp,
                },
                Position::new(mlp_x, mlp_anchor - 220.0),
            )
            .with_hook(
                format!("{}.ln2.hook_normalized", ids.layer),
                SliceSpec::full(RESIDUAL_AXES.len()),
            )
            .with_signatures(&RESIDUAL_AXES, &RESIDUAL_AXES),
        );
        nodes.push(
            GraphNode::new(
                &ids.mlp,
                NodeData::Mlp { layer },
                Position::new(mlp_x, mlp_anchor - 320.0),
            )
            .with_hook(
                format!("{}.hook_mlp_out", ids.layer),
                SliceSpec::full(RESIDUAL_AXES.len()),
            )
            .with_signatures(&RESIDUAL_AXES, &RESIDUAL_AXES),
        );
        nodes.push(
            GraphNode::new(
                &ids.mlp_residual,
                NodeData::Residual {
                    layer,
                    site: ResidualSite::Post,
                },
                Position::new(0.0, c.outside_y(i) - 500.0),
            )
            .with_hook(ids.mlp_residual.clone(), SliceSpec::full(RESIDUAL_AXES.len()))
            .with_signatures(&RESIDUAL_AXES, &RESIDUAL_AXES),
        );
    }

    fn push_layer_edges(
        edges: &mut Vec<GraphEdge>,
        n_heads: usize,
        attn_only: bool,
        ids: &LayerIds,
        previous_residuals: &[String],
    ) {
        for previous in previous_residuals {
            edges.push(GraphEdge::topology(previous, &ids.layer));
            edges.push(GraphEdge::topology(previous, &ids.attn_layer_norm));
        }
        for projection in Projection::ALL {
            edges.push(GraphEdge::topology(
                &ids.attn_layer_norm,
                &ids.projection(projection),
            ));
        }
        for projection in [Projection::Query, Projection::Key] {
            let source = ids.projection(projection);
            for head in 0..n_heads {
                edges.push(GraphEdge::topology(&source, &ids.head_pattern(head)));
            }
        }
        for head in 0..n_heads {
            edges.push(GraphEdge::topology(&ids.head_pattern(head), &ids.pattern));
        }
        edges.push(GraphEdge::topology(&ids.pattern, &ids.result));
        edges.push(GraphEdge::topology(
            &ids.projection(Projection::Value),
            &ids.result,
        ));
        edges.push(GraphEdge::topology(&ids.result, &ids.residual));
        for previous in previous_residuals {
            edges.push(GraphEdge::topology(previous, &ids.residual));
        }
        if !attn_only {
            edges.push(GraphEdge::topology(&ids.residual, &ids.mlp_residual));
            edges.push(GraphEdge::topology(&ids.residual, &ids.mlp_layer_norm));
            edges.push(GraphEdge::topology(&ids.mlp_layer_norm, &ids.mlp));
            edges.push(GraphEdge::topology(&ids.mlp, &ids.mlp_residual));
        }
    }
}
