use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The subset of a HookedTransformer config that drives graph construction.
///
/// Counts are signed so that a malformed config coming off the wire still
/// deserializes; `GraphBuilder` turns non-positive counts into an empty graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelConfig {
    pub n_layers: i64,
    pub n_heads: i64,
    #[serde(default)]
    pub attn_only: bool,
}

impl ModelConfig {
    pub fn new(n_layers: i64, n_heads: i64, attn_only: bool) -> Self {
        Self {
            n_layers,
            n_heads,
            attn_only,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.n_layers > 0 && self.n_heads > 0
    }

    pub(crate) fn layers(&self) -> usize {
        usize::try_from(self.n_layers).unwrap_or(0)
    }

    pub(crate) fn heads(&self) -> usize {
        usize::try_from(self.n_heads).unwrap_or(0)
    }
}

/// One entry of `/api/models/getModels`. Only the name is interpreted, the
/// remaining config fields are kept so they can be shown as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_name: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}
