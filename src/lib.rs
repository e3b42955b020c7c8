pub mod activation_cache;
pub mod backend;
pub mod config;
pub mod graph;
pub mod inference;
pub mod interventions;
pub mod model_config;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod slice;
pub mod sync;

pub use activation_cache::{ActivationCache, RawTensor, TensorDecodeError};
pub use backend::{Backend, BackendError, HttpBackend};
pub use config::{ClientConfig, ConfigError};
pub use graph::{Graph, GraphBuilder, GraphEdge, GraphNode, NodeData, NodeKind};
pub use inference::{InferenceOutput, InferenceTicket, InferenceTracker, PromptState};
pub use interventions::{AblationType, InterventionStore, ModelAblations, ModelPatches};
pub use model_config::{ModelConfig, ModelDescriptor};
pub use runtime::{ConnectionError, EdgeChange, GraphRuntimeStore, NodeChange};
pub use session::{Session, SessionError};
pub use slice::{SliceKey, SliceRange, SliceSpec};
pub use sync::{LogicalClock, SyncEngine};
