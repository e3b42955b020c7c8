mod common;

use common::{MockBackend, inference_response};
use transpector::graph::{GraphEdge, head_slice};
use transpector::{
    AblationType, BackendError, ConnectionError, ModelAblations, ModelConfig, ModelPatches,
    NodeKind, Session, SessionError, SliceSpec,
};

fn session() -> Session<MockBackend> {
    common::init_logging();
    let backend = MockBackend::new()
        .with_model("gpt2", ModelConfig::new(2, 2, false))
        .with_model("attn-only-2l", ModelConfig::new(2, 4, true));
    let mut session = Session::new(backend);
    session.select_model("gpt2").unwrap();
    session
}

#[test]
fn test_select_model_rebuilds_graph() {
    let mut session = session();
    assert_eq!(session.model_name(), Some("gpt2"));
    assert!(session.graph().node("blocks.1.mlp").is_some());

    session.run_inference().unwrap();
    assert!(session.output().is_some());

    let config = *session.select_model("attn-only-2l").unwrap();
    assert_eq!(config, ModelConfig::new(2, 4, true));
    assert_eq!(
        session.backend().state.borrow().model_name.as_deref(),
        Some("attn-only-2l")
    );
    assert!(session.graph().node("blocks.1.mlp").is_none());
    assert!(session.graph().node("blocks.1.headPattern3").is_some());
    assert!(session.activations().is_empty());
    assert!(session.output().is_none());
}

#[test]
fn test_unknown_model_keeps_previous_graph() {
    let mut session = session();
    let nodes = session.graph().nodes().len();
    assert!(matches!(
        session.load_model_config("missing"),
        Err(SessionError::Backend(BackendError::Status { status: 404, .. }))
    ));
    assert_eq!(session.graph().nodes().len(), nodes);
    assert_eq!(session.model_name(), Some("gpt2"));
}

#[test]
fn test_failed_model_switch_changes_nothing() {
    let mut session = session();
    session.run_inference().unwrap();
    let nodes = session.graph().nodes().len();
    assert!(matches!(
        session.select_model("missing"),
        Err(SessionError::Backend(BackendError::Status { status: 404, .. }))
    ));
    assert_eq!(
        session.backend().state.borrow().model_name.as_deref(),
        Some("gpt2")
    );
    assert_eq!(session.model_name(), Some("gpt2"));
    assert_eq!(session.model_config(), Some(&ModelConfig::new(2, 2, false)));
    assert_eq!(session.graph().nodes().len(), nodes);
    assert!(session.output().is_some());
    assert!(!session.activations().is_empty());
}

#[test]
fn test_model_switch_drops_inference_in_flight() {
    let mut session = session();
    let ticket = session.begin_inference();
    session.select_model("attn-only-2l").unwrap();
    assert!(!session.inferencing());
    let applied = session
        .complete_inference(ticket, Ok(inference_response(&["hook_embed"])))
        .unwrap();
    assert!(!applied);
    assert!(session.activations().is_empty());
    assert!(session.output().is_none());
}

#[test]
fn test_select_default_model() {
    let backend = MockBackend::new().with_model("attn-only-2l", ModelConfig::new(2, 4, true));
    let mut session = Session::new(backend).with_default_model("attn-only-2l");
    assert_eq!(session.default_model(), "attn-only-2l");
    session.select_default_model().unwrap();
    assert_eq!(session.model_name(), Some("attn-only-2l"));
    assert_eq!(
        session.backend().state.borrow().model_name.as_deref(),
        Some("attn-only-2l")
    );
}

#[test]
fn test_session_config_ablations_are_adopted() {
    let ablations = ModelAblations::new().with_ablations(
        "blocks.0.attn.hook_pattern",
        &[head_slice(1)],
        AblationType::Zero,
    );
    let backend = MockBackend::new()
        .with_model("gpt2", ModelConfig::new(1, 2, false))
        .with_session_ablations("gpt2", ablations.clone());
    let mut session = Session::new(backend);
    session.load_model_config("gpt2").unwrap();
    assert_eq!(session.interventions().ablations(), &ablations);
    assert!(
        session
            .graph()
            .ablated_nodes(session.interventions())
            .contains("blocks.0.headPattern1")
    );
}

#[test]
fn test_list_models() {
    let mut session = session();
    let names: Vec<String> = session
        .list_models()
        .unwrap()
        .iter()
        .map(|model| model.model_name.clone())
        .collect();
    assert_eq!(names, vec!["attn-only-2l".to_string(), "gpt2".to_string()]);
}

#[test]
fn test_inference_replaces_activations() {
    let mut session = session();
    session
        .backend()
        .push_inference(Ok(inference_response(&["hook_embed", "blocks.0.hook_resid_mid"])));
    session
        .backend()
        .push_inference(Ok(inference_response(&["hook_pos_embed"])));

    assert!(session.run_inference().unwrap());
    assert!(session.activations().get("hook_embed").is_some());
    assert!(session.node_activation("we").is_some());

    assert!(session.run_inference().unwrap());
    assert!(session.activations().get("hook_embed").is_none());
    assert!(session.activations().get("blocks.0.hook_resid_mid").is_none());
    assert_eq!(session.activations().len(), 1);
    assert_eq!(session.node_activation("pos").unwrap().shape(), &[1, 2, 3]);

    let output = session.output().unwrap();
    assert_eq!(output.top_tokens(), vec![1, 0]);
    assert_eq!(output.final_loss, 2.375);
}

#[test]
fn test_stale_inference_response_is_dropped() {
    let mut session = session();
    let first = session.begin_inference();
    let second = session.begin_inference();
    assert!(session.inferencing());

    let applied = session
        .complete_inference(second, Ok(inference_response(&["hook_pos_embed"])))
        .unwrap();
    assert!(applied);
    assert!(!session.inferencing());

    let applied = session
        .complete_inference(first, Ok(inference_response(&["hook_embed"])))
        .unwrap();
    assert!(!applied);
    assert!(session.activations().contains("hook_pos_embed"));
    assert!(!session.activations().contains("hook_embed"));
}

#[test]
fn test_failed_inference_keeps_activations() {
    let mut session = session();
    session.run_inference().unwrap();
    session.backend().offline.set(true);
    assert!(session.run_inference().is_err());
    assert!(!session.inferencing());
    assert!(session.activations().contains("hook_embed"));
}

#[test]
fn test_prompt_tokenization() {
    let mut session = session();
    session.update_input_text("The cat sat").unwrap();
    assert_eq!(session.prompt().input_text, vec!["The cat sat".to_string()]);
    assert_eq!(session.prompt().input_tokens, vec![vec![3, 3, 3]]);
    assert_eq!(session.prompt().input_sub_words[0].len(), 3);

    session.backend().offline.set(true);
    assert!(session.update_input_text("Hello").is_err());
    assert_eq!(session.prompt().input_text, vec!["Hello".to_string()]);
    assert_eq!(session.prompt().input_tokens, vec![vec![3, 3, 3]]);
}

#[test]
fn test_patch_edge_lifecycle() {
    let mut session = session();
    let targets = session.graph_mut().begin_patch_drag("we").unwrap().clone();
    assert!(targets.contains("blocks.1.ln1"));
    assert!(targets.contains("blocks.0.query"));
    assert!(!targets.contains("blocks.0.headPattern0"));

    session.complete_connection("we", "blocks.1.ln1").unwrap();
    let edge_id = GraphEdge::patch_edge_id("we", "blocks.1.ln1");
    assert!(session.graph().edge(&edge_id).is_some());
    assert_eq!(
        session
            .backend()
            .state
            .borrow()
            .patches
            .get("hook_embed", &SliceSpec::full(3))
            .map(|record| record.edge_count()),
        Some(1)
    );

    assert!(session.remove_patch_edge(&edge_id).unwrap());
    assert!(session.graph().edge(&edge_id).is_none());
    assert!(session.interventions().patches().is_empty());
}

#[test]
fn test_stale_connection_shows_no_edge() {
    let mut session = session();
    session.backend().remote_ablations(ModelAblations::new(), 10);
    let edge_id = GraphEdge::patch_edge_id("we", "blocks.1.ln1");
    assert!(matches!(
        session.complete_connection("we", "blocks.1.ln1"),
        Err(SessionError::Connection(ConnectionError::Rejected { .. }))
    ));
    assert!(session.graph().edge(&edge_id).is_none());
    assert!(session.interventions().patches().is_empty());
    assert!(session.backend().state.borrow().patches.is_empty());

    // Caught up by the rejection, the same drop now goes through.
    session.complete_connection("we", "blocks.1.ln1").unwrap();
    assert!(session.graph().edge(&edge_id).is_some());
}

#[test]
fn test_patch_edges_survive_model_switch() {
    let mut session = session();
    session.complete_connection("we", "blocks.1.ln1").unwrap();
    session.select_model("attn-only-2l").unwrap();
    let edge_id = GraphEdge::patch_edge_id("we", "blocks.1.ln1");
    assert!(session.graph().edge(&edge_id).is_some());
    assert_eq!(session.interventions().patches().len(), 1);
    assert_eq!(session.backend().state.borrow().patches.len(), 1);

    assert!(session.remove_patch_edge(&edge_id).unwrap());
    assert!(session.backend().state.borrow().patches.is_empty());
}

#[test]
fn test_refresh_shows_remote_patch_edges() {
    let mut session = session();
    session.complete_connection("we", "blocks.1.ln1").unwrap();
    let residual = SliceSpec::full(3);
    let remote = ModelPatches::new().with_patch(
        "hook_pos_embed",
        &residual,
        "blocks.0.ln1.hook_normalized",
        &residual,
    );
    session.backend().remote_patches(remote.clone(), 7);

    session.refresh_interventions().unwrap();
    assert_eq!(session.interventions().patches(), &remote);
    assert!(
        session
            .graph()
            .edge(&GraphEdge::patch_edge_id("pos", "blocks.0.ln1"))
            .is_some()
    );
    assert!(
        session
            .graph()
            .edge(&GraphEdge::patch_edge_id("we", "blocks.1.ln1"))
            .is_none()
    );
}

#[test]
fn test_self_connection_is_refused() {
    let mut session = session();
    assert!(matches!(
        session.complete_connection("blocks.0.ln1", "blocks.0.ln1"),
        Err(SessionError::Connection(ConnectionError::SelfPatch(_)))
    ));
    assert_eq!(session.backend().state.borrow().sync_requests, 0);
}

#[test]
fn test_invalid_connection_is_not_synced() {
    let mut session = session();
    let edges = session.graph().edges().len();
    assert!(!session.graph().validate_connection("blocks.0.pattern", "blocks.0.mlp"));
    assert!(matches!(
        session.complete_connection("blocks.0.pattern", "blocks.0.mlp"),
        Err(SessionError::Connection(_))
    ));
    assert_eq!(session.graph().edges().len(), edges);
    assert_eq!(session.backend().state.borrow().sync_requests, 0);
}

#[test]
fn test_toggle_node_ablation() {
    let mut session = session();
    session
        .toggle_node_ablation("blocks.0.headPattern1", AblationType::Zero)
        .unwrap();
    assert_eq!(
        session
            .graph()
            .node_ablation("blocks.0.headPattern1", session.interventions()),
        Some(AblationType::Zero)
    );

    session
        .toggle_node_ablation("blocks.0.headPattern1", AblationType::Freeze)
        .unwrap();
    assert_eq!(
        session
            .graph()
            .node_ablation("blocks.0.headPattern1", session.interventions()),
        Some(AblationType::Freeze)
    );

    session
        .toggle_node_ablation("blocks.0.headPattern1", AblationType::Freeze)
        .unwrap();
    assert!(session.interventions().ablations().is_empty());

    assert!(session.toggle_node_ablation("text", AblationType::Zero).is_err());
}

#[test]
fn test_head_helpers_match_head_nodes() {
    let mut session = session();
    session.ablate_heads(1, &[0, 1], AblationType::Zero).unwrap();
    let ablated = session.graph().ablated_nodes(session.interventions());
    assert_eq!(ablated.len(), 2);
    assert!(ablated.iter().all(|id| {
        session.graph().node(id).map(|node| node.kind()) == Some(NodeKind::HeadPattern)
    }));
    session.restore_heads(1, &[0]).unwrap();
    assert_eq!(session.interventions().ablations().record_count(), 1);
}
