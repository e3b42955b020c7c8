use crate::backend::{Backend, BackendError};
use crate::graph::{head_slice, pattern_relation};
use crate::protocol::{AblationSyncRequest, PatchSyncRequest};
use crate::slice::{SliceKey, SliceSpec};
use crate::sync::{LogicalClock, SyncEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AblationType {
    Zero,
    Freeze,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AblationRecord {
    pub slice: SliceSpec,
    pub ablation_type: AblationType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    pub slice: SliceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub slice: SliceSpec,
    /// target relation id -> target slice key -> target
    #[serde(default)]
    pub edges: BTreeMap<String, BTreeMap<SliceKey, PatchTarget>>,
}

impl PatchRecord {
    pub fn new(slice: SliceSpec) -> Self {
        Self {
            slice,
            edges: BTreeMap::new(),
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }

    pub fn has_edge(&self, target_relation_id: &str, target_slice: &SliceSpec) -> bool {
        self.edges
            .get(target_relation_id)
            .is_some_and(|targets| targets.contains_key(&target_slice.key()))
    }
}

/// component -> slice key -> ablation, in the exact shape the backend exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelAblations(pub BTreeMap<String, BTreeMap<SliceKey, AblationRecord>>);

impl ModelAblations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of components with at least one ablated slice.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn get(&self, relation_id: &str, slice: &SliceSpec) -> Option<&AblationRecord> {
        self.0.get(relation_id)?.get(&slice.key())
    }

    pub fn component(&self, relation_id: &str) -> Option<&BTreeMap<SliceKey, AblationRecord>> {
        self.0.get(relation_id)
    }

    /// Copy with every slice of `relation_id` in `slices` set to `ablation_type`.
    pub fn with_ablations(
        &self,
        relation_id: &str,
        slices: &[SliceSpec],
        ablation_type: AblationType,
    ) -> Self {
        let mut next = self.clone();
        let component = next.0.entry(relation_id.to_string()).or_default();
        for slice in slices {
            component.insert(
                slice.key(),
                AblationRecord {
                    slice: slice.clone(),
                    ablation_type,
                },
            );
        }
        if component.is_empty() {
            next.0.remove(relation_id);
        }
        next
    }

    /// Copy without the given slices. Missing keys are ignored and emptied
    /// components are dropped.
    pub fn without_ablations(&self, relation_id: &str, slices: &[SliceSpec]) -> Self {
        let mut next = self.clone();
        if let Some(component) = next.0.get_mut(relation_id) {
            for slice in slices {
                component.remove(&slice.key());
            }
            if component.is_empty() {
                next.0.remove(relation_id);
            }
        }
        next
    }
}

/// component -> slice key -> patch source, each carrying its own target map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelPatches(pub BTreeMap<String, BTreeMap<SliceKey, PatchRecord>>);

impl ModelPatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, relation_id: &str, slice: &SliceSpec) -> Option<&PatchRecord> {
        self.0.get(relation_id)?.get(&slice.key())
    }

    pub fn component(&self, relation_id: &str) -> Option<&BTreeMap<SliceKey, PatchRecord>> {
        self.0.get(relation_id)
    }

    pub fn with_patch(
        &self,
        source_relation_id: &str,
        source_slice: &SliceSpec,
        target_relation_id: &str,
        target_slice: &SliceSpec,
    ) -> Self {
        let mut next = self.clone();
        next.0
            .entry(source_relation_id.to_string())
            .or_default()
            .entry(source_slice.key())
            .or_insert_with(|| PatchRecord::new(source_slice.clone()))
            .edges
            .entry(target_relation_id.to_string())
            .or_default()
            .insert(
                target_slice.key(),
                PatchTarget {
                    slice: target_slice.clone(),
                },
            );
        next
    }

    /// Copy without one edge. The parent record survives while it still has
    /// other edges; empty levels are pruned on the way up.
    pub fn without_patch(
        &self,
        source_relation_id: &str,
        source_slice: &SliceSpec,
        target_relation_id: &str,
        target_slice: &SliceSpec,
    ) -> Self {
        let mut next = self.clone();
        let source_key = source_slice.key();
        let Some(component) = next.0.get_mut(source_relation_id) else {
            return next;
        };
        let Some(record) = component.get_mut(&source_key) else {
            return next;
        };
        if let Some(targets) = record.edges.get_mut(target_relation_id) {
            targets.remove(&target_slice.key());
            if targets.is_empty() {
                record.edges.remove(target_relation_id);
            }
        }
        if record.edges.is_empty() {
            component.remove(&source_key);
        }
        if component.is_empty() {
            next.0.remove(source_relation_id);
        }
        next
    }
}

/// Ablations and patches as last confirmed by the server.
///
/// Every mutation goes out as a full proposed state and the store then shows
/// whatever the server answered, so the visible state can never drift from the
/// backend's. A failed round trip leaves the store untouched.
#[derive(Debug, Clone, Default)]
pub struct InterventionStore {
    engine: SyncEngine,
    ablations: ModelAblations,
    patches: ModelPatches,
}

impl InterventionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ablations(&self) -> &ModelAblations {
        &self.ablations
    }

    pub fn patches(&self) -> &ModelPatches {
        &self.patches
    }

    pub fn clock(&self) -> LogicalClock {
        self.engine.clock()
    }

    pub fn add_ablation<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        relation_id: &str,
        slices: &[SliceSpec],
        ablation_type: AblationType,
    ) -> Result<(), BackendError> {
        let proposed = self
            .ablations
            .with_ablations(relation_id, slices, ablation_type);
        self.sync_ablations(backend, proposed)
    }

    pub fn remove_ablation<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        relation_id: &str,
        slices: &[SliceSpec],
    ) -> Result<(), BackendError> {
        let proposed = self.ablations.without_ablations(relation_id, slices);
        self.sync_ablations(backend, proposed)
    }

    /// Ablate whole attention heads of one layer through the pattern hook.
    pub fn ablate_heads<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        layer: usize,
        heads: &[usize],
        ablation_type: AblationType,
    ) -> Result<(), BackendError> {
        let slices: Vec<SliceSpec> = heads.iter().map(|head| head_slice(*head)).collect();
        self.add_ablation(backend, &pattern_relation(layer), &slices, ablation_type)
    }

    pub fn restore_heads<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        layer: usize,
        heads: &[usize],
    ) -> Result<(), BackendError> {
        let slices: Vec<SliceSpec> = heads.iter().map(|head| head_slice(*head)).collect();
        self.remove_ablation(backend, &pattern_relation(layer), &slices)
    }

    pub fn add_patch<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        source_relation_id: &str,
        source_slice: &SliceSpec,
        target_relation_id: &str,
        target_slice: &SliceSpec,
    ) -> Result<(), BackendError> {
        let proposed = self.patches.with_patch(
            source_relation_id,
            source_slice,
            target_relation_id,
            target_slice,
        );
        self.sync_patches(backend, proposed)
    }

    pub fn remove_patch<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        source_relation_id: &str,
        source_slice: &SliceSpec,
        target_relation_id: &str,
        target_slice: &SliceSpec,
    ) -> Result<(), BackendError> {
        let proposed = self.patches.without_patch(
            source_relation_id,
            source_slice,
            target_relation_id,
            target_slice,
        );
        self.sync_patches(backend, proposed)
    }

    /// Push the current state unchanged, both channels stamped with the same
    /// clock. A server that has moved past it answers with its own state.
    pub fn refresh<B: Backend + ?Sized>(&mut self, backend: &B) -> Result<(), BackendError> {
        let clock = self.engine.clock();
        self.sync_ablations(backend, self.ablations.clone())?;
        self.sync_patches_at(backend, clock, self.patches.clone())
    }

    /// Take ablations handed out by the server outside a sync round trip,
    /// e.g. alongside a model config. The clock is left alone.
    pub fn adopt_ablations(&mut self, ablations: ModelAblations) {
        self.ablations = ablations;
    }

    pub fn sync_ablations<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        proposed: ModelAblations,
    ) -> Result<(), BackendError> {
        self.engine
            .sync(&mut self.ablations, proposed, |ablations, clock| {
                log::debug!("Syncing ablations at client clock {clock}");
                let response = backend.sync_ablations(&AblationSyncRequest {
                    ablations,
                    client_logical_clock: clock,
                })?;
                Ok((response.ablations, response.server_logical_clock))
            })
    }

    pub fn sync_patches<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        proposed: ModelPatches,
    ) -> Result<(), BackendError> {
        self.sync_patches_at(backend, self.engine.clock(), proposed)
    }

    fn sync_patches_at<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        clock: LogicalClock,
        proposed: ModelPatches,
    ) -> Result<(), BackendError> {
        self.engine
            .sync_at(clock, &mut self.patches, proposed, |patches, clock| {
                log::debug!("Syncing patches at client clock {clock}");
                let response = backend.sync_patches(&PatchSyncRequest {
                    patches,
                    client_logical_clock: clock,
                })?;
                Ok((response.patches, response.server_logical_clock))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(rank: usize) -> SliceSpec {
        SliceSpec::full(rank)
    }

    #[test]
    fn test_ablation_wire_shape() {
        let ablations = ModelAblations::new().with_ablations(
            "blocks.0.attn.hook_pattern",
            &[head_slice(1)],
            AblationType::Zero,
        );
        let value = serde_json::to_value(&ablations).unwrap();
        let record = &value["blocks.0.attn.hook_pattern"]["[[0,-1],[1,2],[0,-1],[0,-1]]"];
        assert_eq!(record["ablationType"], "zero");
        assert_eq!(record["slice"][1], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_with_ablations_overwrites_same_key() {
        let first = ModelAblations::new().with_ablations("hook_embed", &[full(3)], AblationType::Zero);
        let second = first.with_ablations("hook_embed", &[full(3)], AblationType::Freeze);
        assert_eq!(second.record_count(), 1);
        assert_eq!(
            second.get("hook_embed", &full(3)).unwrap().ablation_type,
            AblationType::Freeze
        );
        assert_eq!(
            first.get("hook_embed", &full(3)).unwrap().ablation_type,
            AblationType::Zero
        );
    }

    #[test]
    fn test_without_ablations_round_trip_and_missing_key() {
        let base = ModelAblations::new().with_ablations("hook_embed", &[full(3)], AblationType::Zero);
        let added = base.with_ablations("blocks.0.hook_resid_mid", &[full(3)], AblationType::Zero);
        assert_eq!(added.without_ablations("blocks.0.hook_resid_mid", &[full(3)]), base);
        assert_eq!(base.without_ablations("not.there", &[full(3)]), base);
        assert_eq!(base.without_ablations("hook_embed", &[full(2)]), base);
    }

    #[test]
    fn test_patch_edges_grow_and_shrink_under_one_record() {
        let source = full(3);
        let patches = ModelPatches::new()
            .with_patch("we", &source, "blocks.0.query", &full(4))
            .with_patch("we", &source, "blocks.0.key", &full(4));
        assert_eq!(patches.get("we", &source).unwrap().edge_count(), 2);

        let one_left = patches.without_patch("we", &source, "blocks.0.query", &full(4));
        let record = one_left.get("we", &source).unwrap();
        assert_eq!(record.edge_count(), 1);
        assert!(record.has_edge("blocks.0.key", &full(4)));

        let none_left = one_left.without_patch("we", &source, "blocks.0.key", &full(4));
        assert!(none_left.is_empty());
    }

    #[test]
    fn test_patch_wire_shape() {
        let patches = ModelPatches::new().with_patch("we", &full(3), "blocks.0.query", &full(4));
        let value = serde_json::to_value(&patches).unwrap();
        let record = &value["we"]["[[0,-1],[0,-1],[0,-1]]"];
        assert_eq!(record["slice"], serde_json::json!([[0, -1], [0, -1], [0, -1]]));
        assert_eq!(
            record["edges"]["blocks.0.query"]["[[0,-1],[0,-1],[0,-1],[0,-1]]"]["slice"][3],
            serde_json::json!([0, -1])
        );
    }
}
