use std::collections::{BTreeMap, BTreeSet};

use crate::error::FirestoreResult;
use crate::local::DocumentOverlayCache;
use crate::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        self.unindex(&key);
        self.keys_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key.clone());
        self.overlays
            .insert(key, Overlay::new(largest_batch_id, mutation));
    }

    fn unindex(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.overlays.get(key) {
            let batch_id = existing.largest_batch_id;
            if let Some(keys) = self.keys_by_batch_id.get_mut(&batch_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_batch_id.remove(&batch_id);
                }
            }
        }
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| {
                self.overlays
                    .get(key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect()
    }

    fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for mutation in overlays.into_values() {
            self.save_overlay(largest_batch_id, mutation);
        }
        Ok(())
    }

    fn remove_overlay(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.unindex(key);
        self.overlays.remove(key);
        Ok(())
    }

    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) -> FirestoreResult<()> {
        if let Some(keys) = self.keys_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
        Ok(())
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }
}
