use std::collections::BTreeSet;

use crate::model::{DocumentKey, TargetId};

/// Two-way index between document keys and the ids that reference them.
///
/// Used for target-to-document mappings in the memory target cache and for the documents
/// the sync engine pins while they are in limbo.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, TargetId)>,
    by_id: BTreeSet<(TargetId, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a, I>(&mut self, keys: I, id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a, I>(&mut self, keys: I, id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> BTreeSet<DocumentKey> {
        let keys = self.referenced_keys(id);
        for key in &keys {
            self.by_key.remove(&(key.clone(), id));
        }
        self.by_id.retain(|(existing, _)| *existing != id);
        keys
    }

    pub fn referenced_keys(&self, id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(existing, _)| *existing < id)
            .take_while(|(existing, _)| *existing == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.iter().any(|(existing, _)| existing == key)
    }

    pub fn ids_for_key(&self, key: &DocumentKey) -> BTreeSet<TargetId> {
        self.by_key
            .iter()
            .filter(|(existing, _)| existing == key)
            .map(|(_, id)| *id)
            .collect()
    }
}
