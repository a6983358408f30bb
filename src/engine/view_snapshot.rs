use std::collections::{BTreeMap, BTreeSet};

use log::error;

use crate::engine::{DocumentSet, Query};
use crate::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state changed.
    Metadata,
}

impl ChangeType {
    /// Order changes are reported in: removals, then additions, then modifications.
    pub(crate) fn sort_rank(&self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: MutableDocument) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Changes accumulated for one view, at most one per key.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `change` into the change already tracked for the same key.
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.document))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => {
                error!("Unsupported view change combination {old_type:?} then {new_type:?} for {key}");
                Some(change)
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Whether the view reflects the backend's current result set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Immutable result of one view computation, handed to listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    /// Keys whose documents have pending local writes.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub exclude_metadata_changes: bool,
    /// The backend has handed out a resume token for this result.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot presenting `documents` as all newly added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        let old_documents = documents.empty_like();
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            exclude_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::value::ObjectValue;

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        )
    }

    fn tracked(changes: &[ChangeType]) -> Vec<ChangeType> {
        let mut set = DocumentChangeSet::new();
        for change_type in changes {
            set.track(DocumentViewChange::new(*change_type, doc("rooms/a")));
        }
        set.changes().iter().map(|c| c.change_type).collect()
    }

    #[test]
    fn merges_successive_changes_to_one_key() {
        use ChangeType::*;
        assert_eq!(tracked(&[Added, Modified]), vec![Added]);
        assert_eq!(tracked(&[Added, Removed]), Vec::<ChangeType>::new());
        assert_eq!(tracked(&[Removed, Added]), vec![Modified]);
        assert_eq!(tracked(&[Modified, Metadata]), vec![Modified]);
        assert_eq!(tracked(&[Metadata, Modified]), vec![Modified]);
        assert_eq!(tracked(&[Modified, Removed]), vec![Removed]);
    }
}
