use std::collections::{BTreeMap, BTreeSet};

use crate::local::TargetPurpose;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};

/// Consistent snapshot of every watch change received up to one global snapshot version.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed with the local state, with the purpose to use
    /// when they are listened to again.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents only referenced by limbo targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// What changed for one target in a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}
