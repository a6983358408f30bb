use std::cmp::Ordering;
use std::collections::BTreeSet;

use log::error;

use crate::engine::{
    ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, LimitType, Query, SyncState,
    ViewSnapshot,
};
use crate::local::DocumentMap;
use crate::model::{DocumentKey, MutableDocument};
use crate::remote::{OnlineState, TargetChange};

/// Result of [`View::compute_doc_changes`], fed back into [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit window lost a document that was not in the candidate set; the caller must
    /// recompute against the full local result before applying.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side result set of one query.
///
/// Tracks which documents match, which of them the backend has confirmed, and which local
/// results the backend has not confirmed yet (limbo documents).
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend says match the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::for_query(&query);
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Works out how `documents` change this view, without applying anything.
    ///
    /// `previous` chains a second pass (for a refill) onto an earlier result.
    pub fn compute_doc_changes(
        &self,
        documents: &DocumentMap,
        previous: Option<&ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let old_document_set = previous
            .map(|p| p.document_set.clone())
            .unwrap_or_else(|| self.document_set.clone());
        let mut new_document_set = old_document_set.clone();
        let mut mutated_keys = previous
            .map(|p| p.mutated_keys.clone())
            .unwrap_or_else(|| self.mutated_keys.clone());
        let mut change_set = previous
            .map(|p| p.change_set.clone())
            .unwrap_or_default();
        let comparator = old_document_set.comparator().clone();
        let mut needs_refill = false;

        // Boundary of a full limit window. An update past it, or a removal inside it, may
        // let a document outside the candidate set into the window.
        let limit = self.query.limit().map(|l| l as usize);
        let window_full = limit == Some(old_document_set.len());
        let last_doc_in_limit = (window_full && self.query.limit_type() == LimitType::First)
            .then(|| old_document_set.last().cloned())
            .flatten();
        let first_doc_in_limit = (window_full && self.query.limit_type() == LimitType::Last)
            .then(|| old_document_set.first().cloned())
            .flatten();

        for (key, candidate) in documents {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(candidate).then_some(candidate);

            let old_had_pending_writes = old_doc
                .map(|doc| self.mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            let new_has_pending_writes = new_doc
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new.clone()));
                            change_applied = true;

                            let past_end = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator(new, last) == Ordering::Greater);
                            let before_start = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new, first) == Ordering::Less);
                            if past_end || before_start {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending_writes != new_has_pending_writes {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()));
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        new_document_set.insert(new.clone());
                        if new_has_pending_writes {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                new_document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits `doc_changes` and the backend's `target_change` to the view.
    ///
    /// Returns a snapshot when documents changed or the sync state flipped, along with the
    /// limbo documents that appeared or cleared.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        if doc_changes.needs_refill {
            error!("Applying view changes that still need a refill for {}", self.query);
        }

        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        let had_pending_writes = !self.mutated_keys.is_empty();
        self.mutated_keys = doc_changes.mutated_keys;
        let was_current = self.current;

        let comparator = self.document_set.comparator().clone();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| comparator(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state)
            || was_current != self.current
            || had_pending_writes != !self.mutated_keys.is_empty();
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            exclude_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|c| !c.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline turns a current view into a from-cache one.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();
        let old_limbo = std::mem::replace(&mut self.limbo_documents, new_limbo);

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    /// A local result the backend has not confirmed, and that no pending write explains.
    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A locally modified document whose write was just acknowledged keeps showing the local
/// version until the backend sends the committed one.
fn should_wait_for_synced_document(old: &MutableDocument, new: &MutableDocument) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Direction;
    use crate::model::{FieldPath, SnapshotVersion, Timestamp};
    use crate::value::ObjectValue;

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("rank").unwrap(), rank.into());
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn docs(documents: Vec<MutableDocument>) -> DocumentMap {
        documents
            .into_iter()
            .map(|d| (d.key().clone(), d))
            .collect()
    }

    fn keys(set: &DocumentSet) -> Vec<String> {
        set.keys().map(|k| k.id().to_string()).collect()
    }

    fn ranked_query() -> Query {
        Query::collection("rooms")
            .unwrap()
            .with_order_by(FieldPath::from_dot_separated("rank").unwrap(), Direction::Ascending)
    }

    fn apply(view: &mut View, documents: Vec<MutableDocument>) -> ViewChange {
        let changes = view.compute_doc_changes(&docs(documents), None);
        view.apply_changes(changes, true, None)
    }

    #[test]
    fn insertion_into_a_full_limit_evicts_the_last_document() {
        let mut view = View::new(ranked_query().with_limit_to_first(2), BTreeSet::new());
        apply(&mut view, vec![doc("rooms/a", 1), doc("rooms/b", 3)]);

        let change = apply(&mut view, vec![doc("rooms/c", 2)]);
        let snapshot = change.snapshot.unwrap();
        let reported: Vec<(ChangeType, String)> = snapshot
            .document_changes
            .iter()
            .map(|c| (c.change_type, c.document.key().id().to_string()))
            .collect();
        assert_eq!(
            reported,
            vec![
                (ChangeType::Removed, "b".to_string()),
                (ChangeType::Added, "c".to_string())
            ]
        );
        assert_eq!(keys(&snapshot.documents), vec!["a", "c"]);
    }

    #[test]
    fn removal_inside_a_full_window_needs_a_refill() {
        let mut view = View::new(ranked_query().with_limit_to_first(2), BTreeSet::new());
        apply(&mut view, vec![doc("rooms/a", 1), doc("rooms/b", 3)]);

        let mut moved = doc("rooms/a", 1);
        moved.convert_to_no_document(SnapshotVersion::new(Timestamp::new(2, 0)));
        let changes = view.compute_doc_changes(&docs(vec![moved]), None);
        assert!(changes.needs_refill);

        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/b", 9)]), None);
        assert!(changes.needs_refill);
    }

    #[test]
    fn limit_to_last_keeps_the_tail() {
        let query = ranked_query().with_limit_to_last(2).unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let change = apply(
            &mut view,
            vec![doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)],
        );
        assert_eq!(keys(&change.snapshot.unwrap().documents), vec!["b", "c"]);
    }

    #[test]
    fn metadata_only_changes_are_reported_as_metadata() {
        let mut view = View::new(ranked_query(), BTreeSet::new());
        let mut pending = doc("rooms/a", 1);
        pending.set_has_local_mutations();
        apply(&mut view, vec![pending]);

        let change = apply(&mut view, vec![doc("rooms/a", 1)]);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.document_changes.len(), 1);
        assert_eq!(snapshot.document_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
        assert!(snapshot.sync_state_changed);

        let change = apply(&mut view, vec![doc("rooms/a", 4)]);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.document_changes[0].change_type, ChangeType::Modified);
        assert!(!snapshot.sync_state_changed);
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_once_current() {
        let mut view = View::new(ranked_query(), BTreeSet::new());
        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/a", 1), doc("rooms/b", 2)]), None);
        let target_change = TargetChange {
            current: true,
            added_documents: BTreeSet::from([DocumentKey::from_string("rooms/a").unwrap()]),
            ..TargetChange::default()
        };
        let change = view.apply_changes(changes, true, Some(&target_change));
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(
                DocumentKey::from_string("rooms/b").unwrap()
            )]
        );
        assert!(change.snapshot.unwrap().from_cache);

        let target_change = TargetChange {
            current: true,
            added_documents: BTreeSet::from([DocumentKey::from_string("rooms/b").unwrap()]),
            ..TargetChange::default()
        };
        let no_docs = view.compute_doc_changes(&DocumentMap::new(), None);
        let change = view.apply_changes(no_docs, true, Some(&target_change));
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Removed(
                DocumentKey::from_string("rooms/b").unwrap()
            )]
        );
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn going_offline_marks_a_current_view_from_cache() {
        let mut view = View::new(ranked_query(), BTreeSet::new());
        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/a", 1)]), None);
        let target_change = TargetChange {
            current: true,
            added_documents: BTreeSet::from([DocumentKey::from_string("rooms/a").unwrap()]),
            ..TargetChange::default()
        };
        let synced = view.apply_changes(changes, true, Some(&target_change));
        assert!(!synced.snapshot.unwrap().from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = offline.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.document_changes.is_empty());
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
