use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, warn};

use crate::engine::{Query, Target};
use crate::error::{not_found, FirestoreResult};
use crate::local::local_documents_view as documents_view;
use crate::local::{
    run_transaction, Persistence, PersistenceTransaction, ReferenceSet, TargetData, TargetPurpose,
    TransactionMode,
};
use crate::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId, Timestamp, User, BATCH_ID_UNKNOWN,
};
use crate::remote::RemoteEvent;

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

#[derive(Debug, Clone, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Keys a view added or removed in one snapshot, reported back once the snapshot is raised.
#[derive(Debug, Clone)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Local state of the client: queued mutations, cached remote documents and the overlays that
/// combine them, plus the targets currently listened to.
///
/// Every public operation runs in one persistence transaction. A failed transaction leaves
/// both the stores and this struct's bookkeeping untouched.
pub struct LocalStore {
    persistence: Box<dyn Persistence>,
    current_user: User,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: HashMap<String, TargetId>,
    target_ref_counts: HashMap<TargetId, usize>,
    /// Documents pinned by views, by target id.
    local_view_references: ReferenceSet,
}

impl LocalStore {
    pub fn new(persistence: Box<dyn Persistence>, initial_user: User) -> Self {
        Self {
            persistence,
            current_user: initial_user,
            target_data_by_target: BTreeMap::new(),
            target_ids_by_canonical_id: HashMap::new(),
            target_ref_counts: HashMap::new(),
            local_view_references: ReferenceSet::new(),
        }
    }

    pub fn start(&mut self) -> FirestoreResult<()> {
        self.persistence.set_user(&self.current_user);
        self.persistence.start()
    }

    pub fn shutdown(&mut self) {
        self.persistence.shutdown();
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    fn run<T, F>(&mut self, label: &str, mode: TransactionMode, f: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        run_transaction(self.persistence.as_mut(), label, mode, f)
    }

    /// Switches to `user`'s mutation queue and returns the documents whose local view may
    /// differ between the two users.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.run("Handle user change", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.all_mutation_batches())
        })?;

        let previous_user = std::mem::replace(&mut self.current_user, user);
        self.persistence.set_user(&self.current_user);

        let result = self.run("Handle user change", TransactionMode::ReadOnly, |txn| {
            let new_batches = txn.mutation_queue.all_mutation_batches();
            let mut changed_keys = BTreeSet::new();
            for batch in old_batches.iter().chain(&new_batches) {
                changed_keys.extend(batch.keys());
            }
            let affected_documents = documents_view::get_documents(txn, &changed_keys)?;
            Ok(UserChangeResult {
                affected_documents,
                removed_batch_ids: old_batches.iter().map(|b| b.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|b| b.batch_id).collect(),
            })
        });

        if result.is_err() {
            self.current_user = previous_user;
            self.persistence.set_user(&self.current_user);
        }
        result
    }

    /// Queues `mutations` as one batch and returns the new local view of every touched key.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();

        self.run("Locally write mutations", TransactionMode::ReadWrite, |txn| {
            let batch = txn
                .mutation_queue
                .add_mutation_batch(local_write_time, mutations)?;
            for key in &keys {
                txn.index_manager
                    .add_to_collection_parent_index(&key.collection_path())?;
            }
            documents_view::recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
            let changes = documents_view::get_documents(txn, &keys)?;
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes,
            })
        })
    }

    /// Applies the backend's acknowledgment of a batch to the remote document cache and drops
    /// the batch. Returns the local view of every key the batch touched.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.run("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
            let batch = &result.batch;
            let keys = batch.keys();

            for key in &keys {
                let mut document = txn.remote_documents.get_entry(key);
                let Some(ack_version) = result.doc_versions.get(key) else {
                    continue;
                };
                if document.version() < *ack_version {
                    batch.apply_to_remote_document(&mut document, result);
                    if document.is_valid_document() {
                        txn.remote_documents
                            .add_entry(document, result.commit_version)?;
                    }
                }
            }

            txn.mutation_queue.remove_mutation_batch(batch.batch_id)?;
            txn.document_overlays
                .remove_overlays_for_batch_id(batch.batch_id)?;
            documents_view::recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
            documents_view::get_documents(txn, &keys)
        })
    }

    /// Drops a batch the backend refused. Returns the local view of every key it touched.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.run("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
            let batch = txn
                .mutation_queue
                .lookup_mutation_batch(batch_id)
                .ok_or_else(|| not_found(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            let keys = batch.keys();
            txn.mutation_queue.remove_mutation_batch(batch_id)?;
            txn.document_overlays.remove_overlays_for_batch_id(batch_id)?;
            documents_view::recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
            documents_view::get_documents(txn, &keys)
        })
    }

    pub fn highest_unacknowledged_batch_id(&mut self) -> FirestoreResult<BatchId> {
        self.run(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.mutation_queue.highest_unacknowledged_batch_id()),
        )
    }

    /// First queued batch after `after`, or the first batch overall.
    pub fn next_mutation_batch(&mut self, after: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let after = after.unwrap_or(BATCH_ID_UNKNOWN);
        self.run("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.next_mutation_batch_after_batch_id(after))
        })
    }

    pub fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.run("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
            Ok(txn.target_cache.last_remote_snapshot_version())
        })
    }

    /// Writes a remote event into the caches and returns the local view of every document it
    /// changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let mut target_data_by_target = self.target_data_by_target.clone();

        let changes = run_transaction(
            self.persistence.as_mut(),
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                for (target_id, change) in &event.target_changes {
                    // Targets released while the event was in flight are skipped.
                    let Some(old) = target_data_by_target.get(target_id) else {
                        continue;
                    };

                    txn.target_cache
                        .remove_matching_keys(&change.removed_documents, *target_id)?;
                    txn.target_cache
                        .add_matching_keys(&change.added_documents, *target_id)?;

                    let mut updated = old.with_sequence_number(txn.current_sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    txn.target_cache.update_target_data(updated.clone())?;
                    target_data_by_target.insert(*target_id, updated);
                }

                let keys: BTreeSet<DocumentKey> = event.document_updates.keys().cloned().collect();
                let existing = txn.remote_documents.get_entries(&keys);
                let mut changed = BTreeMap::new();
                let mut existence_changed = BTreeSet::new();
                for (key, document) in &event.document_updates {
                    let Some(existing) = existing.get(key) else {
                        continue;
                    };
                    if document.is_found_document() != existing.is_found_document() {
                        existence_changed.insert(key.clone());
                    }

                    if document.is_no_document() && document.version().is_min() {
                        // A deletion synthesized without a version only evicts the entry.
                        txn.remote_documents.remove_entry(key)?;
                        changed.insert(key.clone(), document.clone());
                    } else if !existing.is_valid_document()
                        || document.version() > existing.version()
                        || (document.version() == existing.version() && existing.has_pending_writes())
                    {
                        if document.is_found_document() {
                            txn.index_manager
                                .add_to_collection_parent_index(&key.collection_path())?;
                        }
                        txn.remote_documents
                            .add_entry(document.clone(), remote_version)?;
                        changed.insert(key.clone(), document.clone());
                    } else {
                        debug!(
                            "Ignoring outdated watch update for {key}: current version {}, watch version {}",
                            existing.version(),
                            document.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last = txn.target_cache.last_remote_snapshot_version();
                    if remote_version >= last {
                        txn.target_cache.set_target_snapshot_version(remote_version)?;
                    }
                }

                documents_view::get_local_view_of_documents(txn, changed, &existence_changed)
            },
        )?;

        self.target_data_by_target = target_data_by_target;
        Ok(changes)
    }

    /// Records the keys each view now shows, and the limbo-free version of views that are
    /// in sync with the backend.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) {
        for change in view_changes {
            self.local_view_references
                .add_references(&change.added_keys, change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);

            if change.from_cache {
                continue;
            }
            if let Some(target_data) = self.target_data_by_target.get_mut(&change.target_id) {
                let version = target_data.snapshot_version;
                *target_data = target_data.with_last_limbo_free_snapshot_version(version);
            }
        }
    }

    /// Whether any view currently shows `key`.
    pub fn is_pinned(&self, key: &DocumentKey) -> bool {
        self.local_view_references.contains_key(key)
    }

    pub fn read_document(&mut self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run("Read document", TransactionMode::ReadOnly, |txn| {
            Ok(documents_view::get_document(txn, key))
        })
    }

    /// Returns the target data for `target`, allocating a new even target id the first time.
    /// Each call must be paired with one [`LocalStore::release_target`].
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let canonical_id = target.canonical_id();
        if let Some(target_id) = self.target_ids_by_canonical_id.get(&canonical_id) {
            if let Some(target_data) = self.target_data_by_target.get(target_id) {
                *self.target_ref_counts.entry(*target_id).or_insert(0) += 1;
                return Ok(target_data.clone());
            }
        }

        let target_data = self.run("Allocate target", TransactionMode::ReadWrite, |txn| {
            if let Some(cached) = txn.target_cache.get_target_data(&target) {
                return Ok(cached);
            }
            let target_id = txn.target_cache.allocate_target_id();
            let target_data = TargetData::new(
                target,
                target_id,
                TargetPurpose::Listen,
                txn.current_sequence_number,
            );
            txn.target_cache.add_target_data(target_data.clone())?;
            Ok(target_data)
        })?;

        let target_id = target_data.target_id;
        self.target_data_by_target
            .insert(target_id, target_data.clone());
        self.target_ids_by_canonical_id.insert(canonical_id, target_id);
        self.target_ref_counts.insert(target_id, 1);
        Ok(target_data)
    }

    pub fn get_local_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
    }

    /// Drops one reference to `target_id`. The last release forgets the target and, unless
    /// `keep_persisted`, deletes its cached data. A storage failure while deleting is logged
    /// and otherwise ignored; the target is forgotten either way.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted: bool) {
        let Some(count) = self.target_ref_counts.get_mut(&target_id) else {
            debug!("Ignoring release of unknown target {target_id}");
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }

        self.target_ref_counts.remove(&target_id);
        if let Some(target_data) = self.target_data_by_target.remove(&target_id) {
            self.target_ids_by_canonical_id
                .remove(&target_data.target.canonical_id());
        }
        self.local_view_references.remove_references_for_id(target_id);

        if keep_persisted {
            return;
        }
        let result = self.run("Release target", TransactionMode::ReadWritePrimary, |txn| {
            txn.target_cache.remove_target_data(target_id)
        });
        if let Err(err) = result {
            warn!("Failed to release target {target_id}: {err}");
        }
    }

    /// Runs `query` against the local view.
    ///
    /// With `use_previous_results`, a target that was last in sync at some version only
    /// rescans documents read after that version and re-checks the keys it already matched.
    /// Limit queries always rescan, since an edit can pull older documents into the window.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_local_target_data(&query.to_target()).cloned();

        self.run("Execute query", TransactionMode::ReadOnly, |txn| {
            let remote_keys = target_data
                .as_ref()
                .map(|data| txn.target_cache.get_matching_keys_for_target_id(data.target_id))
                .unwrap_or_default();
            let limbo_free_version = target_data
                .as_ref()
                .filter(|_| use_previous_results)
                .map(|data| data.last_limbo_free_snapshot_version)
                .unwrap_or_else(SnapshotVersion::min);

            let documents = if limbo_free_version.is_min() || query.has_limit() {
                documents_view::get_documents_matching_query(txn, query, SnapshotVersion::min())?
            } else {
                let mut documents: DocumentMap = documents_view::get_documents(txn, &remote_keys)?
                    .into_iter()
                    .filter(|(_, document)| query.matches(document))
                    .collect();
                documents.extend(documents_view::get_documents_matching_query(
                    txn,
                    query,
                    limbo_free_version,
                )?);
                documents
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn remote_document_keys(&mut self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.run("Remote document keys", TransactionMode::ReadOnly, |txn| {
            Ok(txn.target_cache.get_matching_keys_for_target_id(target_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::{storage_unavailable, FirestoreErrorCode};
    use crate::local::{MemoryPersistence, TransactionBody};
    use crate::model::{FieldMask, FieldPath, MutationKind, MutationResult, Overlay};
    use crate::remote::TargetChange;
    use crate::value::{FirestoreValue, ObjectValue};

    /// Memory persistence whose transactions fail while `offline` is set.
    struct FlakyPersistence {
        inner: MemoryPersistence,
        offline: Arc<AtomicBool>,
    }

    impl Persistence for FlakyPersistence {
        fn start(&mut self) -> FirestoreResult<()> {
            self.inner.start()
        }

        fn shutdown(&mut self) {
            self.inner.shutdown()
        }

        fn is_started(&self) -> bool {
            self.inner.is_started()
        }

        fn set_user(&mut self, user: &User) {
            self.inner.set_user(user)
        }

        fn transaction_scope(
            &mut self,
            label: &str,
            mode: TransactionMode,
            body: &mut TransactionBody<'_>,
        ) -> FirestoreResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(storage_unavailable(format!("{label}: storage is offline")));
            }
            self.inner.transaction_scope(label, mode, body)
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (path, entry) in entries {
            value.set(&field(path), entry.clone());
        }
        value
    }

    fn local_store() -> LocalStore {
        let mut store = LocalStore::new(Box::new(MemoryPersistence::new()), User::unauthenticated());
        store.start().unwrap();
        store
    }

    fn ack(store: &mut LocalStore, batch_id: BatchId, seconds: i64) -> DocumentMap {
        let batch = store.next_mutation_batch(Some(batch_id - 1)).unwrap().unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(seconds), Vec::new()))
            .collect();
        let result = MutationBatchResult::from(batch, version(seconds), results, Vec::new()).unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn remote_event(
        seconds: i64,
        target_id: TargetId,
        documents: Vec<MutableDocument>,
    ) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange {
            resume_token: vec![seconds as u8],
            current: true,
            ..TargetChange::default()
        };
        for document in documents {
            change.added_documents.insert(document.key().clone());
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn two_sets_then_two_acks_converge_on_the_last_write() {
        let mut store = local_store();
        let doc = key("foo/bar");

        let first = store
            .write_locally(vec![Mutation::set(doc.clone(), object(&[("foo", "bar".into())]))])
            .unwrap();
        let second = store
            .write_locally(vec![Mutation::set(doc.clone(), object(&[("foo", "baz".into())]))])
            .unwrap();
        assert_eq!((first.batch_id, second.batch_id), (1, 2));

        let local = store.read_document(&doc).unwrap();
        assert!(local.has_local_mutations());
        assert_eq!(local.field(&field("foo")), Some(&"baz".into()));

        let after_first = ack(&mut store, 1, 1);
        let view = &after_first[&doc];
        assert!(view.has_local_mutations());
        assert_eq!(view.field(&field("foo")), Some(&"baz".into()));

        let after_second = ack(&mut store, 2, 2);
        let view = &after_second[&doc];
        assert!(!view.has_local_mutations());
        assert!(view.has_committed_mutations());
        assert_eq!(view.version(), version(2));
        assert_eq!(view.field(&field("foo")), Some(&"baz".into()));
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
    }

    #[test]
    fn rejecting_a_batch_restores_the_remote_view() {
        let mut store = local_store();
        let doc = key("rooms/a");
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        store
            .apply_remote_event(&remote_event(
                1,
                target.target_id,
                vec![MutableDocument::new_found_document(
                    doc.clone(),
                    version(1),
                    object(&[("n", 1.into())]),
                )],
            ))
            .unwrap();

        let patch = Mutation::patch(
            doc.clone(),
            object(&[("n", 2.into())]),
            FieldMask::new(vec![field("n")]),
        );
        let write = store.write_locally(vec![patch]).unwrap();
        assert_eq!(write.changes[&doc].field(&field("n")), Some(&2.into()));

        let changes = store.reject_batch(write.batch_id).unwrap();
        assert_eq!(changes[&doc].field(&field("n")), Some(&1.into()));
        assert!(!changes[&doc].has_local_mutations());
        assert!(store.reject_batch(write.batch_id).is_err());
    }

    fn overlay(store: &mut LocalStore, doc: &DocumentKey) -> Option<Overlay> {
        store
            .run("Read overlay", TransactionMode::ReadOnly, |txn| {
                Ok(txn.document_overlays.get_overlay(doc))
            })
            .unwrap()
    }

    /// Store holding `docs` as synced found documents at version 1.
    fn seeded_store(docs: &[&DocumentKey]) -> LocalStore {
        let mut store = local_store();
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        let documents = docs
            .iter()
            .map(|doc| {
                MutableDocument::new_found_document((*doc).clone(), version(1), object(&[("n", 1.into())]))
            })
            .collect();
        store
            .apply_remote_event(&remote_event(1, target.target_id, documents))
            .unwrap();
        store
    }

    fn patch(doc: &DocumentKey, name: &str, value: i64) -> Mutation {
        Mutation::patch(
            doc.clone(),
            object(&[(name, value.into())]),
            FieldMask::new(vec![field(name)]),
        )
    }

    #[test]
    fn rejecting_an_earlier_patch_leaves_only_the_later_one() {
        let doc = key("rooms/a");
        let mut store = seeded_store(&[&doc]);
        store.write_locally(vec![patch(&doc, "a", 1)]).unwrap();
        let later = store.write_locally(vec![patch(&doc, "b", 2)]).unwrap();
        store.reject_batch(1).unwrap();

        let mut alone = seeded_store(&[&doc]);
        alone.write_locally(vec![patch(&doc, "b", 2)]).unwrap();
        let expected = overlay(&mut alone, &doc).unwrap();

        let recomputed = overlay(&mut store, &doc).unwrap();
        assert_eq!(recomputed.largest_batch_id, later.batch_id);
        assert_eq!(recomputed.mutation, expected.mutation);
        assert!(matches!(recomputed.mutation.kind(), MutationKind::Patch { .. }));

        let local = store.read_document(&doc).unwrap();
        assert_eq!(local.field(&field("a")), None);
        assert_eq!(local.field(&field("b")), Some(&2.into()));
        assert_eq!(local.field(&field("n")), Some(&1.into()));
    }

    #[test]
    fn acknowledging_another_key_keeps_this_overlay() {
        let doc = key("rooms/a");
        let other = key("rooms/b");
        let mut store = seeded_store(&[&doc, &other]);
        store.write_locally(vec![patch(&other, "n", 1)]).unwrap();
        store
            .write_locally(vec![patch(&doc, "n", 2), patch(&doc, "m", 3)])
            .unwrap();
        let before = overlay(&mut store, &doc).unwrap();

        ack(&mut store, 1, 1);

        assert_eq!(overlay(&mut store, &doc), Some(before));
        assert_eq!(overlay(&mut store, &other), None);
    }

    #[test]
    fn remote_updates_are_gated_by_version() {
        let mut store = local_store();
        let doc = key("rooms/a");
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();

        let newer = MutableDocument::new_found_document(doc.clone(), version(5), object(&[("n", 5.into())]));
        let older = MutableDocument::new_found_document(doc.clone(), version(3), object(&[("n", 3.into())]));
        store
            .apply_remote_event(&remote_event(5, target.target_id, vec![newer]))
            .unwrap();
        let changes = store
            .apply_remote_event(&remote_event(6, target.target_id, vec![older]))
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(
            store.read_document(&doc).unwrap().field(&field("n")),
            Some(&5.into())
        );
        assert_eq!(store.last_remote_snapshot_version().unwrap(), version(6));
        assert_eq!(
            store.remote_document_keys(target.target_id).unwrap(),
            BTreeSet::from([doc])
        );
    }

    #[test]
    fn applying_the_same_event_twice_is_idempotent() {
        let mut store = local_store();
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        let event = remote_event(
            2,
            target.target_id,
            vec![MutableDocument::new_found_document(
                key("rooms/a"),
                version(2),
                object(&[("n", 1.into())]),
            )],
        );
        let first = store.apply_remote_event(&event).unwrap();
        let second = store.apply_remote_event(&event).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let result = store
            .execute_query(&Query::collection("rooms").unwrap(), false)
            .unwrap();
        assert_eq!(result.documents.len(), 1);
    }

    #[test]
    fn target_mismatch_clears_the_resume_token() {
        let mut store = local_store();
        let target = Query::collection("rooms").unwrap().to_target();
        let allocated = store.allocate_target(target.clone()).unwrap();
        store
            .apply_remote_event(&remote_event(3, allocated.target_id, Vec::new()))
            .unwrap();
        assert_eq!(store.get_local_target_data(&target).unwrap().resume_token, vec![3]);

        let mut mismatch = remote_event(4, allocated.target_id, Vec::new());
        mismatch
            .target_mismatches
            .insert(allocated.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&mismatch).unwrap();
        let data = store.get_local_target_data(&target).unwrap();
        assert!(data.resume_token.is_empty());
        assert!(data.snapshot_version.is_min());
    }

    #[test]
    fn targets_are_shared_and_reference_counted() {
        let mut store = local_store();
        let target = Query::collection("rooms").unwrap().to_target();
        let first = store.allocate_target(target.clone()).unwrap();
        let second = store.allocate_target(target.clone()).unwrap();
        assert_eq!(first.target_id, 2);
        assert_eq!(first.target_id, second.target_id);

        store.release_target(first.target_id, false);
        assert!(store.get_local_target_data(&target).is_some());
        store.release_target(first.target_id, false);
        assert!(store.get_local_target_data(&target).is_none());

        let other = store
            .allocate_target(Query::collection("users").unwrap().to_target())
            .unwrap();
        assert_eq!(other.target_id, 4);
    }

    #[test]
    fn user_change_swaps_mutation_queues() {
        let mut store = local_store();
        let doc = key("rooms/a");
        store
            .write_locally(vec![Mutation::set(doc.clone(), object(&[("n", 1.into())]))])
            .unwrap();

        let change = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(change.removed_batch_ids, vec![1]);
        assert!(change.added_batch_ids.is_empty());
        assert!(!change.affected_documents[&doc].is_valid_document());

        let change = store.handle_user_change(User::unauthenticated()).unwrap();
        assert_eq!(change.added_batch_ids, vec![1]);
        assert!(change.affected_documents[&doc].has_local_mutations());
    }

    #[test]
    fn collection_group_queries_use_the_parent_index() {
        let mut store = local_store();
        store
            .write_locally(vec![
                Mutation::set(key("rooms/a/messages/1"), object(&[("text", "hi".into())])),
                Mutation::set(key("users/u/messages/2"), object(&[("text", "yo".into())])),
                Mutation::set(key("rooms/a"), ObjectValue::empty()),
            ])
            .unwrap();
        let result = store
            .execute_query(&Query::collection_group("messages"), false)
            .unwrap();
        assert_eq!(result.documents.len(), 2);
    }

    #[test]
    fn storage_failures_leave_state_intact() {
        let offline = Arc::new(AtomicBool::new(false));
        let persistence = FlakyPersistence {
            inner: MemoryPersistence::new(),
            offline: offline.clone(),
        };
        let mut store = LocalStore::new(Box::new(persistence), User::unauthenticated());
        store.start().unwrap();
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();

        offline.store(true, Ordering::SeqCst);
        let err = store
            .write_locally(vec![Mutation::delete(key("rooms/a"))])
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::StorageUnavailable);
        // Releasing swallows the storage error.
        store.release_target(target.target_id, false);

        offline.store(false, Ordering::SeqCst);
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
        assert!(!store.read_document(&key("rooms/a")).unwrap().is_valid_document());
    }

    #[test]
    fn failed_transactions_roll_back_memory_stores() {
        let mut persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        let result: FirestoreResult<()> = run_transaction(
            &mut persistence,
            "Failing write",
            TransactionMode::ReadWrite,
            |txn| {
                txn.mutation_queue
                    .add_mutation_batch(Timestamp::now(), vec![Mutation::delete(key("rooms/a"))])?;
                Err(storage_unavailable("disk full"))
            },
        );
        assert!(result.is_err());

        let highest = run_transaction(&mut persistence, "Read", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.highest_unacknowledged_batch_id())
        })
        .unwrap();
        assert_eq!(highest, BATCH_ID_UNKNOWN);
    }

    #[test]
    fn limbo_free_queries_rescan_only_recent_documents() {
        let mut store = local_store();
        let query = Query::collection("rooms").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(
                1,
                target.target_id,
                vec![MutableDocument::new_found_document(
                    key("rooms/a"),
                    version(1),
                    ObjectValue::empty(),
                )],
            ))
            .unwrap();
        store.notify_local_view_changes(&[LocalViewChanges {
            target_id: target.target_id,
            from_cache: false,
            added_keys: BTreeSet::from([key("rooms/a")]),
            removed_keys: BTreeSet::new(),
        }]);
        assert!(store.is_pinned(&key("rooms/a")));

        store
            .write_locally(vec![Mutation::set(key("rooms/b"), ObjectValue::empty())])
            .unwrap();
        let result = store.execute_query(&query, true).unwrap();
        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.remote_keys, BTreeSet::from([key("rooms/a")]));
    }
}
