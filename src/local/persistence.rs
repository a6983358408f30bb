use std::collections::{BTreeMap, BTreeSet};

use crate::engine::{Query, Target};
use crate::error::{internal_error, FirestoreResult};
use crate::local::TargetData;
use crate::model::{
    BatchId, DocumentKey, ListenSequenceNumber, MutableDocument, Mutation, MutationBatch, Overlay,
    ResourcePath, SnapshotVersion, TargetId, Timestamp, User,
};

/// Queue of unacknowledged mutation batches for one user.
pub trait MutationQueue: Send {
    fn is_empty(&self) -> bool;

    /// Appends a batch with the next batch id.
    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id greater than `batch_id`.
    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// Highest id handed out that is still queued, or [`crate::model::BATCH_ID_UNKNOWN`].
    fn highest_unacknowledged_batch_id(&self) -> BatchId;

    fn all_mutation_batches(&self) -> Vec<MutationBatch>;

    /// Batches touching any of `keys`, in batch id order.
    fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch>;

    fn remove_mutation_batch(&mut self, batch_id: BatchId) -> FirestoreResult<()>;
}

/// Cache of documents as last seen from the backend.
pub trait RemoteDocumentCache: Send {
    fn add_entry(&mut self, document: MutableDocument, read_time: SnapshotVersion)
        -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey) -> FirestoreResult<()>;

    /// Cached entry, or an invalid document when the key is unknown.
    fn get_entry(&self, key: &DocumentKey) -> MutableDocument;

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument>;

    /// Valid entries stored directly under the query's collection path and read after
    /// `since_read_time` (every entry when it is the minimum version). Callers filter with
    /// [`Query::matches`] once overlays are applied.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument>;

    fn len(&self) -> usize;
}

/// Persisted target metadata and the keys each target currently matches on the backend.
pub trait TargetCache: Send {
    /// Next unused even target id.
    fn allocate_target_id(&mut self) -> TargetId;

    fn highest_sequence_number(&self) -> ListenSequenceNumber;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_target_snapshot_version(&mut self, version: SnapshotVersion) -> FirestoreResult<()>;

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn remove_target_data(&mut self, target_id: TargetId) -> FirestoreResult<()>;

    /// Lookup by canonical id.
    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn add_matching_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn remove_matching_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> FirestoreResult<()>;

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

/// Saved overlays for one user; at most one per document key.
pub trait DocumentOverlayCache: Send {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay>;

    /// Stores `overlays`, replacing any existing overlay for the same keys.
    fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()>;

    fn remove_overlay(&mut self, key: &DocumentKey) -> FirestoreResult<()>;

    /// Removes the overlays that were last written by `batch_id`.
    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) -> FirestoreResult<()>;

    /// Overlays for documents directly under `collection` with a batch id above `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay>;
}

/// Collection-parent index backing collection-group queries.
pub trait IndexManager: Send {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath)
        -> FirestoreResult<()>;

    /// Parent paths of every collection named `collection_id`.
    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// Stores reachable inside one persistence transaction. The mutation queue and overlay cache
/// belong to the current user.
pub struct PersistenceTransaction<'a> {
    pub mutation_queue: &'a mut dyn MutationQueue,
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub target_cache: &'a mut dyn TargetCache,
    pub document_overlays: &'a mut dyn DocumentOverlayCache,
    pub index_manager: &'a mut dyn IndexManager,
    pub current_sequence_number: ListenSequenceNumber,
}

pub type TransactionBody<'b> =
    dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()> + 'b;

/// Transactional storage behind the local store.
///
/// An error returned from a transaction body leaves the stores as they were before the
/// transaction started.
pub trait Persistence: Send {
    fn start(&mut self) -> FirestoreResult<()>;

    fn shutdown(&mut self);

    fn is_started(&self) -> bool;

    /// Switches the user whose mutation queue and overlays later transactions see.
    fn set_user(&mut self, user: &User);

    fn transaction_scope(
        &mut self,
        label: &str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()>;
}

/// Runs `f` in a transaction and returns its output.
pub fn run_transaction<T, F>(
    persistence: &mut dyn Persistence,
    label: &str,
    mode: TransactionMode,
    f: F,
) -> FirestoreResult<T>
where
    F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
{
    let mut f = Some(f);
    let mut output = None;
    persistence.transaction_scope(label, mode, &mut |txn| {
        let f = f
            .take()
            .ok_or_else(|| internal_error("Transaction body invoked twice"))?;
        output = Some(f(txn)?);
        Ok(())
    })?;
    output.ok_or_else(|| internal_error(format!("Transaction '{label}' did not run")))
}
