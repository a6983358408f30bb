use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use futures::channel::oneshot;
use log::{debug, error, warn};

use crate::engine::{ChangeType, LimboDocumentChange, Query, Target, View, ViewSnapshot};
use crate::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::local::{
    DocumentMap, LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose,
};
use crate::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId, User, BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::remote::{OnlineState, RemoteEvent, RemoteSyncer, TargetChange};
use crate::settings::FirestoreSettings;

/// Completion handle for a request issued through the client queue.
pub type Reply<T> = oneshot::Sender<FirestoreResult<T>>;

/// Work the sync engine wants the remote store to do. The owner of both drains these with
/// [`SyncEngine::take_remote_requests`] after each call.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteRequest {
    Listen(TargetData),
    Unlisten(TargetId),
    FillWritePipeline,
}

/// Output for the event manager, drained with [`SyncEngine::take_events`].
#[derive(Clone, Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    ListenError(Query, FirestoreError),
    OnlineStateChanged(OnlineState),
}

struct QueryView {
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// The limbo target has reported the document at least once.
    received_document: bool,
}

/// Joins the local store, the views of active queries and the remote store.
///
/// Queries with the same canonical id share one view; queries whose targets match share one
/// target. Documents a view shows but the backend no longer confirms are put in limbo and
/// resolved through single-document listens on odd target ids, at most
/// `max_concurrent_limbo_resolutions` at a time.
pub struct SyncEngine {
    local_store: LocalStore,
    max_concurrent_limbo_resolutions: usize,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Query targets the remote store has been asked to listen to.
    remote_targets: BTreeSet<TargetId>,

    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: ReferenceSet,
    next_limbo_target_id: TargetId,

    /// Write callbacks by user key, then batch id.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, Reply<()>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<Reply<()>>>,

    online_state: OnlineState,
    remote_requests: Vec<RemoteRequest>,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, settings: &FirestoreSettings) -> Self {
        Self {
            local_store,
            max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions(),
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            remote_targets: BTreeSet::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            next_limbo_target_id: 1,
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            remote_requests: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn take_remote_requests(&mut self) -> Vec<RemoteRequest> {
        std::mem::take(&mut self.remote_requests)
    }

    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_listening(&self, query: &Query) -> bool {
        self.query_views.contains_key(&query.canonical_id())
    }

    /// Keys currently waiting for, or under, limbo resolution.
    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts tracking `query` and returns its first snapshot, computed from the cache.
    ///
    /// With `listen_to_remote` unset the view is served from the cache only until
    /// [`SyncEngine::trigger_remote_store_listen`] is called.
    pub fn listen(&mut self, query: Query, listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if let Some(existing) = self.query_views.get(&canonical_id) {
            debug!("Query {query} is already listened to");
            let view = &existing.view;
            let snapshot = ViewSnapshot::from_initial_documents(
                query.clone(),
                view.document_set().clone(),
                view.document_set()
                    .iter()
                    .filter(|doc| doc.has_pending_writes())
                    .map(|doc| doc.key().clone())
                    .collect(),
                !view.is_current(),
                false,
            );
            if listen_to_remote {
                self.trigger_remote_store_listen(&query);
            }
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let shared = self.queries_by_target.contains_key(&target_id);
        // A new view only starts out current when it joins a target another view already
        // has in sync.
        let current = self
            .queries_by_target
            .get(&target_id)
            .into_iter()
            .flatten()
            .filter_map(|q| self.query_views.get(&q.canonical_id()))
            .any(|query_view| query_view.view.is_current());

        let snapshot = match self.initialize_view(query.clone(), &target_data, current) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.local_store.release_target(target_id, shared);
                return Err(err);
            }
        };
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query);
        if listen_to_remote {
            self.listen_to_remote_store(target_data);
        }
        Ok(snapshot)
    }

    /// Asks the backend for a query that so far was only served from the cache.
    pub fn trigger_remote_store_listen(&mut self, query: &Query) {
        let Some(target_data) = self.local_store.get_local_target_data(&query.to_target()).cloned() else {
            warn!("No local target for {query}");
            return;
        };
        self.listen_to_remote_store(target_data);
    }

    /// Stops the backend listen for `query` but keeps serving its view from the cache.
    pub fn trigger_remote_store_unlisten(&mut self, query: &Query) {
        let Some(target_id) = self
            .query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
        else {
            return;
        };
        if self.remote_targets.remove(&target_id) {
            self.remote_requests.push(RemoteRequest::Unlisten(target_id));
        }
    }

    fn listen_to_remote_store(&mut self, target_data: TargetData) {
        if self.remote_targets.insert(target_data.target_id) {
            self.remote_requests.push(RemoteRequest::Listen(target_data));
        }
    }

    fn initialize_view(
        &mut self,
        query: Query,
        target_data: &TargetData,
        current: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let target_id = target_data.target_id;
        let result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);

        let synthesized = TargetChange {
            resume_token: target_data.resume_token.clone(),
            current: current && self.online_state != OnlineState::Offline,
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized));
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error(format!("No initial snapshot for {query}")))?;

        self.query_views
            .insert(query.canonical_id(), QueryView { target_id, view });
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        self.local_store
            .notify_local_view_changes(&[local_view_changes(target_id, &snapshot)]);
        Ok(snapshot)
    }

    /// Stops tracking `query`. The target is released once no query uses it.
    pub fn unlisten(&mut self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.query_views.remove(&canonical_id) else {
            debug!("Ignoring unlisten of unknown query {query}");
            return Ok(());
        };
        let target_id = query_view.target_id;

        let remaining = match self.queries_by_target.get_mut(&target_id) {
            Some(queries) => {
                queries.retain(|q| q.canonical_id() != canonical_id);
                queries.len()
            }
            None => 0,
        };
        if remaining > 0 {
            self.local_store.release_target(target_id, true);
            return Ok(());
        }

        self.queries_by_target.remove(&target_id);
        if self.remote_targets.remove(&target_id) {
            self.remote_requests.push(RemoteRequest::Unlisten(target_id));
        }
        self.remove_limbo_references(target_id);
        self.local_store.release_target(target_id, false);
        Ok(())
    }

    /// Queues `mutations` as one batch. `reply` completes when the backend accepts or
    /// rejects the batch, or right away when the local write fails.
    pub fn write(&mut self, mutations: Vec<Mutation>, reply: Reply<()>) -> FirestoreResult<()> {
        let result = match self.local_store.write_locally(mutations) {
            Ok(result) => result,
            Err(err) => {
                warn!("Failed to persist write: {err}");
                let _ = reply.send(Err(err));
                return Ok(());
            }
        };
        self.mutation_user_callbacks
            .entry(self.local_store.current_user().key().to_string())
            .or_default()
            .insert(result.batch_id, reply);
        self.emit_new_snapshots(result.changes, None)?;
        self.remote_requests.push(RemoteRequest::FillWritePipeline);
        Ok(())
    }

    /// Completes `reply` once every batch queued so far has been acknowledged or rejected.
    pub fn register_pending_writes_callback(&mut self, reply: Reply<()>) {
        let highest = match self.local_store.highest_unacknowledged_batch_id() {
            Ok(highest) => highest,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if highest == BATCH_ID_UNKNOWN {
            let _ = reply.send(Ok(()));
            return;
        }
        self.pending_writes_callbacks
            .entry(highest)
            .or_default()
            .push(reply);
    }

    /// Runs `query` against the cache only, without registering a view.
    pub fn get_documents_from_local_cache(&mut self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        view.apply_changes(doc_changes, false, None)
            .snapshot
            .ok_or_else(|| internal_error(format!("No cache snapshot for {query}")))
    }

    pub fn get_document_from_local_cache(&mut self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.local_store.read_document(key)
    }

    /// Fails every outstanding write and pending-writes callback and stops the local store.
    pub fn shutdown(&mut self) {
        for (_, callbacks) in std::mem::take(&mut self.mutation_user_callbacks) {
            for (_, reply) in callbacks {
                let _ = reply.send(Err(cancelled("The client has been terminated")));
            }
        }
        self.fail_pending_writes_callbacks("The client has been terminated");
        self.local_store.shutdown();
    }

    fn emit_new_snapshots(
        &mut self,
        changes: DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views.values_mut() {
            let view = &mut query_view.view;
            let mut doc_changes = view.compute_doc_changes(&changes, None);
            if doc_changes.needs_refill {
                let result = self.local_store.execute_query(view.query(), false)?;
                doc_changes = view.compute_doc_changes(&result.documents, Some(&doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let view_change = view.apply_changes(doc_changes, true, target_change);

            limbo_updates.push((query_view.target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(query_view.target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        self.local_store.notify_local_view_changes(&view_changes);
        Ok(())
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    debug!("Document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts queued limbo resolutions while fewer than the configured maximum are active.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.next_limbo_target_id;
            self.next_limbo_target_id += 2;

            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), target_id);
            self.remote_requests.push(RemoteRequest::Listen(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(target_id) = self.active_limbo_targets_by_key.remove(key) {
            self.active_limbo_resolutions_by_target.remove(&target_id);
            self.remote_requests.push(RemoteRequest::Unlisten(target_id));
            self.pump_enqueued_limbo_resolutions();
        }
    }

    fn remove_limbo_references(&mut self, target_id: TargetId) {
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, error: Option<FirestoreError>) {
        let user_key = self.local_store.current_user().key().to_string();
        let reply = self
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(reply) = reply {
            let _ = reply.send(error.map_or(Ok(()), Err));
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        let later = self.pending_writes_callbacks.split_off(&(batch_id + 1));
        let ready = std::mem::replace(&mut self.pending_writes_callbacks, later);
        for reply in ready.into_values().flatten() {
            let _ = reply.send(Ok(()));
        }
    }

    fn fail_pending_writes_callbacks(&mut self, message: &str) {
        for reply in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = reply.send(Err(cancelled(message)));
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(limbo) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                error!("Limbo resolution target {target_id} reported {touched} documents");
            }
            if !change.added_documents.is_empty() {
                limbo.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !limbo.received_document {
                    error!("Limbo target {target_id} modified a document it never added");
                }
            } else if !change.removed_documents.is_empty() {
                if !limbo.received_document {
                    error!("Limbo target {target_id} removed a document it never added");
                }
                limbo.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snapshots(changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.remove(&target_id) {
            // The backend refuses to tell us about the document, so treat it as deleted.
            let key = limbo.key;
            self.active_limbo_targets_by_key.remove(&key);
            self.pump_enqueued_limbo_resolutions();

            let mut event = RemoteEvent::new(SnapshotVersion::min());
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event(event);
        }

        self.remote_targets.remove(&target_id);
        let queries = self.queries_by_target.remove(&target_id).unwrap_or_default();
        self.remove_limbo_references(target_id);
        for _ in &queries {
            self.local_store.release_target(target_id, false);
        }
        for query in queries {
            self.query_views.remove(&query.canonical_id());
            self.events
                .push(SyncEngineEvent::ListenError(query, error.clone()));
        }
        Ok(())
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots(changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Some(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots(changes, None)
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.get(&target_id) {
            return if limbo.received_document {
                BTreeSet::from([limbo.key.clone()])
            } else {
                BTreeSet::new()
            };
        }

        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(&mut self, after: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after)
    }

    fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.last_remote_snapshot_version()
    }

    fn apply_online_state_change(&mut self, state: OnlineState) {
        self.online_state = state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(state);
            if !view_change.limbo_changes.is_empty() {
                error!("Online state change produced limbo changes for {}", query_view.view.query());
            }
            snapshots.extend(view_change.snapshot);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        self.events.push(SyncEngineEvent::OnlineStateChanged(state));
    }

    fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        if self.local_store.current_user() == &user {
            return Ok(());
        }
        debug!("User changed to {}", user.key());
        let result = self.local_store.handle_user_change(user)?;
        self.fail_pending_writes_callbacks(
            "wait_for_pending_writes was cancelled by a user change",
        );
        self.emit_new_snapshots(result.affected_documents, None)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Direction;
    use crate::error::{permission_denied, FirestoreErrorCode};
    use crate::local::{MemoryPersistence, Persistence, TransactionBody, TransactionMode};
    use crate::model::{DatabaseId, FieldPath, MutationResult, Timestamp};
    use crate::value::{FirestoreValue, ObjectValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(value: i64) -> ObjectValue {
        let mut object = ObjectValue::empty();
        object.set(
            &FieldPath::from_dot_separated("v").unwrap(),
            FirestoreValue::from_integer(value),
        );
        object
    }

    fn engine_with(settings: FirestoreSettings) -> SyncEngine {
        let mut store = LocalStore::new(Box::new(MemoryPersistence::new()), User::unauthenticated());
        store.start().unwrap();
        SyncEngine::new(store, &settings)
    }

    fn engine() -> SyncEngine {
        engine_with(FirestoreSettings::new(DatabaseId::default("project")))
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    fn snapshots(engine: &mut SyncEngine) -> Vec<ViewSnapshot> {
        engine
            .take_events()
            .into_iter()
            .flat_map(|event| match event {
                SyncEngineEvent::Snapshots(snapshots) => snapshots,
                _ => Vec::new(),
            })
            .collect()
    }

    fn keys(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.documents.keys().map(|k| k.to_string()).collect()
    }

    fn listen_target(engine: &mut SyncEngine) -> TargetData {
        match engine.take_remote_requests().as_slice() {
            [RemoteRequest::Listen(target_data)] => target_data.clone(),
            other => panic!("expected one listen, got {other:?}"),
        }
    }

    /// Event marking `target_id` current with `docs` at `seconds`.
    fn current_event(seconds: i64, target_id: TargetId, docs: &[&str]) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange {
            resume_token: vec![seconds as u8],
            current: true,
            ..TargetChange::default()
        };
        for path in docs {
            change.added_documents.insert(key(path));
            event.document_updates.insert(
                key(path),
                MutableDocument::new_found_document(key(path), version(seconds), data(1)),
            );
        }
        event.target_changes.insert(target_id, change);
        event
    }

    fn ack_next(engine: &mut SyncEngine, seconds: i64) {
        let batch = engine.next_mutation_batch(None).unwrap().unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(seconds), Vec::new()))
            .collect();
        let result = MutationBatchResult::from(batch, version(seconds), results, Vec::new()).unwrap();
        engine.apply_successful_write(result).unwrap();
    }

    #[test]
    fn queries_with_one_target_share_a_listen() {
        let mut engine = engine();
        let first = engine.listen(rooms(), true).unwrap();
        assert!(first.from_cache);
        assert!(first.documents.is_empty());
        let target = listen_target(&mut engine);
        assert_eq!(target.target_id % 2, 0);

        let rank = FieldPath::from_dot_separated("rank").unwrap();
        let first_two = rooms()
            .with_order_by(rank.clone(), Direction::Ascending)
            .with_limit_to_first(2);
        let last_two = rooms()
            .with_order_by(rank, Direction::Descending)
            .with_limit_to_last(2)
            .unwrap();
        assert_ne!(first_two.canonical_id(), last_two.canonical_id());

        engine.listen(first_two.clone(), true).unwrap();
        let shared = listen_target(&mut engine);
        engine.listen(last_two.clone(), true).unwrap();
        assert!(engine.take_remote_requests().is_empty());

        engine.unlisten(&first_two).unwrap();
        assert!(engine.take_remote_requests().is_empty());
        engine.unlisten(&last_two).unwrap();
        assert_eq!(
            engine.take_remote_requests(),
            vec![RemoteRequest::Unlisten(shared.target_id)]
        );

        engine.unlisten(&rooms()).unwrap();
        assert_eq!(
            engine.take_remote_requests(),
            vec![RemoteRequest::Unlisten(target.target_id)]
        );
    }

    #[test]
    fn cache_only_views_listen_on_demand() {
        let mut engine = engine();
        engine.listen(rooms(), false).unwrap();
        assert!(engine.take_remote_requests().is_empty());

        engine.trigger_remote_store_listen(&rooms());
        let target = listen_target(&mut engine);
        engine.trigger_remote_store_unlisten(&rooms());
        assert_eq!(
            engine.take_remote_requests(),
            vec![RemoteRequest::Unlisten(target.target_id)]
        );
        assert!(engine.is_listening(&rooms()));

        engine.unlisten(&rooms()).unwrap();
        assert!(engine.take_remote_requests().is_empty());
    }

    #[test]
    fn remote_event_raises_synced_snapshot() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        let target = listen_target(&mut engine);

        engine
            .apply_remote_event(current_event(1, target.target_id, &["rooms/a", "rooms/b"]))
            .unwrap();
        let raised = snapshots(&mut engine);
        assert_eq!(raised.len(), 1);
        assert!(!raised[0].from_cache);
        assert_eq!(keys(&raised[0]), vec!["rooms/a", "rooms/b"]);
        assert_eq!(
            engine.get_remote_keys_for_target(target.target_id),
            BTreeSet::from([key("rooms/a"), key("rooms/b")])
        );
    }

    #[test]
    fn local_write_is_optimistic_until_acknowledged() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        engine.take_remote_requests();

        let (reply, mut done) = oneshot::channel();
        engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))], reply)
            .unwrap();
        assert_eq!(engine.take_remote_requests(), vec![RemoteRequest::FillWritePipeline]);
        let raised = snapshots(&mut engine);
        assert_eq!(raised.len(), 1);
        assert!(raised[0].has_pending_writes());
        assert!(done.try_recv().unwrap().is_none());

        ack_next(&mut engine, 2);
        assert!(done.try_recv().unwrap().unwrap().is_ok());
        let raised = snapshots(&mut engine);
        assert_eq!(raised.len(), 1);
        assert!(!raised[0].has_pending_writes());
        assert_eq!(keys(&raised[0]), vec!["rooms/a"]);
    }

    #[test]
    fn rejected_write_reverts_and_reports() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        let (reply, mut done) = oneshot::channel();
        engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))], reply)
            .unwrap();
        snapshots(&mut engine);

        let batch = engine.next_mutation_batch(None).unwrap().unwrap();
        engine
            .reject_failed_write(batch.batch_id, permission_denied("no"))
            .unwrap();
        let err = done.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        let raised = snapshots(&mut engine);
        assert!(raised[0].documents.is_empty());
    }

    #[test]
    fn pending_writes_callback_waits_for_current_batches() {
        let mut engine = engine();
        let (reply, mut idle) = oneshot::channel();
        engine.register_pending_writes_callback(reply);
        assert!(idle.try_recv().unwrap().unwrap().is_ok());

        let (write_reply, _write_done) = oneshot::channel();
        engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))], write_reply)
            .unwrap();
        let (reply, mut waiting) = oneshot::channel();
        engine.register_pending_writes_callback(reply);
        assert!(waiting.try_recv().unwrap().is_none());

        ack_next(&mut engine, 1);
        assert!(waiting.try_recv().unwrap().unwrap().is_ok());
    }

    #[test]
    fn user_change_cancels_waiters_and_swaps_local_writes() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        let (write_reply, _write_done) = oneshot::channel();
        engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))], write_reply)
            .unwrap();
        let (reply, mut waiting) = oneshot::channel();
        engine.register_pending_writes_callback(reply);
        snapshots(&mut engine);

        engine.handle_credential_change(User::new("alice")).unwrap();
        let err = waiting.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        let raised = snapshots(&mut engine);
        assert!(raised[0].documents.is_empty());

        engine
            .handle_credential_change(User::unauthenticated())
            .unwrap();
        let raised = snapshots(&mut engine);
        assert_eq!(keys(&raised[0]), vec!["rooms/a"]);
    }

    /// Removes `docs` from `target_id` without telling the client what happened to them.
    fn drop_from_target(seconds: i64, target_id: TargetId, docs: &[&str]) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange {
            resume_token: vec![seconds as u8],
            current: true,
            ..TargetChange::default()
        };
        change.removed_documents = docs.iter().map(|path| key(path)).collect();
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn documents_dropped_by_target_go_to_limbo() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        let target = listen_target(&mut engine);
        engine
            .apply_remote_event(current_event(1, target.target_id, &["rooms/a", "rooms/b"]))
            .unwrap();
        snapshots(&mut engine);

        engine
            .apply_remote_event(drop_from_target(2, target.target_id, &["rooms/b"]))
            .unwrap();
        let limbo = listen_target(&mut engine);
        assert_eq!(limbo.target_id, 1);
        assert_eq!(limbo.purpose, TargetPurpose::LimboResolution);
        assert_eq!(limbo.target, Target::for_document(&key("rooms/b")));
        let raised = snapshots(&mut engine);
        assert!(raised[0].from_cache);
        assert!(engine.get_remote_keys_for_target(1).is_empty());

        // The limbo target reports the document gone.
        let mut resolved = RemoteEvent::new(version(3));
        resolved.target_changes.insert(
            1,
            TargetChange {
                current: true,
                ..TargetChange::default()
            },
        );
        resolved.document_updates.insert(
            key("rooms/b"),
            MutableDocument::new_no_document(key("rooms/b"), version(3)),
        );
        resolved.resolved_limbo_documents.insert(key("rooms/b"));
        engine.apply_remote_event(resolved).unwrap();

        assert_eq!(engine.take_remote_requests(), vec![RemoteRequest::Unlisten(1)]);
        let raised = snapshots(&mut engine);
        assert_eq!(keys(&raised[0]), vec!["rooms/a"]);
        assert!(!raised[0].from_cache);
    }

    #[test]
    fn limbo_resolutions_are_throttled_and_rejections_delete() {
        let settings = FirestoreSettings::new(DatabaseId::default("project"))
            .with_max_concurrent_limbo_resolutions(1)
            .unwrap();
        let mut engine = engine_with(settings);
        engine.listen(rooms(), true).unwrap();
        let target = listen_target(&mut engine);
        engine
            .apply_remote_event(current_event(
                1,
                target.target_id,
                &["rooms/a", "rooms/b", "rooms/c"],
            ))
            .unwrap();
        engine
            .apply_remote_event(drop_from_target(2, target.target_id, &["rooms/b", "rooms/c"]))
            .unwrap();
        snapshots(&mut engine);

        let first = listen_target(&mut engine);
        assert_eq!(first.target, Target::for_document(&key("rooms/b")));
        assert_eq!(engine.enqueued_limbo_documents(), vec![key("rooms/c")]);

        engine.reject_listen(first.target_id, permission_denied("no")).unwrap();
        let second = listen_target(&mut engine);
        assert_eq!(second.target_id, 3);
        assert_eq!(second.target, Target::for_document(&key("rooms/c")));
        let raised = snapshots(&mut engine);
        assert_eq!(keys(&raised[0]), vec!["rooms/a", "rooms/c"]);
    }

    #[test]
    fn rejected_query_target_reports_error() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        let target = listen_target(&mut engine);
        engine
            .reject_listen(target.target_id, permission_denied("denied"))
            .unwrap();
        let events = engine.take_events();
        assert!(matches!(
            events.as_slice(),
            [SyncEngineEvent::ListenError(query, err)]
                if *query == rooms() && err.code == FirestoreErrorCode::PermissionDenied
        ));
        assert!(!engine.is_listening(&rooms()));
    }

    #[test]
    fn offline_marks_views_from_cache() {
        let mut engine = engine();
        engine.listen(rooms(), true).unwrap();
        let target = listen_target(&mut engine);
        engine
            .apply_remote_event(current_event(1, target.target_id, &["rooms/a"]))
            .unwrap();
        snapshots(&mut engine);

        engine.apply_online_state_change(OnlineState::Offline);
        let events = engine.take_events();
        assert!(matches!(
            events.as_slice(),
            [SyncEngineEvent::Snapshots(raised), SyncEngineEvent::OnlineStateChanged(OnlineState::Offline)]
                if raised.len() == 1 && raised[0].from_cache
        ));
    }

    #[test]
    fn cache_reads_do_not_register_views() {
        let mut engine = engine();
        let (reply, _done) = oneshot::channel();
        engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))], reply)
            .unwrap();
        let snapshot = engine.get_documents_from_local_cache(rooms()).unwrap();
        assert_eq!(keys(&snapshot), vec!["rooms/a"]);
        assert!(snapshot.from_cache);
        assert!(!engine.is_listening(&rooms()));
    }

    /// Memory persistence that cannot delete targets.
    struct StuckTargetsPersistence(MemoryPersistence);

    impl Persistence for StuckTargetsPersistence {
        fn start(&mut self) -> FirestoreResult<()> {
            self.0.start()
        }

        fn shutdown(&mut self) {
            self.0.shutdown()
        }

        fn is_started(&self) -> bool {
            self.0.is_started()
        }

        fn set_user(&mut self, user: &User) {
            self.0.set_user(user)
        }

        fn transaction_scope(
            &mut self,
            label: &str,
            mode: TransactionMode,
            body: &mut TransactionBody<'_>,
        ) -> FirestoreResult<()> {
            if label == "Release target" {
                return Err(internal_error("disk I/O error"));
            }
            self.0.transaction_scope(label, mode, body)
        }
    }

    #[test]
    fn failed_release_still_stops_the_remote_listen() {
        let mut store = LocalStore::new(
            Box::new(StuckTargetsPersistence(MemoryPersistence::new())),
            User::unauthenticated(),
        );
        store.start().unwrap();
        let mut engine = SyncEngine::new(store, &FirestoreSettings::new(DatabaseId::default("project")));

        engine.listen(rooms(), true).unwrap();
        let target = listen_target(&mut engine);
        engine.unlisten(&rooms()).unwrap();
        assert_eq!(
            engine.take_remote_requests(),
            vec![RemoteRequest::Unlisten(target.target_id)]
        );
        assert!(!engine.is_listening(&rooms()));

        // The target id is free again for the next listen.
        engine.listen(rooms(), true).unwrap();
        assert!(matches!(
            engine.take_remote_requests().as_slice(),
            [RemoteRequest::Listen(_)]
        ));
    }
}
