use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::engine::{ChangeType, Query, SyncEngine, SyncEngineEvent, ViewSnapshot};
use crate::error::{FirestoreError, FirestoreResult};
use crate::remote::OnlineState;

/// Receives every snapshot or the terminal error of one listener.
pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

pub type ListenerId = u64;

/// Where a listener takes its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// Cache first, then the backend.
    #[default]
    Default,
    /// Only the local cache; the backend is never asked.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots that only change metadata (pending writes or from-cache state).
    pub include_metadata_changes: bool,
    pub source: ListenSource,
}

/// One subscriber to a query. Decides which view snapshots reach its observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    active: Arc<AtomicBool>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            query,
            options,
            observer,
            active: Arc::new(AtomicBool::new(true)),
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Flag checked right before every delivery. Clearing it silences the listener even
    /// while its removal is still queued.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    fn deliver(&self, result: FirestoreResult<ViewSnapshot>) {
        if self.active.load(Ordering::Acquire) {
            (self.observer)(result);
        }
    }

    /// Returns whether an event reached the observer.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            ViewSnapshot {
                sync_state_changed: snapshot.sync_state_changed || !snapshot.document_changes.is_empty(),
                ..snapshot
            }
        } else {
            ViewSnapshot {
                document_changes: snapshot
                    .document_changes
                    .into_iter()
                    .filter(|change| change.change_type != ChangeType::Metadata)
                    .collect(),
                exclude_metadata_changes: true,
                ..snapshot
            }
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.deliver(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: FirestoreError) {
        self.deliver(Err(error));
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        match self.snapshot.clone() {
            Some(snapshot)
                if !self.raised_initial_event
                    && self.should_raise_initial_event(&snapshot, online_state) =>
            {
                self.raise_initial_event(&snapshot);
                true
            }
            _ => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        // Hold back an empty cached result while the backend may still answer.
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.deliver(Ok(initial));
    }
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners
            .iter()
            .any(|(_, listener)| listener.listens_to_remote_store())
    }
}

/// Fans view snapshots out to the listeners of each query and asks the sync engine to start
/// or stop queries as listeners come and go.
pub struct EventManager {
    queries: BTreeMap<String, QueryListenersInfo>,
    query_by_listener: HashMap<ListenerId, String>,
    next_listener_id: ListenerId,
    online_state: OnlineState,
    online_state_handlers: Vec<OnlineStateHandler>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            queries: BTreeMap::new(),
            query_by_listener: HashMap::new(),
            next_listener_id: 1,
            online_state: OnlineState::Unknown,
            online_state_handlers: Vec::new(),
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn listener_count(&self) -> usize {
        self.query_by_listener.len()
    }

    /// Registers `listener`, starting its query in the sync engine when it is the first
    /// listener, and replays the latest snapshot to it.
    pub fn listen(
        &mut self,
        mut listener: QueryListener,
        sync_engine: &mut SyncEngine,
    ) -> FirestoreResult<ListenerId> {
        let canonical_id = listener.query().canonical_id();
        let (first_listen, needs_remote) = match self.queries.get(&canonical_id) {
            None => (true, listener.listens_to_remote_store()),
            Some(info) => (
                false,
                listener.listens_to_remote_store() && !info.has_remote_listeners(),
            ),
        };

        if first_listen {
            let snapshot = sync_engine.listen(listener.query().clone(), needs_remote)?;
            self.queries.insert(
                canonical_id.clone(),
                QueryListenersInfo {
                    view_snapshot: Some(snapshot),
                    listeners: Vec::new(),
                },
            );
        } else if needs_remote {
            sync_engine.trigger_remote_store_listen(listener.query());
        }

        let listener_id = self.next_listener_id;
        self.next_listener_id += 1;
        listener.apply_online_state_change(self.online_state);

        let info = self.queries.entry(canonical_id.clone()).or_default();
        if let Some(snapshot) = info.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        info.listeners.push((listener_id, listener));
        self.query_by_listener.insert(listener_id, canonical_id);
        Ok(listener_id)
    }

    /// Drops a listener. The last listener of a query stops it in the sync engine.
    pub fn unlisten(&mut self, listener_id: ListenerId, sync_engine: &mut SyncEngine) -> FirestoreResult<()> {
        let Some(canonical_id) = self.query_by_listener.remove(&listener_id) else {
            debug!("Ignoring unlisten of unknown listener {listener_id}");
            return Ok(());
        };
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return Ok(());
        };
        let Some(position) = info.listeners.iter().position(|(id, _)| *id == listener_id) else {
            return Ok(());
        };
        let (_, listener) = info.listeners.remove(position);

        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            sync_engine.unlisten(listener.query())
        } else {
            if listener.listens_to_remote_store() && !info.has_remote_listeners() {
                sync_engine.trigger_remote_store_unlisten(listener.query());
            }
            Ok(())
        }
    }

    pub fn add_online_state_handler(&mut self, handler: OnlineStateHandler) {
        handler(self.online_state);
        self.online_state_handlers.push(handler);
    }

    /// Routes one batch of sync engine output to the listeners.
    pub fn handle_sync_engine_event(&mut self, event: SyncEngineEvent) {
        match event {
            SyncEngineEvent::Snapshots(snapshots) => self.on_watch_change(snapshots),
            SyncEngineEvent::ListenError(query, error) => self.on_watch_error(&query, error),
            SyncEngineEvent::OnlineStateChanged(state) => self.on_online_state_change(state),
        }
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in &mut info.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    /// The query failed for good; every listener gets the error and is dropped.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) {
        let Some(info) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        warn!("Listen to {query} failed: {error}");
        for (listener_id, listener) in info.listeners {
            self.query_by_listener.remove(&listener_id);
            listener.on_error(error.clone());
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        if self.online_state == online_state {
            return;
        }
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for (_, listener) in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
        for handler in &self.online_state_handlers {
            handler(online_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::{DocumentSet, DocumentViewChange};
    use crate::error::permission_denied;
    use crate::local::{LocalStore, MemoryPersistence};
    use crate::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, Timestamp, User};
    use crate::remote::RemoteSyncer;
    use crate::settings::FirestoreSettings;
    use crate::value::ObjectValue;

    type Seen = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn recording_listener(query: Query, options: ListenOptions) -> (QueryListener, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: SnapshotObserver = Arc::new(move |result| sink.lock().unwrap().push(result));
        (QueryListener::new(query, options, observer), seen)
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    fn sync_engine() -> SyncEngine {
        let mut store = LocalStore::new(Box::new(MemoryPersistence::new()), User::unauthenticated());
        store.start().unwrap();
        SyncEngine::new(store, &FirestoreSettings::new(DatabaseId::default("project")))
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        )
    }

    fn snapshot_with(docs: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut documents = DocumentSet::for_query(&rooms());
        for path in docs {
            documents.insert(doc(path));
        }
        let document_changes = documents
            .iter()
            .map(|d| DocumentViewChange::new(ChangeType::Added, d.clone()))
            .collect();
        ViewSnapshot {
            query: rooms(),
            old_documents: documents.empty_like(),
            documents,
            document_changes,
            mutated_keys: Default::default(),
            from_cache,
            sync_state_changed: true,
            exclude_metadata_changes: false,
            has_cached_results: false,
        }
    }

    #[test]
    fn empty_cached_result_waits_for_backend() {
        let (mut listener, seen) = recording_listener(rooms(), ListenOptions::default());
        assert!(!listener.on_view_snapshot(snapshot_with(&[], true)));
        assert!(seen.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let (mut plain, plain_seen) = recording_listener(rooms(), ListenOptions::default());
        let (mut with_metadata, metadata_seen) = recording_listener(
            rooms(),
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
        );
        for listener in [&mut plain, &mut with_metadata] {
            listener.on_view_snapshot(snapshot_with(&["rooms/a"], true));
            let mut synced = snapshot_with(&["rooms/a"], false);
            synced.document_changes.clear();
            listener.on_view_snapshot(synced);
        }
        assert_eq!(plain_seen.lock().unwrap().len(), 1);
        assert_eq!(metadata_seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn metadata_listeners_see_change_entries_as_sync_state_changes() {
        let (mut listener, seen) = recording_listener(
            rooms(),
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
        );
        listener.on_view_snapshot(snapshot_with(&["rooms/a"], false));
        let mut added = snapshot_with(&["rooms/a", "rooms/b"], false);
        added.sync_state_changed = false;
        added.document_changes.retain(|change| change.document.key().id() == "b");
        listener.on_view_snapshot(added);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].as_ref().unwrap().sync_state_changed);
    }

    #[test]
    fn inactive_listener_is_silenced() {
        let (mut listener, seen) = recording_listener(rooms(), ListenOptions::default());
        listener.active_flag().store(false, Ordering::Release);
        listener.on_view_snapshot(snapshot_with(&["rooms/a"], false));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn listeners_share_one_query() {
        let mut engine = sync_engine();
        let mut events = EventManager::new();
        let (first, _) = recording_listener(rooms(), ListenOptions::default());
        let (second, _) = recording_listener(rooms(), ListenOptions::default());

        let first_id = events.listen(first, &mut engine).unwrap();
        assert_eq!(engine.take_remote_requests().len(), 1);
        let second_id = events.listen(second, &mut engine).unwrap();
        assert!(engine.take_remote_requests().is_empty());

        events.unlisten(first_id, &mut engine).unwrap();
        assert!(engine.is_listening(&rooms()));
        events.unlisten(second_id, &mut engine).unwrap();
        assert!(!engine.is_listening(&rooms()));
        assert_eq!(engine.take_remote_requests().len(), 1);
    }

    #[test]
    fn cache_listener_upgrades_when_default_listener_joins() {
        let mut engine = sync_engine();
        let mut events = EventManager::new();
        let cache_only = ListenOptions {
            source: ListenSource::Cache,
            ..ListenOptions::default()
        };
        let (cache_listener, cache_seen) = recording_listener(rooms(), cache_only);
        events.listen(cache_listener, &mut engine).unwrap();
        assert!(engine.take_remote_requests().is_empty());
        assert_eq!(cache_seen.lock().unwrap().len(), 1);

        let (remote_listener, _) = recording_listener(rooms(), ListenOptions::default());
        let remote_id = events.listen(remote_listener, &mut engine).unwrap();
        assert_eq!(engine.take_remote_requests().len(), 1);

        events.unlisten(remote_id, &mut engine).unwrap();
        assert_eq!(engine.take_remote_requests().len(), 1);
        assert!(engine.is_listening(&rooms()));
    }

    #[test]
    fn watch_error_reaches_every_listener() {
        let mut engine = sync_engine();
        let mut events = EventManager::new();
        let (listener, seen) = recording_listener(rooms(), ListenOptions::default());
        events.listen(listener, &mut engine).unwrap();
        let target_id = match engine.take_remote_requests().pop() {
            Some(crate::engine::RemoteRequest::Listen(data)) => data.target_id,
            other => panic!("unexpected {other:?}"),
        };

        engine.reject_listen(target_id, permission_denied("nope")).unwrap();
        for event in engine.take_events() {
            events.handle_sync_engine_event(event);
        }
        assert_eq!(events.listener_count(), 0);
        let seen = seen.lock().unwrap();
        assert!(seen.last().unwrap().is_err());
    }

    #[test]
    fn online_state_handlers_see_changes() {
        let mut events = EventManager::new();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        events.add_online_state_handler(Arc::new(move |state| sink.lock().unwrap().push(state)));
        events.on_online_state_change(OnlineState::Online);
        events.on_online_state_change(OnlineState::Online);
        events.on_online_state_change(OnlineState::Offline);
        assert_eq!(
            *states.lock().unwrap(),
            vec![OnlineState::Unknown, OnlineState::Online, OnlineState::Offline]
        );
    }
}
