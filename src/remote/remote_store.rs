use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde_json::Value as JsonValue;

use crate::error::{internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::local::TargetData;
use crate::model::{DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, User};
use crate::platform::runtime;
use crate::remote::backoff::ExponentialBackoff;
use crate::remote::datastore::{Connection, StreamKind, TokenProviderArc};
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{PersistentStream, StreamEvent, StreamEventSink};
use crate::remote::watch_change::{decode_watch_change, TargetChangeState, WatchChange, WatchTargetChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::settings::FirestoreSettings;

/// Reasons the remote store keeps the network off. The network is used only while the set
/// is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    ConnectivityChange,
    /// A local storage operation failed; retried until storage answers again.
    StorageUnavailable,
    Shutdown,
}

/// Target metadata seen by the aggregator: the targets listened to plus the syncer's view of
/// their documents.
struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }
}

/// Owns the watch and write streams.
///
/// The remote store keeps the backend's view of the listened targets in sync with
/// `listen_targets` and streams queued mutation batches to the backend. Stream I/O runs on
/// detached tasks; their [`StreamEvent`]s must be fed back through
/// [`RemoteStore::handle_stream_event`] in the order they were posted.
pub struct RemoteStore {
    serializer: JsonProtoSerializer,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    /// Targets that should be listened to, with the latest resume token for each.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or to be sent) on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    write_handshake_complete: bool,
    /// Last stream token from the write stream; sent with every write request.
    stream_token: Vec<u8>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
    online_state_timeout: Duration,
    storage_retry_delay: Duration,
    max_pending_writes: usize,
    sink: StreamEventSink,
}

impl RemoteStore {
    pub fn new(
        settings: &FirestoreSettings,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        sink: StreamEventSink,
    ) -> Self {
        let watch_stream = PersistentStream::new(
            StreamKind::Listen,
            Arc::clone(&connection),
            Arc::clone(&token_provider),
            ExponentialBackoff::new(settings.backoff().clone()),
            settings.idle_timeout(),
            Arc::clone(&sink),
        );
        let write_stream = PersistentStream::new(
            StreamKind::Write,
            connection,
            token_provider,
            ExponentialBackoff::new(settings.backoff().clone()),
            settings.idle_timeout(),
            Arc::clone(&sink),
        );
        Self {
            serializer: JsonProtoSerializer::new(settings.database_id().clone()),
            watch_stream,
            write_stream,
            listen_targets: BTreeMap::new(),
            watch_aggregator: None,
            write_pipeline: VecDeque::new(),
            write_handshake_complete: false,
            stream_token: Vec::new(),
            offline_causes: BTreeSet::new(),
            online_state_tracker: OnlineStateTracker::new(),
            online_state_timeout: settings.online_state_timeout(),
            storage_retry_delay: settings.backoff().initial_delay,
            max_pending_writes: settings.max_pending_writes(),
            sink,
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    /// Starts listening to `target_data`. Already listened targets are ignored.
    pub fn listen(&mut self, target_data: TargetData, syncer: &mut dyn RemoteSyncer) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data, &*syncer);
        }
    }

    pub fn unlisten(&mut self, target_id: TargetId, syncer: &mut dyn RemoteSyncer) {
        if self.listen_targets.remove(&target_id).is_none() {
            debug!("unlisten of unknown target {target_id}");
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // No targets means no stream, which says nothing about the network.
                self.set_online_state(OnlineState::Unknown, syncer);
            }
        }
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer)
    }

    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Offline, syncer);
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        debug!("RemoteStore shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Unknown, syncer);
    }

    /// Restarts both streams under the new user's credentials.
    pub fn handle_credential_change(
        &mut self,
        user: User,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        debug!("RemoteStore received new credentials");
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Unknown, syncer);
        let result = syncer.handle_credential_change(user);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(syncer)?;
        result
    }

    /// The device's network changed; reconnect immediately instead of waiting out a backoff.
    pub fn handle_connectivity_change(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        debug!("RemoteStore restarting streams for a connectivity change");
        self.offline_causes.insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Unknown, syncer);
        self.watch_stream.inhibit_backoff();
        self.write_stream.inhibit_backoff();
        self.offline_causes.remove(&OfflineCause::ConnectivityChange);
        self.enable_network_internal(syncer)
    }

    /// Pulls batches from the mutation queue until the pipeline is full, starting the write
    /// stream if needed.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    /// Routes an event posted by a stream task or timer.
    ///
    /// A `StorageUnavailable` failure from the syncer takes the network down until storage
    /// answers again; other errors are returned.
    pub fn handle_stream_event(
        &mut self,
        event: StreamEvent,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let result = self.dispatch_stream_event(event, syncer);
        match result {
            Err(err) if err.code == FirestoreErrorCode::StorageUnavailable => {
                self.disable_network_until_recovery(&err, syncer);
                Ok(())
            }
            other => other,
        }
    }

    fn dispatch_stream_event(
        &mut self,
        event: StreamEvent,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        match event {
            StreamEvent::Opened {
                kind: StreamKind::Listen,
                generation,
                sender,
            } => {
                if self.watch_stream.handle_opened(generation, sender) {
                    self.on_watch_stream_open(&*syncer);
                }
                Ok(())
            }
            StreamEvent::Opened {
                kind: StreamKind::Write,
                generation,
                sender,
            } => {
                if self.write_stream.handle_opened(generation, sender) {
                    self.on_write_stream_open();
                }
                Ok(())
            }
            StreamEvent::Message {
                kind: StreamKind::Listen,
                generation,
                payload,
            } => {
                if !self.watch_stream.handle_message(generation) {
                    return Ok(());
                }
                self.on_watch_stream_message(&payload, syncer)
            }
            StreamEvent::Message {
                kind: StreamKind::Write,
                generation,
                payload,
            } => {
                if !self.write_stream.handle_message(generation) {
                    return Ok(());
                }
                self.on_write_stream_message(&payload, syncer)
            }
            StreamEvent::Closed {
                kind: StreamKind::Listen,
                generation,
                error,
            } => {
                if self.watch_stream.handle_closed(generation, error.as_ref()) {
                    self.on_watch_stream_close(error, syncer);
                }
                Ok(())
            }
            StreamEvent::Closed {
                kind: StreamKind::Write,
                generation,
                error,
            } => {
                if self.write_stream.handle_closed(generation, error.as_ref()) {
                    self.on_write_stream_close(error, syncer)?;
                }
                Ok(())
            }
            StreamEvent::BackoffElapsed { kind, generation } => {
                self.stream_mut(kind).handle_backoff_elapsed(generation);
                Ok(())
            }
            StreamEvent::IdleTimeout {
                kind,
                generation,
                idle_token,
            } => {
                if !self.stream_mut(kind).handle_idle_timeout(generation, idle_token) {
                    return Ok(());
                }
                match kind {
                    StreamKind::Listen => {
                        self.on_watch_stream_close(None, syncer);
                        Ok(())
                    }
                    StreamKind::Write => self.on_write_stream_close(None, syncer),
                }
            }
            StreamEvent::OnlineStateTimeout { token } => {
                if let Some(state) = self.online_state_tracker.handle_timeout(token) {
                    syncer.apply_online_state_change(state);
                }
                Ok(())
            }
            StreamEvent::StorageRetry { attempt } => self.retry_storage(attempt, syncer),
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut PersistentStream {
        match kind {
            StreamKind::Listen => &mut self.watch_stream,
            StreamKind::Write => &mut self.write_stream,
        }
    }

    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn set_online_state(&mut self, state: OnlineState, syncer: &mut dyn RemoteSyncer) {
        if let Some(changed) = self.online_state_tracker.set(state) {
            syncer.apply_online_state_change(changed);
        }
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.set_online_state(OnlineState::Unknown, syncer);
        }
        self.fill_write_pipeline(syncer)
    }

    fn disable_network_internal(&mut self) {
        self.watch_stream.stop();
        self.write_stream.stop();
        if !self.write_pipeline.is_empty() {
            debug!(
                "Stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.write_handshake_complete = false;
        self.watch_aggregator = None;
    }

    fn disable_network_until_recovery(&mut self, err: &FirestoreError, syncer: &mut dyn RemoteSyncer) {
        warn!("Disabling network until local storage recovers: {err}");
        self.offline_causes.insert(OfflineCause::StorageUnavailable);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Offline, syncer);
        self.schedule_storage_retry(1);
    }

    fn schedule_storage_retry(&self, attempt: u32) {
        let sink = Arc::clone(&self.sink);
        let delay = self.storage_retry_delay;
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            sink(StreamEvent::StorageRetry { attempt });
        });
    }

    fn retry_storage(&mut self, attempt: u32, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.offline_causes.contains(&OfflineCause::StorageUnavailable) {
            return Ok(());
        }
        match syncer.last_remote_snapshot_version() {
            Ok(_) => {
                debug!("Local storage recovered after {attempt} attempts");
                self.offline_causes.remove(&OfflineCause::StorageUnavailable);
                self.enable_network_internal(syncer)
            }
            Err(err) if err.code == FirestoreErrorCode::StorageUnavailable => {
                debug!("Local storage still unavailable: {err}");
                self.schedule_storage_retry(attempt + 1);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self) {
        self.watch_aggregator = Some(WatchChangeAggregator::new(self.serializer.clone()));
        self.watch_stream.start();
        if let Some(token) = self.online_state_tracker.handle_watch_stream_start() {
            let sink = Arc::clone(&self.sink);
            let timeout = self.online_state_timeout;
            runtime::spawn_detached(async move {
                runtime::sleep(timeout).await;
                sink(StreamEvent::OnlineStateTimeout { token });
            });
        }
    }

    fn send_watch_request(&mut self, target_data: TargetData, syncer: &dyn RemoteSyncer) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        let target_data = if resuming {
            let expected_count = syncer.get_remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        let request = self.serializer.encode_listen_request(&target_data);
        self.watch_stream.send(&request);
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let request = self.serializer.encode_unlisten_request(target_id);
        self.watch_stream.send(&request);
    }

    fn on_watch_stream_open(&mut self, syncer: &dyn RemoteSyncer) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data, syncer);
        }
    }

    fn on_watch_stream_close(&mut self, error: Option<FirestoreError>, syncer: &mut dyn RemoteSyncer) {
        self.watch_aggregator = None;
        if self.should_start_watch_stream() {
            let reason = error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "stream closed".to_string());
            if let Some(state) = self.online_state_tracker.handle_watch_stream_failure(&reason) {
                syncer.apply_online_state_change(state);
            }
            self.start_watch_stream();
        } else {
            // Closed on purpose, nothing to reconnect.
            self.set_online_state(OnlineState::Unknown, syncer);
        }
    }

    fn on_watch_stream_message(
        &mut self,
        payload: &[u8],
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let decoded = serde_json::from_slice::<JsonValue>(payload)
            .map_err(|err| internal_error(format!("Malformed listen response: {err}")))
            .and_then(|message| {
                let version = self.version_from_listen_response(&message)?;
                Ok((decode_watch_change(&self.serializer, &message)?, version))
            });
        let (change, snapshot_version) = match decoded {
            Ok((Some(change), version)) => (change, version),
            Ok((None, _)) => {
                debug!("Ignoring listen response without a recognized change");
                return Ok(());
            }
            Err(err) => {
                warn!("Restarting the watch stream after an undecodable message: {err}");
                self.watch_stream.fail(&err);
                self.on_watch_stream_close(Some(err), syncer);
                return Ok(());
            }
        };

        self.set_online_state(OnlineState::Online, syncer);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove && target_change.cause.is_some() {
                return self.handle_target_error(target_change, syncer);
            }
        }

        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            let metadata = ListenMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            aggregator.handle_watch_change(change, &metadata);
        }

        if !snapshot_version.is_min() && snapshot_version >= syncer.last_remote_snapshot_version()? {
            self.raise_watch_snapshot(snapshot_version, syncer)?;
        }
        Ok(())
    }

    /// Only a global target change (no target ids) carries a consistent snapshot version.
    fn version_from_listen_response(&self, message: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let Some(target_change) = message.get("targetChange") else {
            return Ok(SnapshotVersion::min());
        };
        let has_targets = target_change
            .get("targetIds")
            .and_then(JsonValue::as_array)
            .is_some_and(|ids| !ids.is_empty());
        if has_targets {
            return Ok(SnapshotVersion::min());
        }
        self.serializer.decode_version(target_change.get("readTime"))
    }

    fn handle_target_error(
        &mut self,
        change: &WatchTargetChange,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                warn!("Listen for target {target_id} rejected: {cause}");
                if let Some(aggregator) = self.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                syncer.reject_listen(*target_id, cause.clone())?;
            }
        }
        Ok(())
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return Ok(());
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            syncer: &*syncer,
        };
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        // Mismatched targets are listened to again from scratch, under the mismatch purpose.
        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(request, &*syncer);
        }

        syncer.apply_remote_event(event)
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_handshake_complete {
            self.send_write_request(&batch);
        }
        self.write_pipeline.push_back(batch);
    }

    fn send_write_request(&mut self, batch: &MutationBatch) {
        let request = self
            .serializer
            .encode_write_request(&self.stream_token, &batch.mutations);
        self.write_stream.send(&request);
    }

    fn on_write_stream_open(&mut self) {
        self.write_handshake_complete = false;
        let handshake = self.serializer.encode_write_handshake();
        self.write_stream.send(&handshake);
    }

    fn on_write_stream_message(
        &mut self,
        payload: &[u8],
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let response = match self.decode_write_response(payload) {
            Ok(response) => response,
            Err(err) => {
                warn!("Restarting the write stream after an undecodable message: {err}");
                self.write_stream.fail(&err);
                return self.on_write_stream_close(Some(err), syncer);
            }
        };
        self.stream_token = response.stream_token;

        if !self.write_handshake_complete {
            debug!("Write stream handshake complete");
            self.write_handshake_complete = true;
            let batches: Vec<MutationBatch> = self.write_pipeline.iter().cloned().collect();
            for batch in &batches {
                self.send_write_request(batch);
            }
            return Ok(());
        }

        let Some(batch) = self.write_pipeline.pop_front() else {
            error!("Write response received with no batch in flight");
            return Ok(());
        };
        let results = self
            .serializer
            .decode_write_results(response.write_results.as_ref(), response.commit_version)?;
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            results,
            self.stream_token.clone(),
        )?;
        syncer.apply_successful_write(result)?;
        self.fill_write_pipeline(syncer)
    }

    fn decode_write_response(&self, payload: &[u8]) -> FirestoreResult<WriteResponse> {
        let message = serde_json::from_slice::<JsonValue>(payload)
            .map_err(|err| internal_error(format!("Malformed write response: {err}")))?;
        Ok(WriteResponse {
            stream_token: self.serializer.decode_bytes(message.get("streamToken"))?,
            commit_version: self.serializer.decode_version(message.get("commitTime"))?,
            write_results: message.get("writeResults").cloned(),
        })
    }

    fn on_write_stream_close(
        &mut self,
        error: Option<FirestoreError>,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        if let Some(err) = error {
            if self.write_handshake_complete {
                self.handle_write_error(err, syncer)?;
            } else {
                self.handle_handshake_error(&err);
            }
        }
        self.write_handshake_complete = false;

        // Transient failures resend every in-flight batch on the next stream.
        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    fn handle_handshake_error(&mut self, err: &FirestoreError) {
        if is_permanent_error(err.code) {
            debug!("Write stream handshake failed permanently ({err}); resetting stream token");
            self.stream_token.clear();
        }
    }

    fn handle_write_error(&mut self, err: FirestoreError, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !is_permanent_write_error(err.code) {
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        // The failure belongs to the batch, not the connection.
        self.write_stream.inhibit_backoff();
        syncer.reject_failed_write(batch.batch_id, err)?;
        self.fill_write_pipeline(syncer)
    }
}

struct WriteResponse {
    stream_token: Vec<u8>,
    commit_version: SnapshotVersion,
    write_results: Option<JsonValue>,
}
