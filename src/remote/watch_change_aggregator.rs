use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::engine::ChangeType;
use crate::local::{TargetData, TargetPurpose};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};

/// What the aggregator needs to know about the targets it reconciles.
pub trait TargetMetadataProvider {
    /// Keys the target matched as of the last raised snapshot.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` once the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplicationStatus {
    Success,
    Skipped,
    FalsePositive,
}

/// Folds individual watch changes into [`RemoteEvent`]s at consistent snapshot versions.
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each pending document was seen for; used to find limbo-only documents.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_watch_change(
        &mut self,
        change: WatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        match change {
            WatchChange::TargetChange(target_change) => {
                self.handle_target_change(target_change, metadata)
            }
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids,
                removed_target_ids,
                key,
                document,
            }) => self.handle_document_change(
                &updated_target_ids,
                &removed_target_ids,
                &key,
                Some(document),
                metadata,
            ),
            WatchChange::DocumentDelete(DocumentDelete {
                key,
                read_time,
                removed_target_ids,
            }) => {
                let deleted = MutableDocument::new_no_document(key.clone(), read_time);
                self.handle_document_change(&[], &removed_target_ids, &key, Some(deleted), metadata)
            }
            WatchChange::DocumentRemove(DocumentRemove {
                key,
                removed_target_ids,
                ..
            }) => self.handle_document_change(&[], &removed_target_ids, &key, None, metadata),
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(filter, metadata),
        }
    }

    /// Counts a listen or unlisten request whose acknowledgment has not arrived yet.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Forgets `target_id`, e.g. after the backend rejected it.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn handle_document_change(
        &mut self,
        updated_target_ids: &[TargetId],
        removed_target_ids: &[TargetId],
        key: &DocumentKey,
        document: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in updated_target_ids {
            match &document {
                Some(doc) if doc.is_found_document() => {
                    self.add_document_to_target(*target_id, doc.clone(), metadata)
                }
                _ => self.remove_document_from_target(*target_id, key, document.clone(), metadata),
            }
        }
        for target_id in removed_target_ids {
            self.remove_document_from_target(*target_id, key, document.clone(), metadata);
        }
    }

    fn handle_target_change(
        &mut self,
        change: WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_ids: Vec<TargetId> = if change.target_ids.is_empty() {
            self.target_states
                .keys()
                .copied()
                .filter(|id| self.is_active_target(*id, metadata))
                .collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A target re-added after a removal starts from scratch.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn handle_existence_filter(
        &mut self,
        filter: ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted while the client was not listening.
                match DocumentKey::from_path(target_data.target.path().clone()) {
                    Ok(key) => {
                        let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                        self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    }
                    Err(err) => warn!("Document target {target_id} has an invalid path: {err}"),
                }
            } else if expected_count != 1 {
                warn!("Single document existence filter for target {target_id} reported {expected_count} documents");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == i64::from(expected_count) {
            return;
        }

        let status = match self.parse_bloom_filter(&filter) {
            Some(bloom_filter) => {
                let removed = self.filter_removed_documents(&bloom_filter, target_id, metadata);
                if i64::from(expected_count) == current_count - removed {
                    BloomFilterApplicationStatus::Success
                } else {
                    BloomFilterApplicationStatus::FalsePositive
                }
            }
            None => BloomFilterApplicationStatus::Skipped,
        };
        debug!(
            "Existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}, bloom filter {status:?}"
        );

        if status != BloomFilterApplicationStatus::Success {
            self.reset_target(target_id, metadata);
            let purpose = if status == BloomFilterApplicationStatus::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn parse_bloom_filter(&self, filter: &ExistenceFilterChange) -> Option<BloomFilter> {
        let params = filter.unchanged_names.as_ref()?;
        match BloomFilter::new(params.bitmap.clone(), params.padding, params.hash_count) {
            Ok(bloom_filter) if bloom_filter.bit_count() > 0 => Some(bloom_filter),
            Ok(_) => None,
            Err(err) => {
                warn!(
                    "Applying bloom filter failed: ({}); ignoring the bloom filter and falling back to full re-query",
                    err.message()
                );
                None
            }
        }
    }

    /// Drops every remote key the bloom filter rules out. Returns how many were dropped.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in metadata.get_remote_keys_for_target(target_id) {
            if !bloom_filter.might_contain(&self.serializer.document_name(&key)) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Packages everything accumulated so far at `snapshot_version` and starts over.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let is_current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);

            if is_current && target_data.target.is_document_target() {
                // A current document target that received no document means the document
                // does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let seen = self
                        .pending_document_target_mapping
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !seen && !self.target_contains_document(target_id, &key, metadata) {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let resolved_limbo_documents = self
            .pending_document_target_mapping
            .iter()
            .filter(|(_, targets)| {
                targets.iter().all(|target_id| {
                    self.target_data_for_active_target(*target_id, metadata)
                        .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
                })
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.record_document_update(document);
    }

    /// Keeps the newest state seen for a key within the current snapshot.
    fn record_document_update(&mut self, document: MutableDocument) {
        let key = document.key().clone();
        if let Some(existing) = self.pending_document_updates.get(&key) {
            if existing.version() > document.version() {
                debug!("Ignoring stale update for {key} at {:?}", document.version());
                return;
            }
        }
        self.pending_document_updates.insert(key, document);
    }

    /// `updated` carries the document's new state when it is known (a deletion); `None`
    /// only takes the key out of the target.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Never raised to the target, so there is nothing to remove.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated {
            self.record_document_update(document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::new());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.get_remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    /// Targets with unacknowledged listen or unlisten requests are not active; changes for
    /// them belong to a previous incarnation.
    fn target_data_for_active_target<'m>(
        &self,
        target_id: TargetId,
        metadata: &'m dyn TargetMetadataProvider,
    ) -> Option<&'m TargetData> {
        let pending = self
            .target_states
            .get(&target_id)
            .is_some_and(TargetState::is_pending);
        if pending {
            None
        } else {
            metadata.get_target_data_for_target(target_id)
        }
    }
}

#[derive(Debug)]
struct TargetState {
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// Starts true so the first event after a listen reports the target.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified | ChangeType::Metadata => {
                    change.modified_documents.insert(key.clone())
                }
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        if self.pending_responses < 0 {
            warn!("Received more target responses than requests");
            self.pending_responses = 0;
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Query, Target};
    use crate::model::{DatabaseId, Timestamp};
    use crate::remote::watch_change::BloomFilterParams;
    use crate::value::ObjectValue;
    use md5::{Digest, Md5};

    #[derive(Default)]
    struct TestMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let target = Query::collection("rooms").unwrap().to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 1));
            self.remote_keys
                .insert(target_id, keys.iter().map(|k| key(k)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            let target = Target::for_document(&key(path));
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
            self.targets.get(&target_id)
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(key(path), version(1), ObjectValue::empty())
    }

    fn target_change(state: TargetChangeState, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange {
            state,
            target_ids,
            resume_token: vec![9],
            read_time: SnapshotVersion::min(),
            cause: None,
        })
    }

    fn document_change(path: &str, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: target_ids,
            removed_target_ids: vec![],
            key: key(path),
            document: doc(path),
        })
    }

    fn aggregator() -> WatchChangeAggregator {
        WatchChangeAggregator::new(JsonProtoSerializer::new(DatabaseId::default("project")))
    }

    #[test]
    fn aggregates_document_changes_into_target_changes() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_watch_change(target_change(TargetChangeState::Add, vec![2]), &metadata);
        aggregator.handle_watch_change(document_change("rooms/a", vec![2]), &metadata);
        aggregator.handle_watch_change(document_change("rooms/b", vec![2]), &metadata);
        aggregator.handle_watch_change(target_change(TargetChangeState::Current, vec![2]), &metadata);

        let event = aggregator.create_remote_event(version(3), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![9]);
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/a")]));
        assert_eq!(change.modified_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
        assert!(event.resolved_limbo_documents.is_empty());

        let next = aggregator.create_remote_event(version(4), &metadata);
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn older_updates_for_a_key_do_not_replace_newer_ones() {
        let metadata = TestMetadata::default().with_query_target(2, &[]);
        let mut aggregator = aggregator();
        for seconds in [5, 3] {
            aggregator.handle_watch_change(
                WatchChange::DocumentChange(DocumentChange {
                    updated_target_ids: vec![2],
                    removed_target_ids: vec![],
                    key: key("rooms/a"),
                    document: MutableDocument::new_found_document(
                        key("rooms/a"),
                        version(seconds),
                        ObjectValue::empty(),
                    ),
                }),
                &metadata,
            );
        }

        let event = aggregator.create_remote_event(version(6), &metadata);
        assert_eq!(event.document_updates[&key("rooms/a")].version(), version(5));
    }

    #[test]
    fn changes_for_pending_targets_are_ignored() {
        let metadata = TestMetadata::default().with_query_target(2, &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_watch_change(document_change("rooms/a", vec![2]), &metadata);

        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn deletes_and_removes_drop_known_documents() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_watch_change(
            WatchChange::DocumentDelete(DocumentDelete {
                key: key("rooms/a"),
                read_time: version(5),
                removed_target_ids: vec![2],
            }),
            &metadata,
        );
        aggregator.handle_watch_change(
            WatchChange::DocumentRemove(DocumentRemove {
                key: key("rooms/b"),
                read_time: version(5),
                removed_target_ids: vec![2],
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(5), &metadata);
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/a"), key("rooms/b")])
        );
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
        assert!(!event.document_updates.contains_key(&key("rooms/b")));
    }

    #[test]
    fn current_document_target_without_document_synthesizes_deletion() {
        let metadata = TestMetadata::default().with_limbo_target(1, "rooms/a");
        let mut aggregator = aggregator();
        aggregator.handle_watch_change(target_change(TargetChangeState::Current, vec![1]), &metadata);

        let event = aggregator.create_remote_event(version(7), &metadata);
        let document = &event.document_updates[&key("rooms/a")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(7));
        assert_eq!(event.resolved_limbo_documents, BTreeSet::from([key("rooms/a")]));
    }

    #[test]
    fn existence_filter_without_bloom_filter_resets_the_target() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_watch_change(
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(3), &metadata);
        assert_eq!(
            event.target_mismatches,
            BTreeMap::from([(2, TargetPurpose::ExistenceFilterMismatch)])
        );
        let change = &event.target_changes[&2];
        assert!(!change.current);
        assert_eq!(change.removed_documents.len(), 2);
    }

    fn bloom_params(names: &[String], bytes: usize, hash_count: u64) -> BloomFilterParams {
        let mut bitmap = vec![0u8; bytes];
        let bit_count = bytes as u64 * 8;
        for name in names {
            let digest = Md5::digest(name.as_bytes());
            let mut low = [0u8; 8];
            let mut high = [0u8; 8];
            low.copy_from_slice(&digest[..8]);
            high.copy_from_slice(&digest[8..]);
            let (h1, h2) = (u64::from_le_bytes(low), u64::from_le_bytes(high));
            for i in 0..hash_count {
                let index = h1.wrapping_add(h2.wrapping_mul(i)) % bit_count;
                bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }
        BloomFilterParams {
            bitmap,
            padding: 0,
            hash_count: hash_count as i32,
        }
    }

    #[test]
    fn bloom_filter_removes_deleted_documents_without_reset() {
        let metadata =
            TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let kept = vec![
            "projects/project/databases/(default)/documents/rooms/a".to_string(),
            "projects/project/databases/(default)/documents/rooms/c".to_string(),
        ];
        let mut aggregator = aggregator();
        aggregator.handle_watch_change(
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 2,
                unchanged_names: Some(bloom_params(&kept, 64, 10)),
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(3), &metadata);
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/b")])
        );
    }

    #[test]
    fn bloom_filter_that_does_not_explain_the_count_resets() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let everything = vec![
            "projects/project/databases/(default)/documents/rooms/a".to_string(),
            "projects/project/databases/(default)/documents/rooms/b".to_string(),
        ];
        let mut aggregator = aggregator();
        aggregator.handle_watch_change(
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(bloom_params(&everything, 64, 10)),
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(3), &metadata);
        assert_eq!(
            event.target_mismatches,
            BTreeMap::from([(2, TargetPurpose::ExistenceFilterMismatchBloom)])
        );
    }

    #[test]
    fn malformed_bloom_filter_falls_back_to_reset() {
        let metadata = TestMetadata::default().with_query_target(2, &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_watch_change(
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: Some(BloomFilterParams {
                    bitmap: vec![1],
                    padding: 9,
                    hash_count: 1,
                }),
            }),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(3), &metadata);
        assert_eq!(
            event.target_mismatches,
            BTreeMap::from([(2, TargetPurpose::ExistenceFilterMismatch)])
        );
    }
}
