use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::engine::Target;
use crate::error::{internal_error, FirestoreResult};
use crate::local::{ReferenceSet, TargetCache, TargetData};
use crate::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: HashMap<String, TargetId>,
    references: ReferenceSet,
    last_remote_snapshot_version: SnapshotVersion,
    highest_sequence_number: ListenSequenceNumber,
    highest_target_id: TargetId,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            target_ids_by_canonical_id: HashMap::new(),
            references: ReferenceSet::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_sequence_number: 0,
            highest_target_id: 0,
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save(&mut self, target_data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(target_data.target_id);
        self.highest_sequence_number = self
            .highest_sequence_number
            .max(target_data.sequence_number);
        self.target_ids_by_canonical_id
            .insert(target_data.target.canonical_id(), target_data.target_id);
        self.targets.insert(target_data.target_id, target_data);
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&mut self) -> TargetId {
        // Even ids belong to query targets; the sync engine hands out odd ids for limbo.
        let next = if self.highest_target_id % 2 == 0 {
            self.highest_target_id + 2
        } else {
            self.highest_target_id + 1
        };
        self.highest_target_id = next;
        next
    }

    fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_target_snapshot_version(&mut self, version: SnapshotVersion) -> FirestoreResult<()> {
        self.last_remote_snapshot_version = version;
        Ok(())
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if self.targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Target {} is already cached",
                target_data.target_id
            )));
        }
        self.save(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if !self.targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Cannot update unknown target {}",
                target_data.target_id
            )));
        }
        self.save(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(target_data) = self.targets.remove(&target_id) {
            self.target_ids_by_canonical_id
                .remove(&target_data.target.canonical_id());
        }
        self.references.remove_references_for_id(target_id);
        Ok(())
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.targets.get(target_id))
            .cloned()
    }

    fn add_matching_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        self.references.add_references(keys, target_id);
        Ok(())
    }

    fn remove_matching_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        self.references.remove_references(keys, target_id);
        Ok(())
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.references.remove_references_for_id(target_id);
        Ok(())
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.referenced_keys(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Query;
    use crate::local::TargetPurpose;

    #[test]
    fn allocates_even_target_ids() {
        let mut cache = MemoryTargetCache::new();
        assert_eq!(cache.allocate_target_id(), 2);
        assert_eq!(cache.allocate_target_id(), 4);
    }

    #[test]
    fn looks_up_targets_by_canonical_id() {
        let mut cache = MemoryTargetCache::new();
        let target = Query::collection("rooms").unwrap().to_target();
        let target_id = cache.allocate_target_id();
        cache
            .add_target_data(TargetData::new(target.clone(), target_id, TargetPurpose::Listen, 7))
            .unwrap();

        let found = cache.get_target_data(&target).unwrap();
        assert_eq!(found.target_id, target_id);
        assert_eq!(cache.highest_sequence_number(), 7);

        let key = DocumentKey::from_string("rooms/a").unwrap();
        cache
            .add_matching_keys(&BTreeSet::from([key.clone()]), target_id)
            .unwrap();
        assert!(cache.contains_key(&key));

        cache.remove_target_data(target_id).unwrap();
        assert!(cache.get_target_data(&target).is_none());
        assert!(!cache.contains_key(&key));
    }
}
