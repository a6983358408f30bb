use std::collections::{BTreeMap, BTreeSet};

use crate::engine::Query;
use crate::error::FirestoreResult;
use crate::local::RemoteDocumentCache;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};

#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    documents: BTreeMap<DocumentKey, MutableDocument>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(
        &mut self,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        document.set_read_time(read_time);
        self.documents.insert(document.key().clone(), document);
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.documents.remove(key);
        Ok(())
    }

    fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let collection = query.path();
        self.documents
            .iter()
            .filter(|(key, document)| {
                collection.is_immediate_parent_of(key.path())
                    && document.is_valid_document()
                    && (since_read_time.is_min() || document.read_time() > since_read_time)
            })
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use crate::value::ObjectValue;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn found(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version(seconds),
            ObjectValue::empty(),
        )
    }

    #[test]
    fn collection_scan_skips_nested_documents_and_old_reads() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(found("rooms/a", 1), version(1)).unwrap();
        cache.add_entry(found("rooms/b", 5), version(5)).unwrap();
        cache.add_entry(found("rooms/a/messages/m", 5), version(5)).unwrap();

        let query = Query::collection("rooms").unwrap();
        assert_eq!(
            cache
                .get_documents_matching_query(&query, SnapshotVersion::min())
                .len(),
            2
        );
        let recent = cache.get_documents_matching_query(&query, version(2));
        assert_eq!(recent.len(), 1);
        assert!(recent.contains_key(&DocumentKey::from_string("rooms/b").unwrap()));
    }

    #[test]
    fn unknown_keys_read_as_invalid() {
        let cache = MemoryRemoteDocumentCache::new();
        let document = cache.get_entry(&DocumentKey::from_string("rooms/z").unwrap());
        assert!(!document.is_valid_document());
    }
}
