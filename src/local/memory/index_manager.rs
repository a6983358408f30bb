use std::collections::{BTreeMap, BTreeSet};

use crate::error::{invalid_argument, FirestoreResult};
use crate::local::IndexManager;
use crate::model::ResourcePath;

/// Collection id to the parent paths it has been seen under.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(
        &mut self,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        if collection_path.len() % 2 != 1 {
            return Err(invalid_argument(format!(
                "Expected a collection path, got {collection_path}"
            )));
        }
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
        Ok(())
    }

    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }
}
