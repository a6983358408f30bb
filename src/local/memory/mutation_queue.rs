use std::collections::{BTreeMap, BTreeSet};

use crate::error::{internal_error, invalid_argument, FirestoreResult};
use crate::local::MutationQueue;
use crate::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};

#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    batches: BTreeMap<BatchId, MutationBatch>,
    /// (key, batch id) pairs so batches touching a key are found without a scan.
    batches_by_key: BTreeSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            batches: BTreeMap::new(),
            batches_by_key: BTreeSet::new(),
            next_batch_id: 1,
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches must not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        for key in batch.keys() {
            self.batches_by_key.insert((key, batch_id));
        }
        self.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.batches.get(&batch_id).cloned()
    }

    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch.clone())
    }

    fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.batches.values().cloned().collect()
    }

    fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let mut ids = BTreeSet::new();
        for key in keys {
            ids.extend(
                self.batches_by_key
                    .range((key.clone(), BatchId::MIN)..=(key.clone(), BatchId::MAX))
                    .map(|(_, batch_id)| *batch_id),
            );
        }
        ids.iter()
            .filter_map(|batch_id| self.batches.get(batch_id).cloned())
            .collect()
    }

    fn remove_mutation_batch(&mut self, batch_id: BatchId) -> FirestoreResult<()> {
        let batch = self.batches.remove(&batch_id).ok_or_else(|| {
            internal_error(format!("Cannot remove unknown mutation batch {batch_id}"))
        })?;
        for key in batch.keys() {
            self.batches_by_key.remove(&(key, batch_id));
        }
        Ok(())
    }
}
