//! In-memory persistence. Nothing survives the process; a transaction that fails is rolled
//! back by restoring a snapshot of the stores taken when it started.

mod document_overlay_cache;
mod index_manager;
mod mutation_queue;
mod remote_document_cache;
mod target_cache;

use std::collections::HashMap;

use log::debug;

use crate::error::{failed_precondition, FirestoreResult};
use crate::local::{
    Persistence, PersistenceTransaction, TargetCache, TransactionBody, TransactionMode,
};
use crate::model::{ListenSequenceNumber, User};

pub use document_overlay_cache::MemoryDocumentOverlayCache;
pub use index_manager::MemoryIndexManager;
pub use mutation_queue::MemoryMutationQueue;
pub use remote_document_cache::MemoryRemoteDocumentCache;
pub use target_cache::MemoryTargetCache;

#[derive(Clone, Debug, Default)]
struct MemoryStores {
    mutation_queues: HashMap<String, MemoryMutationQueue>,
    document_overlays: HashMap<String, MemoryDocumentOverlayCache>,
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    index_manager: MemoryIndexManager,
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    stores: MemoryStores,
    user: User,
    started: bool,
    sequence_number: ListenSequenceNumber,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn start(&mut self) -> FirestoreResult<()> {
        self.started = true;
        self.sequence_number = self.stores.target_cache.highest_sequence_number();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.started = false;
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn set_user(&mut self, user: &User) {
        self.user = user.clone();
    }

    fn transaction_scope(
        &mut self,
        label: &str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()> {
        if !self.started {
            return Err(failed_precondition(format!(
                "Persistence is not started; cannot run transaction '{label}'"
            )));
        }
        debug!("Starting transaction: {label} ({mode:?})");

        let backup = (!mode.is_read_only()).then(|| self.stores.clone());
        if !mode.is_read_only() {
            self.sequence_number += 1;
        }

        let user_key = self.user.key().to_string();
        let stores = &mut self.stores;
        let mut txn = PersistenceTransaction {
            mutation_queue: stores.mutation_queues.entry(user_key.clone()).or_default(),
            remote_documents: &mut stores.remote_documents,
            target_cache: &mut stores.target_cache,
            document_overlays: stores.document_overlays.entry(user_key).or_default(),
            index_manager: &mut stores.index_manager,
            current_sequence_number: self.sequence_number,
        };
        let result = body(&mut txn);

        if let (Err(err), Some(backup)) = (&result, backup) {
            debug!("Rolling back transaction {label}: {err}");
            self.stores = backup;
        }
        result
    }
}
