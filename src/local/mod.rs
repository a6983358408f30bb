//! Local persistence and the local store built on top of it.

mod local_documents_view;
mod local_store;
pub mod memory;
mod persistence;
mod reference_set;
mod target_data;

pub use local_store::{
    DocumentMap, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
pub use memory::MemoryPersistence;
pub use persistence::{
    run_transaction, DocumentOverlayCache, IndexManager, MutationQueue, Persistence,
    PersistenceTransaction, RemoteDocumentCache, TargetCache, TransactionBody, TransactionMode,
};
pub use reference_set::ReferenceSet;
pub use target_data::{TargetData, TargetPurpose};
