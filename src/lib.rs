//! Offline-first document synchronization for Firestore clients.
//!
//! A [`FirestoreClient`] keeps live query results up to date from a local cache, applies
//! writes optimistically, and reconciles both with the backend over a watch stream and a
//! write stream. All sync state is owned by one worker task; the client handle only enqueues
//! operations for it.
//!
//! The crate is organised bottom-up:
//!
//! - [`value`] and [`model`]: typed field values, documents, mutations and batches.
//! - [`local`]: the persistence traits, their memory implementation and the [`LocalStore`]
//!   that layers pending writes over cached remote documents.
//! - [`engine`]: queries, views and their snapshots, the [`SyncEngine`] and the
//!   [`EventManager`] that hands snapshots to listeners.
//! - [`remote`]: protocol encoding, the watch and write streams with backoff, and the
//!   aggregation of watch changes into remote events.
//!
//! [`LocalStore`]: local::LocalStore
//! [`SyncEngine`]: engine::SyncEngine
//! [`EventManager`]: engine::EventManager

mod client;
pub mod engine;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
mod settings;
pub mod value;

pub use client::{FirestoreClient, ListenerRegistration};
pub use engine::{ListenOptions, ListenSource, Query, SnapshotObserver, ViewSnapshot};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use remote::OnlineState;
pub use settings::{
    FirestoreSettings, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
    DEFAULT_MAX_PENDING_WRITES,
};
