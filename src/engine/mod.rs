//! Queries, views and the components that keep views in sync with local and remote state.

mod document_set;
mod event_manager;
mod filter;
mod query;
mod sync_engine;
mod target;
mod view;
mod view_snapshot;

pub use document_set::{DocumentComparator, DocumentSet};
pub use event_manager::{
    EventManager, ListenOptions, ListenSource, ListenerId, OnlineStateHandler, QueryListener,
    SnapshotObserver,
};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, Operator};
pub use query::{Bound, Direction, LimitType, OrderBy, Query};
pub use sync_engine::{RemoteRequest, Reply, SyncEngine, SyncEngineEvent};
pub use target::Target;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
