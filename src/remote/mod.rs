//! Everything that talks to the backend: protocol encoding, the watch and write streams, and
//! the reconciliation of watch changes into remote events.

mod backoff;
pub mod bloom_filter;
pub mod datastore;
mod online_state_tracker;
mod remote_event;
mod remote_store;
mod remote_syncer;
pub mod rpc_error;
mod serializer;
mod stream;
mod structured_query;
pub mod watch_change;
mod watch_change_aggregator;

pub use backoff::{BackoffSettings, ExponentialBackoff};
pub use bloom_filter::BloomFilter;
pub use datastore::{
    Connection, Datastore, NoopTokenProvider, StreamHandle, StreamKind, TokenProvider,
    TokenProviderArc,
};
pub use online_state_tracker::{OnlineState, OnlineStateTracker, ONLINE_STATE_TIMEOUT};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use stream::{PersistentStream, StreamEvent, StreamEventSink, StreamState};
pub use watch_change::{decode_watch_change, WatchChange};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
