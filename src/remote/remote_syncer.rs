use std::collections::BTreeSet;

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, User};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;

/// Callbacks from the remote store into the component that owns local state.
///
/// The remote store borrows its syncer for the duration of each call instead of holding a
/// reference, so both can be owned by the client loop.
pub trait RemoteSyncer {
    /// Applies one consistent snapshot from the watch stream.
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to listen to `target_id`.
    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()>;

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the target matched in the last snapshot raised for it, including documents added
    /// to resolve limbo.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First queued batch after `after`, or the first batch overall.
    fn next_mutation_batch(&mut self, after: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion>;

    fn apply_online_state_change(&mut self, state: OnlineState);

    /// Switches local state to `user`; called while the streams are down.
    fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()>;
}
