use crate::model::{BatchId, DocumentKey, MutableDocument, Mutation, Timestamp};

/// Net effect of every pending local mutation on one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }

    /// Applies the overlay on top of the remote `document`.
    pub fn apply(&self, document: &mut MutableDocument) {
        self.mutation
            .apply_to_local_view(document, None, Timestamp::now());
    }
}
