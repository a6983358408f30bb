use crate::engine::Target;
use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A user query.
    Listen,
    /// Re-listen after an existence filter mismatch that carried no bloom filter, or whose
    /// bloom filter could not be applied.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter was applied and the counts still disagreed.
    ExistenceFilterMismatchBloom,
    /// Single-document target resolving a limbo document.
    LimboResolution,
}

impl TargetPurpose {
    /// Value of the `goog-listen-tags` label attached to the listen request, if any.
    pub fn listen_label(&self) -> Option<&'static str> {
        match self {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// Bookkeeping for one listened target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target's view last had no limbo documents; queries can be served
    /// from the cache up to this point.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque server cursor; empty when the target was never current.
    pub resume_token: Vec<u8>,
    /// Number of documents the target held when `resume_token` was issued, sent on resume so
    /// the backend can answer with an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume token; resets the expected count, which only applies to the old token.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
