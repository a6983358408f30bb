use std::fmt::{Display, Formatter};

use crate::model::Timestamp;

/// Version of a document or of a watch snapshot, as assigned by the backend.
///
/// `SnapshotVersion::min()` marks "no version": documents that were never read from the
/// backend and targets that never received a consistent snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_first() {
        let later = SnapshotVersion::new(Timestamp::new(1, 0));
        assert!(SnapshotVersion::min() < later);
        assert!(SnapshotVersion::default().is_min());
    }
}
