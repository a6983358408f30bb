use crate::error::FirestoreErrorCode;

/// Whether retrying the same request can never succeed.
///
/// Transient failures (unavailable, deadline exceeded, aborted, ...) and authentication
/// failures, which are retried with a fresh token, are not permanent.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated
        | FirestoreErrorCode::StorageUnavailable => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Aborted writes are retried; the commit raced with another transaction.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(!is_permanent_error(FirestoreErrorCode::Unavailable));
        assert!(!is_permanent_error(FirestoreErrorCode::Unauthenticated));
        assert!(!is_permanent_error(FirestoreErrorCode::ResourceExhausted));
        assert!(is_permanent_error(FirestoreErrorCode::PermissionDenied));
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
    }

    #[test]
    fn aborted_writes_are_retried() {
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::FailedPrecondition));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Unavailable));
    }
}
