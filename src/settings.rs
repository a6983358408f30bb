//! Client configuration.

use std::time::Duration;

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::DatabaseId;
use crate::remote::BackoffSettings;

/// Default cap on limbo documents resolved at the same time.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Default time an open stream may sit unused before it is closed (60 seconds).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of batches in flight on the write stream.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;

/// Settings for one [`FirestoreClient`](crate::FirestoreClient).
#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    database_id: DatabaseId,
    max_concurrent_limbo_resolutions: usize,
    backoff: BackoffSettings,
    idle_timeout: Duration,
    online_state_timeout: Duration,
    max_pending_writes: usize,
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: crate::remote::ONLINE_STATE_TIMEOUT,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn backoff(&self) -> &BackoffSettings {
        &self.backoff
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn online_state_timeout(&self) -> Duration {
        self.online_state_timeout
    }

    pub fn max_pending_writes(&self) -> usize {
        self.max_pending_writes
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> FirestoreResult<Self> {
        if value == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        self.max_concurrent_limbo_resolutions = value;
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> FirestoreResult<Self> {
        if backoff.multiplier < 1.0 {
            return Err(invalid_argument("backoff multiplier must be at least 1.0"));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(invalid_argument(
                "backoff initial_delay must not exceed max_delay",
            ));
        }
        self.backoff = backoff;
        Ok(self)
    }

    pub fn with_idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }

    pub fn with_online_state_timeout(mut self, value: Duration) -> Self {
        self.online_state_timeout = value;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> FirestoreResult<Self> {
        if value == 0 {
            return Err(invalid_argument("max_pending_writes must be greater than zero"));
        }
        self.max_pending_writes = value;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = FirestoreSettings::new(DatabaseId::default("project"));
        assert_eq!(settings.max_concurrent_limbo_resolutions(), 100);
        assert_eq!(settings.max_pending_writes(), 10);
        assert_eq!(settings.idle_timeout(), Duration::from_secs(60));
        assert_eq!(settings.online_state_timeout(), Duration::from_secs(10));
        assert_eq!(settings.backoff().initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn setters_validate() {
        let settings = FirestoreSettings::new(DatabaseId::default("project"));
        let err = settings
            .clone()
            .with_max_concurrent_limbo_resolutions(0)
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(settings
            .clone()
            .with_backoff(BackoffSettings {
                initial_delay: Duration::from_secs(5),
                multiplier: 2.0,
                max_delay: Duration::from_secs(1),
            })
            .is_err());
        assert_eq!(
            settings.with_max_pending_writes(3).unwrap().max_pending_writes(),
            3
        );
    }
}
