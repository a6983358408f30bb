use std::time::Duration;

use log::{debug, warn};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Connecting; views keep their current state.
    Unknown,
    /// The watch stream received a message.
    Online,
    /// Connecting failed or took too long; views raise cache-only snapshots.
    Offline,
}

/// Failed connection attempts tolerated before going offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Time allowed for the watch stream to become healthy before going offline.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Derives the [`OnlineState`] from watch stream health.
///
/// The tracker does not run timers itself. [`handle_watch_stream_start`] returns a timer token
/// when one should be armed; the owner sleeps [`ONLINE_STATE_TIMEOUT`] and reports back through
/// [`handle_timeout`], which ignores tokens that were cancelled in between.
///
/// [`handle_watch_stream_start`]: OnlineStateTracker::handle_watch_stream_start
/// [`handle_timeout`]: OnlineStateTracker::handle_timeout
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<u64>,
    next_timer: u64,
    should_warn_offline: bool,
}

impl Default for OnlineStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timer: None,
            next_timer: 0,
            should_warn_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Returns a timer token to arm when the attempt starts from the unknown state.
    pub fn handle_watch_stream_start(&mut self) -> Option<u64> {
        if self.watch_stream_failures != 0 || self.state != OnlineState::Unknown || self.timer.is_some() {
            return None;
        }
        self.next_timer += 1;
        self.timer = Some(self.next_timer);
        self.timer
    }

    pub fn handle_timeout(&mut self, token: u64) -> Option<OnlineState> {
        if self.timer != Some(token) {
            return None;
        }
        self.timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline_warning(&format!(
            "Backend didn't respond within {} seconds.",
            ONLINE_STATE_TIMEOUT.as_secs()
        ));
        self.set_and_report(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, reason: &str) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy stream dropped; give the reconnect a chance before going offline.
            return self.set_and_report(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.timer = None;
            self.log_offline_warning(&format!(
                "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {reason}"
            ));
            return self.set_and_report(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition, e.g. `Online` after a watch message or `Offline` when the network
    /// is disabled. Clears the failure count and any pending timer.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.timer = None;
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_offline = false;
        }
        self.set_and_report(state)
    }

    fn set_and_report(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        debug!("Online state {:?} -> {:?}", self.state, state);
        self.state = state;
        Some(state)
    }

    fn log_offline_warning(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode until it can reach the backend."
        );
        if self.should_warn_offline {
            warn!("{message}");
            self.should_warn_offline = false;
        } else {
            debug!("{message}");
        }
    }
}
