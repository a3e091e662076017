//! Decides what happens after an app's process exits: restart it after a
//! backoff delay, leave it stopped, or give up on a crash loop.

use std::{collections::VecDeque, time::Duration};

use serde::Deserialize;
use tokio::time::Instant;

use crate::process::ExitOutcome;

/// Which exits are eligible for an automatic restart.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Restart after any exit that was not requested.
    Always,

    /// Restart only after a failure (anything other than exit code 0).
    OnFailure,

    /// Never restart automatically.
    Never,
}

impl Default for RestartMode {
    fn default() -> Self {
        Self::Always
    }
}

/// Outcome of a restart decision.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Decision {
    /// Start the process again once `after` has elapsed.
    Restart { after: Duration },

    /// Leave the app stopped.
    Stop,

    /// Too many failures inside the failure window; stop restarting
    /// until an operator intervenes.
    GiveUp,
}

/// Restart policy parameters.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RestartPolicy {
    pub mode: RestartMode,

    /// Delay before the first restart after a healthy run.
    pub min_backoff: Duration,

    /// Upper bound for the doubling backoff delay.
    pub max_backoff: Duration,

    /// Uptime after which a run counts as healthy, resetting the
    /// backoff delay.
    pub reset_after: Duration,

    /// Sliding window in which failures are counted.
    pub failure_window: Duration,

    /// Number of failures tolerated inside the window; one more than
    /// this gives up.
    pub max_failures: usize,

    /// Number of exits retained in the history.
    pub history_len: usize,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::default(),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            reset_after: Duration::from_secs(10),
            failure_window: Duration::from_secs(60),
            max_failures: 5,
            history_len: 32,
        }
    }
}

impl RestartPolicy {
    /// Creates an empty history sized for this policy.
    pub fn history(&self) -> RestartHistory {
        RestartHistory::new(self.history_len, self.failure_window, self.reset_after)
    }

    /// Decides what to do after `outcome`, given the exits that preceded
    /// it. `outcome` must not have been recorded in `history` yet.
    pub fn decide(&self, outcome: &ExitOutcome, history: &RestartHistory) -> Decision {
        if outcome.requested {
            return Decision::Stop;
        }

        match self.mode {
            RestartMode::Never => return Decision::Stop,
            RestartMode::OnFailure if outcome.is_clean() => return Decision::Stop,
            RestartMode::OnFailure | RestartMode::Always => {}
        }

        let mut failures = history.failures_within(self.failure_window, outcome.at);
        if outcome.is_failure() {
            failures += 1;
        }

        if failures > self.max_failures {
            return Decision::GiveUp;
        }

        Decision::Restart {
            after: self.backoff(outcome, history),
        }
    }

    /// Backoff delay before restarting after `outcome`: the minimum after
    /// a healthy run, otherwise doubled for every unhealthy exit in the
    /// current streak, capped at the maximum.
    pub fn backoff(&self, outcome: &ExitOutcome, history: &RestartHistory) -> Duration {
        if outcome.is_healthy(self.reset_after) {
            return self.min_backoff;
        }

        u32::try_from(history.consecutive_crashes())
            .ok()
            .and_then(|streak| 2u32.checked_pow(streak))
            .and_then(|factor| self.min_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Recent exits of one app, oldest first.
///
/// The history is bounded both in length and in age: entries older than
/// the retention window (measured from the newest entry) are evicted
/// before any younger entry.
#[derive(Clone, Debug)]
pub struct RestartHistory {
    entries: VecDeque<ExitOutcome>,
    capacity: usize,
    retention: Duration,
    reset_after: Duration,
    consecutive_crashes: usize,
}

impl RestartHistory {
    pub fn new(capacity: usize, retention: Duration, reset_after: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            retention,
            reset_after,
            consecutive_crashes: 0,
        }
    }

    /// Archives an exit, evicting the oldest entries that no longer fit.
    pub fn record(&mut self, outcome: ExitOutcome) {
        if outcome.requested || outcome.is_healthy(self.reset_after) {
            self.consecutive_crashes = 0;
        } else {
            self.consecutive_crashes += 1;
        }

        let newest = outcome.at;
        self.entries.push_back(outcome);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        while let Some(oldest) = self.entries.front() {
            if newest.saturating_duration_since(oldest.at) > self.retention {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Forgets every exit, resetting the backoff streak.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.consecutive_crashes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExitOutcome> {
        self.entries.iter()
    }

    /// Number of unhealthy exits since the last healthy run or requested
    /// stop. Not affected by eviction.
    pub fn consecutive_crashes(&self) -> usize {
        self.consecutive_crashes
    }

    /// Counts the failures that happened no more than `window` before
    /// `now`.
    pub fn failures_within(&self, window: Duration, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|outcome| outcome.is_failure())
            .filter(|outcome| now.saturating_duration_since(outcome.at) <= window)
            .count()
    }
}
