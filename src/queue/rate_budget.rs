//! Sliding-log request budget

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Budget shared by every dispatcher the process creates
pub type SharedBudget = Arc<Mutex<RateBudget>>;

/// Timestamps of dispatches inside the trailing window.
///
/// A dispatch at `t` occupies the window `[t, t + window)`. At most
/// `allowance` dispatches may occupy any window at the same time.
#[derive(Debug)]
pub struct RateBudget {
    allowance: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateBudget {
    pub fn new(allowance: u32, window: Duration) -> Self {
        let allowance = allowance.max(1) as usize;
        Self {
            allowance,
            window,
            stamps: VecDeque::with_capacity(allowance),
        }
    }

    pub fn shared(allowance: u32, window: Duration) -> SharedBudget {
        Arc::new(Mutex::new(Self::new(allowance, window)))
    }

    pub fn allowance(&self) -> usize {
        self.allowance
    }

    /// Change the allowance; stamps already in the window keep counting
    pub fn set_allowance(&mut self, allowance: u32) {
        self.allowance = allowance.max(1) as usize;
    }

    /// Drop stamps that have left the window
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of dispatches currently inside the window
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }

    /// `None` if one more dispatch fits right now, otherwise the instant at
    /// which enough stamps have left the window for one more.
    pub fn next_slot(&mut self, now: Instant) -> Option<Instant> {
        self.prune(now);
        let len = self.stamps.len();
        if len < self.allowance {
            None
        } else {
            self.stamps
                .get(len - self.allowance)
                .map(|&stamp| stamp + self.window)
        }
    }

    /// Record a dispatch. Callers must have seen `next_slot(now) == None`.
    pub fn record(&mut self, now: Instant) {
        debug_assert!(self.stamps.len() < self.allowance);
        self.stamps.push_back(now);
    }
}
