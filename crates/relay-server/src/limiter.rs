//! Per-identity submission cooldown.
//!
//! Keyed by identity, not connection, so reconnecting (or opening a
//! second tab) does not reset the window.

use std::time::{Duration, Instant};

use dashmap::DashMap;

pub struct CooldownTracker {
    window: Duration,
    last_accepted: DashMap<String, Instant>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: DashMap::new(),
        }
    }

    /// Time left before the identity may submit again. Zero means the
    /// identity is clear to submit.
    pub fn remaining(&self, identity: &str) -> Duration {
        let Some(last) = self.last_accepted.get(identity) else {
            return Duration::ZERO;
        };
        let elapsed = last.elapsed();
        if elapsed >= self.window {
            Duration::ZERO
        } else {
            self.window - elapsed
        }
    }

    /// Record an accepted submission, starting a fresh window. Only
    /// called for accepted messages; rejected attempts do not extend
    /// the cooldown.
    pub fn record(&self, identity: &str) {
        self.last_accepted
            .insert(identity.to_string(), Instant::now());
    }

    /// Drop an identity's window. Called when its last connection goes
    /// away.
    pub fn forget(&self, identity: &str) {
        self.last_accepted.remove(identity);
    }

    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }
}
