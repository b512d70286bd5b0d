//! Auto-reconnect policy
//!
//! Flat delay plus uniform jitter, bounded attempts. No exponential growth.

use crate::constants::{
    MIN_RECONNECT_DELAY_MS, RECONNECT_BASE_DELAY_MS, RECONNECT_JITTER_MS, RECONNECT_MAX_ATTEMPTS,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect settings, read each time a reconnect is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Retry after transient failures
    pub enabled: bool,
    /// Flat delay before each attempt (clamped to >= 500 ms)
    pub base_delay_ms: u64,
    /// Upper bound (exclusive) of the random extra delay
    pub jitter_ms: u64,
    /// Attempts before giving up (clamped to >= 1)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: RECONNECT_BASE_DELAY_MS,
            jitter_ms: RECONNECT_JITTER_MS,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Policy with auto-reconnect turned off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Apply the lower bounds on delay and attempts
    pub fn normalized(self) -> Self {
        Self {
            base_delay_ms: self.base_delay_ms.max(MIN_RECONNECT_DELAY_MS),
            max_attempts: self.max_attempts.max(1),
            ..self
        }
    }

    /// Delay for a given jitter roll
    ///
    /// `roll` is reduced into `[0, jitter_ms)`.
    pub fn delay_for_roll(&self, roll: u64) -> Duration {
        let policy = self.normalized();
        let jitter = if policy.jitter_ms == 0 {
            0
        } else {
            roll % policy.jitter_ms
        };
        Duration::from_millis(policy.base_delay_ms + jitter)
    }

    /// Delay for the next attempt: `base + random(0, jitter)`
    pub fn next_delay(&self) -> Duration {
        let roll = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        self.delay_for_roll(roll)
    }
}
