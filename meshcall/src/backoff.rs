// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Exponential backoff with jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay after the first failure.
    #[serde(with = "crate::config::duration")]
    pub base_delay: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Randomization factor in `[0, 1]`.
    pub jitter: f64,
    /// Upper bound of the delay.
    #[serde(with = "crate::config::duration")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    /// Sets the delay after the first failure.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the randomization factor.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the upper bound.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// The delay before retry number `retries` (zero-based).
    pub fn delay(&self, retries: u32) -> Duration {
        if retries == 0 {
            return self.base_delay;
        }
        let max = self.max_delay.as_secs_f64();
        let mut secs = self.base_delay.as_secs_f64();
        for _ in 0..retries {
            secs *= self.multiplier;
            if secs >= max {
                secs = max;
                break;
            }
        }
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            secs *= 1.0 + jitter * rand::thread_rng().gen_range(-1.0..1.0);
        }
        Duration::try_from_secs_f64(secs.max(0.0)).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
