use std::sync::Mutex;
use std::time;

use super::{RetryDecider, RetryState, DEFAULT_MIN_DURATION};
use crate::sync::lock;

/// Grows the wait by `factor` per attempt, jittered and kept within
/// `min_duration..=max_duration`.
#[derive(Debug)]
pub struct ExponentialBackoffDecider {
    pub factor: u32,
    pub jitter: f32,
    pub min_duration: time::Duration,
    pub max_duration: time::Duration,
    rng: Mutex<fastrand::Rng>,
}

const DEFAULT_JITTER: f32 = 0.6;
const DEFAULT_FACTOR: u32 = 3;

impl Default for ExponentialBackoffDecider {
    fn default() -> Self {
        Self::new(DEFAULT_FACTOR, DEFAULT_JITTER, DEFAULT_MIN_DURATION, None)
    }
}

impl Clone for ExponentialBackoffDecider {
    fn clone(&self) -> Self {
        Self::new(self.factor, self.jitter, self.min_duration, self.max_duration)
    }
}

impl ExponentialBackoffDecider {
    /// # Panics
    ///
    /// When `jitter` is not strictly between 0 and 1.
    pub fn new(
        factor: u32,
        jitter: f32,
        min_duration: time::Duration,
        max_duration: impl Into<Option<time::Duration>>,
    ) -> Self {
        assert!(
            jitter > 0f32 && jitter < 1f32,
            "<exponential-backoff>: jitter must be between 0 and 1."
        );
        Self {
            factor,
            jitter,
            min_duration,
            rng: Mutex::new(fastrand::Rng::new()),
            max_duration: max_duration.into().unwrap_or(time::Duration::MAX),
        }
    }

    pub fn from_duration(
        min_duration: time::Duration,
        max_duration: impl Into<Option<time::Duration>>,
    ) -> Self {
        Self::new(DEFAULT_FACTOR, DEFAULT_JITTER, min_duration, max_duration)
    }
}

impl RetryDecider for ExponentialBackoffDecider {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn decide(&self, state: RetryState) -> Option<RetryState> {
        if !state.can_retry() {
            return None;
        }

        let next_attempt = state.attempt.saturating_add(1);
        let exponent = self.factor.saturating_pow(next_attempt);
        let duration = self.min_duration.saturating_mul(exponent);

        // Jitter in hundredths to stay in integer arithmetic.
        let jitter_factor = ((self.jitter * 100f32) as u32).max(1);
        let random = lock(&self.rng).u32(0..jitter_factor * 2);

        let mut duration = duration.saturating_mul(100);
        if random < jitter_factor {
            let jitter = duration.saturating_mul(random) / 100;
            duration = duration.saturating_sub(jitter);
        } else {
            let jitter = duration.saturating_mul(random / 2) / 100;
            duration = duration.saturating_add(jitter);
        }
        duration /= 100;

        Some(RetryState {
            wait: Some(duration.clamp(self.min_duration, self.max_duration)),
            attempt: next_attempt,
            total_allowed: state.total_allowed,
        })
    }
}
