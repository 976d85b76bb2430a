use std::time;

pub const DEFAULT_MIN_DURATION: time::Duration = time::Duration::from_millis(100);

/// The position of an operation in its retry sequence: how many retries
/// happened so far, how many are allowed and how long to wait before the
/// next one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryState {
    pub wait: Option<time::Duration>,
    pub total_allowed: u32,
    pub attempt: u32,
}

impl RetryState {
    #[must_use]
    pub fn new(attempt: u32, total_allowed: u32, wait: Option<time::Duration>) -> Self {
        Self {
            wait,
            total_allowed,
            attempt,
        }
    }

    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.attempt < self.total_allowed
    }
}

/// `RetryDecider` decides the parameters of the next attempt from the state
/// of the last one, or ends the sequence by returning None.
pub trait RetryDecider: Send + Sync {
    fn decide(&self, state: RetryState) -> Option<RetryState>;
}
