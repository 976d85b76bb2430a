//! Retry deciders as seen from outside the crate.

use std::time::Duration;

use foundation_reactive::retries::{ExponentialBackoffDecider, RetryDecider, RetryState, SameBackoffDecider};

/// WHY: Redirect following relies on a decider that never waits
/// WHAT: A zero same-backoff keeps granting attempts with no wait until the allowance ends
#[test]
fn zero_backoff_grants_every_allowed_attempt() {
    let decider = SameBackoffDecider::new(Duration::ZERO);
    let mut state = RetryState::new(0, 3, None);
    let mut granted = 0;

    while let Some(next) = decider.decide(state.clone()) {
        assert_eq!(next.wait, Some(Duration::ZERO));
        granted += 1;
        state = next;
    }

    assert_eq!(granted, 3);
    assert_eq!(state.attempt, 3);
}

#[test]
fn exponential_backoff_stays_within_its_bounds() {
    let decider = ExponentialBackoffDecider::from_duration(Duration::from_millis(10), Some(Duration::from_millis(80)));
    let mut state = RetryState::new(0, 6, None);

    while let Some(next) = decider.decide(state.clone()) {
        let wait = next.wait.expect("always waits");
        assert!(wait >= Duration::from_millis(10));
        assert!(wait <= Duration::from_millis(80));
        state = next;
    }

    assert_eq!(state.attempt, 6);
}
