use std::future::Future;
use std::time::Duration;

use super::{RetryDecider, RetryState};

/// Runs `attempt` until it succeeds, fails with an error `classify` rejects,
/// or the decider runs out of retries.
///
/// `classify` returns `Ok(err)` for errors worth another attempt and
/// `Err(err)` for errors that end the sequence. When the allowance is used
/// up the last retryable error is returned as is.
///
/// # Errors
///
/// The error of the last attempt.
pub async fn retry_when<D, T, E, A, Fut, C>(
    decider: &D,
    total_allowed: u32,
    mut attempt: A,
    mut classify: C,
) -> Result<T, E>
where
    D: RetryDecider + ?Sized,
    A: FnMut(RetryState) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(E) -> Result<E, E>,
{
    let mut state = RetryState::new(0, total_allowed, None);
    loop {
        let err = match attempt(state.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify(err) {
                Ok(retryable) => retryable,
                Err(fatal) => return Err(fatal),
            },
        };

        let Some(next) = decider.decide(state) else {
            tracing::debug!("Retry allowance of {total_allowed} used up");
            return Err(err);
        };
        if let Some(wait) = next.wait.filter(|wait| *wait > Duration::ZERO) {
            tracing::trace!("Retrying attempt {} after {wait:?}", next.attempt);
            tokio::time::sleep(wait).await;
        }
        state = next;
    }
}
