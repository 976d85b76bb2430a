//! Redirects as retries.
//!
//! WHY: A followed redirect is just another attempt against a new target, so
//! it rides the same retry machinery a failed connect would, with no wait
//! between attempts.
//!
//! WHAT: `RedirectBridge` tracks the active target and the history of visited
//! URIs across attempts. It stamps each new channel with the history, and it
//! turns a `Redirect` failure into the next attempt's target.
//!
//! HOW: `execute` drives `ConnectionDriver::acquire` through `retry_when`
//! with a zero-wait `SameBackoffDecider` allowing `MAX_REDIRECTS` retries.
//! Only `Redirect` is retryable. The exchange itself refuses to emit one once
//! the history is full, so the final 3xx reaches the caller as `HttpStatus`.

use std::sync::Mutex;
use std::time::Duration;

use super::driver::{ChannelInitializer, ConnectionDriver, RequestHandler, RequestOptions};
use super::{ClientResponse, HttpClientError, HttpClientResult, RedirectHistory, Target, MAX_REDIRECTS};
use crate::channel::Channel;
use crate::http::HttpMethod;
use crate::retries::{retry_when, SameBackoffDecider};
use crate::sync::lock;

#[derive(Debug)]
pub struct RedirectBridge {
    active: Mutex<Target>,
    history: Mutex<RedirectHistory>,
}

impl RedirectBridge {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            active: Mutex::new(target),
            history: Mutex::new(RedirectHistory::new()),
        }
    }

    /// The target the next attempt connects to.
    #[must_use]
    pub fn active(&self) -> Target {
        lock(&self.active).clone()
    }

    #[must_use]
    pub fn history(&self) -> RedirectHistory {
        lock(&self.history).clone()
    }

    /// Moves to `location`, resolved against the active target, and records
    /// the active target as visited.
    ///
    /// # Errors
    ///
    /// `InvalidLocation` when `location` cannot be resolved.
    pub fn follow(&self, location: &str) -> HttpClientResult<Target> {
        let mut active = lock(&self.active);
        let next = active.resolve(location)?;
        let mut history = lock(&self.history);
        *history = history.with_appended(active.as_str());
        tracing::debug!("Following redirect from {} to {next}", *active);
        *active = next.clone();
        Ok(next)
    }

    /// Runs attempts until one produces a response or a failure that is not
    /// a followed redirect.
    ///
    /// # Errors
    ///
    /// The failure of the last attempt. A redirect that could not be
    /// followed further surfaces as `HttpStatus`.
    pub async fn execute(
        &self,
        driver: &ConnectionDriver,
        method: &HttpMethod,
        options: &RequestOptions,
        handler: Option<&RequestHandler>,
    ) -> HttpClientResult<ClientResponse> {
        let decider = SameBackoffDecider::new(Duration::ZERO);
        let outcome = retry_when(
            &decider,
            u32::try_from(MAX_REDIRECTS).unwrap_or(u32::MAX),
            |_state| {
                let target = self.active();
                async move { driver.acquire(&target, method, options, handler, Some(self)).await }
            },
            |err: HttpClientError| -> HttpClientResult<HttpClientError> {
                if let HttpClientError::Redirect { location, .. } = &err {
                    self.follow(location)?;
                    return Ok(err);
                }
                Err(err)
            },
        )
        .await;

        outcome.map_err(|err| match err {
            HttpClientError::Redirect { status, .. } => HttpClientError::HttpStatus(status),
            other => other,
        })
    }
}

impl ChannelInitializer for RedirectBridge {
    fn on_channel_init(&self, channel: &Channel) {
        channel.stamp_redirect_history(self.history());
    }
}
